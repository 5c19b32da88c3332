//! Command execution and file transfer inside running sandboxes.

mod gateway;
mod transport;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use gateway::*;
pub use transport::*;
