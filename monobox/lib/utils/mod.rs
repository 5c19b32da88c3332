//! Small helpers shared across the controller.

mod names;
mod retry;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use names::*;
pub use retry::*;
