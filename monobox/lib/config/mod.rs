//! Configuration types and defaults for the monobox controller.

mod controller;
mod defaults;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use controller::*;
pub use defaults::*;
