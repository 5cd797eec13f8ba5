//! Configuration types and helpers.

mod defaults;
mod project;
mod settings;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use project::*;
pub use settings::*;
