//! Named variable sets and config-file bundles per project.

mod manager;
mod model;
mod secret;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use manager::*;
pub use model::*;
pub use secret::*;
