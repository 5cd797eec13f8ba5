//! Deployment pipelines with health checks, rollback and blue-green cycles.

mod assistant;
mod health;
mod model;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use assistant::*;
pub use health::*;
pub use model::*;
