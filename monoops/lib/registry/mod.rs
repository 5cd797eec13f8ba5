//! Collaborator interfaces: project lookup and audit persistence.

mod audit;
mod project;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use audit::*;
pub use project::*;
