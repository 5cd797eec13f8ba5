//! Resource allocation for running projects.
//!
//! The [`ResourceAllocator`] turns a [`ResourceRequirements`] request into concrete
//! [`ResourceLimits`], applies them through the first [`LimitEnforcer`] that works on this host,
//! and keeps a rolling usage history used for prediction, optimization and auto-scaling.

mod allocator;
mod enforcer;
mod model;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use allocator::*;
pub use enforcer::*;
pub use model::*;
