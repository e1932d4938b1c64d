//! Resource model shared by the controller and its collaborators.
//!
//! - `job`: the training job resource, its roles and policies
//! - `status`: job status, conditions and the condition update rules
//! - `unit`: workload units and discovery records created on behalf of a job

mod job;
mod status;
mod unit;

pub use job::*;
pub use status::*;
pub use unit::*;
