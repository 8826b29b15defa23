//! Job submission, status queries and deployment assembly.
//!
//! The [`Commander`] validates jobs, allocates them in the state store and
//! publishes one queue message per work item. [`deploy`] turns a
//! [`Deployment`] into the backends both the commander and the worker pool
//! run on.

mod commander;
pub mod deploy;

pub use commander::{Commander, ItemResult, Submission};
pub use deploy::{BootstrapError, Deployment, DeploymentMode, Role, assemble};
