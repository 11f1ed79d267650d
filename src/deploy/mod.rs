// ABOUTME: Deployment orchestration: per-host sequencing, rollback, multi-host coordination.
// ABOUTME: Exports the Deployer, DeploymentCoordinator, RollbackManager, and Service model.

mod cancel;
mod coordinator;
mod deployer;
mod error;
mod rollback;
mod service;

pub use cancel::{CancelHandle, CancelToken};
pub use coordinator::DeploymentCoordinator;
pub use deployer::{Deployer, DeployerOptions};
pub use error::DeployError;
pub use rollback::{RollbackManager, StepFuture};
pub use service::{deploy_order, Service};
