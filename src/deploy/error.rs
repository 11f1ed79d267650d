// ABOUTME: Error types for deployment orchestration.
// ABOUTME: Covers validation, health gating, locking, rollback, and multi-host failures.

use crate::state::VersionTag;

/// Errors that can occur while orchestrating a deployment.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// The rollout was cancelled cooperatively after a sibling failure.
    #[error("deployment cancelled")]
    Cancelled,

    /// The health gate did not pass within its bound.
    #[error("health gate timed out after {0} seconds")]
    HealthGateTimeout(u64),

    /// A service's dependency graph contains a cycle.
    #[error("cyclic dependency detected at service {0}")]
    CyclicDependency(String),

    /// A service depends on a service that does not exist.
    #[error("service {service} depends on unknown service {dependency}")]
    UnknownDependency { service: String, dependency: String },

    /// A placement constraint names a host not supplied to the tool.
    #[error("service {service} requires host {host} which was not provided")]
    PlacementUnknownHost { service: String, host: String },

    /// A single host's deployment failed.
    #[error("deployment failed on {host}: {source}")]
    HostFailed {
        host: String,
        #[source]
        source: Box<DeployError>,
    },

    /// Lock acquisition failed on at least one host; nothing destructive ran.
    #[error("failed to acquire all locks: {0}")]
    LockAcquisition(String),

    /// Rollback completed with failures; every failure is listed.
    #[error("rollback failed with {} errors: {}", .failures.len(), .failures.join("; "))]
    RollbackFailed { failures: Vec<String> },

    /// The deployment failed and the subsequent rollback failed too.
    #[error("{deploy}; rollback also failed: {rollback}")]
    RollbackAlsoFailed {
        deploy: Box<DeployError>,
        rollback: Box<DeployError>,
    },

    /// Rollback failed on some hosts.
    #[error("rollback failed on some hosts: {}", .failures.join("; "))]
    MultiHostRollback { failures: Vec<String> },

    /// There is no previous version recorded to roll back to.
    #[error("no deployment recorded for host {0}, nothing to roll back to")]
    NothingToRollBack(String),

    /// The coordinator was constructed without any deployers.
    #[error("no deployers configured")]
    NoDeployers,

    /// A rollback post-condition did not hold.
    #[error("verification failed: {0}")]
    Verification(String),

    /// A service in the plan is unknown.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The tag to deploy is already live and force was not given.
    #[error("tag {0} is already deployed")]
    AlreadyDeployed(VersionTag),

    #[error(transparent)]
    State(#[from] crate::state::StateError),

    #[error(transparent)]
    Traffic(#[from] crate::traffic::TrafficError),

    #[error(transparent)]
    Proxy(#[from] crate::proxy::ProxyError),

    #[error(transparent)]
    Exec(#[from] crate::exec::ExecError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
