// ABOUTME: DeploymentCoordinator - fans one logical deployment out across hosts.
// ABOUTME: Validates placement, orders services, parallelizes hosts, and gates rollback on locks.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{deploy_order, CancelToken, DeployError, Deployer, Service};
use crate::compose::ComposeConfig;
use crate::state::VersionTag;

/// Coordinates a deployment across every managed host.
///
/// Service-to-service ordering is enforced by waiting for all hosts of one
/// service before starting the next; host-to-host ordering within a service
/// is intentionally unordered.
pub struct DeploymentCoordinator {
    deployers: BTreeMap<String, Arc<Deployer>>,
}

impl DeploymentCoordinator {
    pub fn new(deployers: Vec<Deployer>) -> Self {
        let deployers = deployers
            .into_iter()
            .map(|d| (d.host().to_string(), Arc::new(d)))
            .collect();
        Self { deployers }
    }

    pub fn hosts(&self) -> Vec<String> {
        self.deployers.keys().cloned().collect()
    }

    /// The hosts a service deploys to: its placement constraint, or every
    /// managed host when unconstrained.
    fn hosts_for(&self, service: &Service) -> Vec<String> {
        if service.placement.is_empty() {
            self.deployers.keys().cloned().collect()
        } else {
            service.placement.clone()
        }
    }

    /// Fail the whole operation before touching any host if a placement
    /// constraint names a host that was not supplied to the tool.
    fn validate_placement(&self, config: &ComposeConfig) -> Result<(), DeployError> {
        for (name, service) in &config.services {
            for host in service.placement() {
                if !self.deployers.contains_key(&host) {
                    return Err(DeployError::PlacementUnknownHost {
                        service: name.clone(),
                        host,
                    });
                }
            }
        }
        Ok(())
    }

    /// Deploy every service in the compose file at the given version.
    ///
    /// Services deploy in dependency order; within one service all target
    /// hosts run in parallel. The first host error trips a cancellation
    /// token so siblings can exit cooperatively; their errors are discarded
    /// and the first real error is returned. Hosts that already succeeded
    /// are left as they are - rolling them back is an explicit, separate,
    /// lock-gated operation.
    pub async fn deploy_compose(
        &self,
        config: &ComposeConfig,
        tag: &VersionTag,
    ) -> Result<(), DeployError> {
        if self.deployers.is_empty() {
            return Err(DeployError::NoDeployers);
        }
        self.validate_placement(config)?;

        let services = Service::all_from_compose(config);
        let order = deploy_order(&services)?;
        tracing::info!(%tag, order = ?order, hosts = ?self.hosts(), "starting deployment");

        // images are shared across hosts; build and push once
        if let Some(deployer) = self.deployers.values().next() {
            deployer.build_and_push(tag).await?;
        }

        for name in order {
            let service = &services[&name];
            let target_hosts = self.hosts_for(service);
            tracing::info!(service = %name, hosts = ?target_hosts, "deploying service");

            let (handle, token) = CancelToken::new();
            let (error_tx, mut error_rx) = mpsc::channel(target_hosts.len().max(1));

            let rollouts = target_hosts.iter().map(|host| {
                let deployer = self.deployers[host].clone();
                let service = service.clone();
                let tag = tag.clone();
                let token = token.clone();
                let handle = handle.clone();
                let error_tx = error_tx.clone();
                let host = host.clone();
                async move {
                    if let Err(err) = deployer.deploy_service(&service, &tag, &token).await {
                        if matches!(err, DeployError::Cancelled) {
                            // a sibling already failed; this host exited
                            // cooperatively and its error carries no signal
                            tracing::debug!(%host, "host rollout cancelled");
                            return;
                        }
                        handle.cancel();
                        let _ = error_tx
                            .send(DeployError::HostFailed {
                                host,
                                source: Box::new(err),
                            })
                            .await;
                    }
                }
            });

            futures::future::join_all(rollouts).await;
            drop(error_tx);

            if let Some(err) = error_rx.recv().await {
                return Err(err);
            }
        }

        tracing::info!(%tag, "deployment completed on all hosts");
        Ok(())
    }

    /// Roll every host back to its recorded deployment.
    ///
    /// Destructive, so it is all-or-nothing on locks: a lock is acquired on
    /// every host first, and if any acquisition fails every acquired lock is
    /// released and nothing destructive runs. Locks are always released
    /// afterwards, regardless of outcome.
    pub async fn rollback(&self) -> Result<(), DeployError> {
        self.with_all_locks(|deployer| async move { deployer.rollback_project().await })
            .await
    }

    /// Roll a single service back on every host, under the same lock regime.
    pub async fn rollback_service(&self, service_name: &str) -> Result<(), DeployError> {
        let name = service_name.to_string();
        self.with_all_locks(move |deployer| {
            let name = name.clone();
            async move { deployer.rollback_service(&name).await }
        })
        .await
    }

    async fn with_all_locks<F, Fut>(&self, operation: F) -> Result<(), DeployError>
    where
        F: Fn(Arc<Deployer>) -> Fut,
        Fut: std::future::Future<Output = Result<(), DeployError>>,
    {
        if self.deployers.is_empty() {
            return Err(DeployError::NoDeployers);
        }

        let owner = lock_owner();
        self.acquire_all_locks(&owner).await?;

        let attempts = self.deployers.values().map(|deployer| {
            let deployer = deployer.clone();
            let host = deployer.host().to_string();
            let fut = operation(deployer);
            async move { (host, fut.await) }
        });
        let results = futures::future::join_all(attempts).await;

        // every participant that acquired the lock releases it, even on error
        self.release_all_locks(&owner).await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(host, result)| {
                result
                    .err()
                    .map(|err| format!("rollback failed on {}: {}", host, err))
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeployError::MultiHostRollback { failures })
        }
    }

    async fn acquire_all_locks(&self, owner: &str) -> Result<(), DeployError> {
        let attempts = self.deployers.values().map(|deployer| {
            let host = deployer.host().to_string();
            let state = deployer.state_manager().clone();
            let owner = owner.to_string();
            async move { (host, state.acquire_lock(&owner).await) }
        });
        let results = futures::future::join_all(attempts).await;

        let mut acquired = Vec::new();
        let mut failures = Vec::new();
        for (host, result) in results {
            match result {
                Ok(()) => acquired.push(host),
                Err(err) => failures.push(format!("failed to acquire lock on {}: {}", host, err)),
            }
        }

        if failures.is_empty() {
            return Ok(());
        }

        // all-or-nothing: give back whatever was acquired
        for host in acquired {
            if let Some(deployer) = self.deployers.get(&host) {
                if let Err(err) = deployer.state_manager().release_lock(owner).await {
                    tracing::error!(%host, error = %err, "failed to release lock during abort");
                }
            }
        }
        Err(DeployError::LockAcquisition(failures.join("; ")))
    }

    async fn release_all_locks(&self, owner: &str) {
        for (host, deployer) in &self.deployers {
            if let Err(err) = deployer.state_manager().release_lock(owner).await {
                tracing::error!(%host, error = %err, "failed to release lock");
            }
        }
    }
}

/// Lock owner identity for this coordinator process.
fn lock_owner() -> String {
    format!(
        "{}:{}",
        gethostname::gethostname().to_string_lossy(),
        std::process::id()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_owner_includes_host_and_pid() {
        let owner = lock_owner();
        assert!(owner.contains(':'));
        assert!(owner.ends_with(&std::process::id().to_string()));
    }
}
