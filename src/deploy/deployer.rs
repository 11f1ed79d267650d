// ABOUTME: Deployer - the single-host orchestrator for one deployment attempt.
// ABOUTME: Every reversible action registers its compensation before the sequence proceeds.

use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::{CancelToken, DeployError, RollbackManager, Service};
use crate::compose::{ComposeConfig, ComposeOverride, ComposeRunner, OverrideService, RegistryConfig};
use crate::exec::{self, quote, Executor};
use crate::health::{HealthCheck, HealthChecker};
use crate::state::{StateManager, TransactionLog, TransactionStatus, VersionTag};
use crate::traffic::{backend_checks, TrafficManager};

/// Bound on the post-rollback traffic verification.
const TRAFFIC_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for one host's deployer.
#[derive(Debug, Clone)]
pub struct DeployerOptions {
    /// Remote directory holding the staged compose files and the state ledger.
    pub remote_work_dir: String,
    /// Remote directory holding the proxy's dynamic configuration documents.
    pub proxy_dynamic_dir: String,
    pub registry: Option<RegistryConfig>,
    /// Bound on the post-start health gate. Exceeding it is a hard failure.
    pub health_gate_timeout: Duration,
    pub health_poll_interval: Duration,
}

impl Default for DeployerOptions {
    fn default() -> Self {
        Self {
            remote_work_dir: ".stevedore".to_string(),
            proxy_dynamic_dir: "traefik/dynamic".to_string(),
            registry: None,
            health_gate_timeout: Duration::from_secs(10),
            health_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Orchestrates the deployment sequence for one host.
///
/// The sequence for one attempt is strictly serial: stage environment and
/// files, pull, start, health gate, traffic shift, old-version teardown,
/// state commit. Any failure triggers the registered rollback steps in
/// reverse order before the error propagates.
pub struct Deployer {
    host: String,
    local: Arc<dyn Executor>,
    remote: Arc<dyn Executor>,
    compose: ComposeConfig,
    local_compose_path: PathBuf,
    local_runner: ComposeRunner,
    remote_runner: ComposeRunner,
    state: Arc<StateManager>,
    traffic: Arc<TrafficManager>,
    health: HealthChecker,
    options: DeployerOptions,
}

impl Deployer {
    /// Verify both executors, load the proxy's dynamic configs, and surface
    /// a malformed ledger before any deployment work begins.
    pub async fn connect(
        host: impl Into<String>,
        local: Arc<dyn Executor>,
        remote: Arc<dyn Executor>,
        compose: ComposeConfig,
        local_compose_path: impl Into<PathBuf>,
        options: DeployerOptions,
    ) -> Result<Self, DeployError> {
        let host = host.into();
        let local_compose_path = local_compose_path.into();

        tracing::debug!(%host, "verifying deployment environment requirements");
        local.verify().await?;
        remote.verify().await?;

        let state = Arc::new(StateManager::new(
            remote.clone(),
            options.remote_work_dir.clone(),
        ));
        state.load().await?;

        let health =
            HealthChecker::new(remote.clone()).with_interval(options.health_poll_interval);

        let traffic = Arc::new(
            TrafficManager::connect(
                remote.clone(),
                options.proxy_dynamic_dir.clone(),
                health.clone(),
            )
            .await?
            .with_gate_timeout(options.health_gate_timeout),
        );

        let remote_compose = format!("{}/docker-compose.yml", options.remote_work_dir);
        let local_runner = ComposeRunner::new(
            local.clone(),
            local_compose_path.to_string_lossy().to_string(),
        );
        let remote_runner = ComposeRunner::new(remote.clone(), remote_compose);

        tracing::debug!(%host, "deployment components initialized");
        Ok(Self {
            host,
            local,
            remote,
            compose,
            local_compose_path,
            local_runner,
            remote_runner,
            state,
            traffic,
            health,
            options,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// Build and push every image for the new version via the local runner.
    pub async fn build_and_push(&self, tag: &VersionTag) -> Result<(), DeployError> {
        let override_file = ComposeOverride::new(&self.compose, tag);
        let local_override = format!("{}.{}.override.yml", self.local_compose_path.display(), tag);
        exec::write_file(self.local.as_ref(), &local_override, &override_file.to_yaml()?).await?;

        if let Some(registry) = &self.options.registry {
            self.local_runner.login(registry).await?;
        }

        tracing::info!(%tag, "building and pushing images");
        self.local_runner.build(&local_override).await?;
        self.local_runner.push(&local_override).await?;
        Ok(())
    }

    /// Deploy the whole compose project to this host in dependency order.
    pub async fn deploy_project(
        &self,
        tag: &VersionTag,
        cancel: &CancelToken,
    ) -> Result<(), DeployError> {
        self.build_and_push(tag).await?;

        let services = Service::all_from_compose(&self.compose);
        let order = super::deploy_order(&services)?;

        for name in order {
            self.deploy_service(&services[&name], tag, cancel).await?;
        }
        Ok(())
    }

    /// Deploy one service to this host.
    ///
    /// The forward sequence registers a rollback step immediately after each
    /// reversible action; on any error the registered steps run in reverse
    /// order and the original error propagates. There is no catch-unwind:
    /// every fallible operation reports through Result.
    pub async fn deploy_service(
        &self,
        service: &Service,
        tag: &VersionTag,
        cancel: &CancelToken,
    ) -> Result<(), DeployError> {
        let mut rollback = RollbackManager::new(self.state.clone());

        self.record(
            TransactionLog::new(&service.name, "deploy", TransactionStatus::Started, tag)
                .with_metadata("host", &self.host),
        )
        .await;

        match self.run_sequence(&mut rollback, service, tag, cancel).await {
            Ok(()) => {
                self.record(
                    TransactionLog::new(&service.name, "deploy", TransactionStatus::Completed, tag)
                        .with_metadata("host", &self.host),
                )
                .await;
                tracing::info!(host = %self.host, service = %service.name, %tag, "service deployed");
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    host = %self.host,
                    service = %service.name,
                    error = %err,
                    "deployment failed, rolling back"
                );
                self.record(
                    TransactionLog::new(&service.name, "deploy", TransactionStatus::Failed, tag)
                        .with_error(err.to_string()),
                )
                .await;

                match rollback.rollback().await {
                    Ok(()) => {
                        self.record(TransactionLog::new(
                            &service.name,
                            "deploy",
                            TransactionStatus::RolledBack,
                            tag,
                        ))
                        .await;
                        Err(err)
                    }
                    Err(rollback_err) => Err(DeployError::RollbackAlsoFailed {
                        deploy: Box::new(err),
                        rollback: Box::new(rollback_err),
                    }),
                }
            }
        }
    }

    async fn run_sequence(
        &self,
        rollback: &mut RollbackManager,
        service: &Service,
        tag: &VersionTag,
        cancel: &CancelToken,
    ) -> Result<(), DeployError> {
        self.ensure_not_cancelled(cancel)?;

        let current = self.state.load().await?;
        tracing::debug!(
            host = %self.host,
            current_tag = ?current.tag,
            service_count = current.compose.services.len(),
            "current state loaded"
        );

        let override_file =
            ComposeOverride::for_services(&self.compose, [service.name.as_str()], tag);
        if override_file.services.is_empty() {
            tracing::debug!(service = %service.name, "service declares no container, skipping");
            return Ok(());
        }

        self.stage_environment(service).await?;
        self.ensure_not_cancelled(cancel)?;

        let override_path = self.remote_override_path(tag);
        exec::write_file(
            self.remote.as_ref(),
            &override_path,
            &override_file.to_yaml()?,
        )
        .await?;
        {
            let remote = self.remote.clone();
            let path = override_path.clone();
            let verify_remote = self.remote.clone();
            let verify_path = override_path.clone();
            rollback.add_verified_step(
                "remove-override",
                move || {
                    async move { exec::remove_file(remote.as_ref(), &path).await.map_err(DeployError::from) }
                        .boxed()
                },
                move || {
                    async move {
                        if exec::file_exists(verify_remote.as_ref(), &verify_path).await? {
                            return Err(DeployError::Verification(format!(
                                "override file {} still exists after rollback",
                                verify_path
                            )));
                        }
                        Ok(())
                    }
                    .boxed()
                },
            );
        }
        self.ensure_not_cancelled(cancel)?;

        if let Some(registry) = &self.options.registry {
            self.remote_runner.login(registry).await?;
        }
        self.remote_runner.pull(&override_path).await?;
        self.ensure_not_cancelled(cancel)?;

        tracing::info!(host = %self.host, service = %service.name, %tag, "starting new containers");
        self.remote_runner.up(&override_path).await?;
        let new_containers = override_file.container_names();
        {
            let runner = self.remote_runner.clone();
            let containers = new_containers.clone();
            let verify_runner = self.remote_runner.clone();
            let verify_containers = new_containers.clone();
            rollback.add_verified_step(
                "teardown-new-containers",
                move || {
                    async move { runner.down(&containers).await.map_err(DeployError::from) }.boxed()
                },
                move || {
                    async move {
                        for container in &verify_containers {
                            if let Ok(status) = verify_runner.inspect_status(container).await {
                                if status == "running" {
                                    return Err(DeployError::Verification(format!(
                                        "container {} still running after rollback",
                                        container
                                    )));
                                }
                            }
                        }
                        Ok(())
                    }
                    .boxed()
                },
            );
        }

        let checks: Vec<HealthCheck> = new_containers
            .iter()
            .map(|name| HealthCheck::container(name.clone()))
            .collect();
        tracing::debug!(
            host = %self.host,
            containers = ?new_containers,
            timeout = ?self.options.health_gate_timeout,
            "waiting for container health"
        );
        tokio::select! {
            gate = tokio::time::timeout(
                self.options.health_gate_timeout,
                self.health.wait_for_all(&checks),
            ) => {
                gate.map_err(|_| {
                    DeployError::HealthGateTimeout(self.options.health_gate_timeout.as_secs())
                })?;
            }
            _ = cancel.cancelled() => return Err(DeployError::Cancelled),
        }

        tracing::info!(host = %self.host, "updating traffic routing");
        self.traffic.deploy(&current, tag).await?;
        {
            let traffic = self.traffic.clone();
            let previous = current.clone();
            let new_tag = tag.clone();
            let verify_health = self.health.clone();
            let verify_previous = current.clone();
            rollback.add_verified_step(
                "traffic-rollback",
                move || {
                    async move {
                        match previous.tag.clone() {
                            Some(old_tag) => {
                                // shifting back is itself a deploy, from the
                                // new version's viewpoint
                                let mut undo = previous.clone();
                                undo.tag = Some(new_tag);
                                traffic.deploy(&undo, &old_tag).await.map_err(DeployError::from)
                            }
                            None => traffic
                                .remove_tag_configs(&new_tag)
                                .await
                                .map_err(DeployError::from),
                        }
                    }
                    .boxed()
                },
                move || {
                    async move {
                        // with no previous routing there is nothing to verify
                        if verify_previous.tag.is_none() {
                            return Ok(());
                        }
                        let mut checks = Vec::new();
                        for config in verify_previous.proxy.configs.values() {
                            checks.extend(backend_checks(config)?);
                        }
                        tokio::time::timeout(
                            TRAFFIC_VERIFY_TIMEOUT,
                            verify_health.wait_for_all(&checks),
                        )
                        .await
                        .map_err(|_| {
                            DeployError::Verification(
                                "previous version unhealthy after traffic rollback".to_string(),
                            )
                        })
                    }
                    .boxed()
                },
            );
        }

        let old_containers: Vec<String> = current
            .compose
            .services
            .values()
            .filter(|s| s.service_name == service.name)
            .filter(|s| !s.container_name.is_empty())
            .filter(|s| s.container_name != format!("{}-{}", service.name, tag))
            .map(|s| s.container_name.clone())
            .collect();
        if !old_containers.is_empty() {
            tracing::debug!(
                host = %self.host,
                containers = ?old_containers,
                "tearing down old containers"
            );
            self.remote_runner.down(&old_containers).await?;
        }

        exec::remove_file(self.remote.as_ref(), &override_path).await?;

        tracing::debug!(host = %self.host, %tag, "saving deployment state");
        self.state
            .update(&override_file, &self.traffic.dynamic_configs().await, tag)
            .await?;

        Ok(())
    }

    /// Restore the host to the deployment its ledger records: bring the
    /// recorded containers back up, rewrite the recorded proxy documents,
    /// and prune configs for any other version.
    pub async fn rollback_project(&self) -> Result<(), DeployError> {
        let state = self.state.load().await?;
        let Some(tag) = state.tag.clone() else {
            return Err(DeployError::NothingToRollBack(self.host.clone()));
        };
        tracing::info!(host = %self.host, %tag, "restoring host to recorded deployment");

        let override_file = Self::override_from_state(&state);
        self.restore_containers(&override_file).await?;
        self.traffic.restore(&state.proxy.configs, &tag).await?;

        for name in override_file.services.keys() {
            self.record(TransactionLog::new(
                name,
                "rollback",
                TransactionStatus::RolledBack,
                &tag,
            ))
            .await;
        }
        Ok(())
    }

    /// Restore a single service's containers to what the ledger records.
    /// Proxy documents are host-global and left untouched.
    pub async fn rollback_service(&self, service_name: &str) -> Result<(), DeployError> {
        let state = self.state.load().await?;
        let Some(tag) = state.tag.clone() else {
            return Err(DeployError::NothingToRollBack(self.host.clone()));
        };
        if !state.compose.services.contains_key(service_name) {
            return Err(DeployError::UnknownService(service_name.to_string()));
        }

        let mut override_file = Self::override_from_state(&state);
        override_file.services.retain(|name, _| name == service_name);
        self.restore_containers(&override_file).await?;

        self.record(TransactionLog::new(
            service_name,
            "rollback",
            TransactionStatus::RolledBack,
            &tag,
        ))
        .await;
        Ok(())
    }

    fn override_from_state(state: &crate::state::DeploymentState) -> ComposeOverride {
        let mut override_file = ComposeOverride::default();
        for (name, service) in &state.compose.services {
            if service.container_name.is_empty() {
                continue;
            }
            override_file.services.insert(
                name.clone(),
                OverrideService {
                    container_name: service.container_name.clone(),
                    hostname: service.hostname.clone(),
                    image: service.image.clone(),
                },
            );
        }
        override_file
    }

    async fn restore_containers(&self, override_file: &ComposeOverride) -> Result<(), DeployError> {
        if override_file.services.is_empty() {
            return Ok(());
        }

        let restore_path = format!(
            "{}/docker-compose.restore.yml",
            self.options.remote_work_dir
        );
        exec::write_file(
            self.remote.as_ref(),
            &restore_path,
            &override_file.to_yaml()?,
        )
        .await?;
        self.remote_runner.up(&restore_path).await?;
        exec::remove_file(self.remote.as_ref(), &restore_path).await?;

        let checks: Vec<HealthCheck> = override_file
            .container_names()
            .into_iter()
            .map(HealthCheck::container)
            .collect();
        tokio::time::timeout(
            self.options.health_gate_timeout,
            self.health.wait_for_all(&checks),
        )
        .await
        .map_err(|_| DeployError::HealthGateTimeout(self.options.health_gate_timeout.as_secs()))?;

        Ok(())
    }

    async fn stage_environment(&self, service: &Service) -> Result<(), DeployError> {
        self.remote
            .exec_checked(&format!("mkdir -p {}", quote(&self.options.remote_work_dir)))
            .await?;

        self.remote
            .send_file(
                &self.local_compose_path,
                &format!("{}/docker-compose.yml", self.options.remote_work_dir),
            )
            .await?;

        let local_dir = self
            .local_compose_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        for env_file in &service.env_files {
            self.remote
                .send_file(
                    &local_dir.join(env_file),
                    &format!("{}/{}", self.options.remote_work_dir, env_file),
                )
                .await?;
        }
        Ok(())
    }

    fn remote_override_path(&self, tag: &VersionTag) -> String {
        format!(
            "{}/docker-compose.{}.override.yml",
            self.options.remote_work_dir, tag
        )
    }

    fn ensure_not_cancelled(&self, cancel: &CancelToken) -> Result<(), DeployError> {
        if cancel.is_cancelled() {
            tracing::debug!(host = %self.host, "deployment cancelled by sibling failure");
            return Err(DeployError::Cancelled);
        }
        Ok(())
    }

    /// Append to the audit trail, best effort: a failed write is logged,
    /// never fatal to the deployment itself.
    async fn record(&self, log: TransactionLog) {
        if let Err(err) = self.state.log_transaction(log).await {
            tracing::warn!(host = %self.host, error = %err, "failed to record transaction");
        }
    }
}
