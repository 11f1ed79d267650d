// ABOUTME: TrafficManager - shifts live traffic between versions by rewriting
// ABOUTME: the reverse proxy's dynamic configs, gated on backend health.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::exec::{self, Executor};
use crate::health::{HealthCheck, HealthChecker};
use crate::proxy::{self, DynamicConfig, ProxyError};
use crate::state::{DeploymentState, VersionTag};

pub const HEALTH_GATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("deploy config already exists for tag {0}")]
    DeployConfigExists(VersionTag),

    #[error("timed out waiting for backends of {config} to become healthy")]
    HealthGateTimeout { config: String },

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Exec(#[from] crate::exec::ExecError),
}

pub type Result<T> = std::result::Result<T, TrafficError>;

/// Handles the routing of traffic between versions of services during
/// deployments by rewriting the proxy's dynamic configuration documents.
pub struct TrafficManager {
    executor: Arc<dyn Executor>,
    health: HealthChecker,
    dynamic_dir: String,
    gate_timeout: Duration,
    configs: Mutex<BTreeMap<String, DynamicConfig>>,
}

impl TrafficManager {
    /// Load the dynamic configuration documents from the host and build a
    /// manager over them.
    pub async fn connect(
        executor: Arc<dyn Executor>,
        dynamic_dir: impl Into<String>,
        health: HealthChecker,
    ) -> Result<Self> {
        let dynamic_dir = dynamic_dir.into();
        let configs = Self::load_configs(executor.as_ref(), &dynamic_dir).await?;
        tracing::debug!(dir = %dynamic_dir, count = configs.len(), "loaded dynamic configs");

        Ok(Self {
            executor,
            health,
            dynamic_dir,
            gate_timeout: HEALTH_GATE_TIMEOUT,
            configs: Mutex::new(configs),
        })
    }

    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = timeout;
        self
    }

    async fn load_configs(
        executor: &dyn Executor,
        dir: &str,
    ) -> Result<BTreeMap<String, DynamicConfig>> {
        let mut configs = BTreeMap::new();
        for name in exec::list_dir(executor, dir).await? {
            if !name.ends_with(".yml") && !name.ends_with(".yaml") {
                continue;
            }
            let path = format!("{}/{}", dir, name);
            if let Some(data) = exec::read_file(executor, &path).await? {
                configs.insert(name, DynamicConfig::from_yaml(&data)?);
            }
        }
        Ok(configs)
    }

    /// Shift traffic to the given tag.
    ///
    /// A no-op when the state is already at that tag. Refuses to proceed if a
    /// deploy config for the tag already exists. Otherwise: copy every live
    /// config rewritten for the new version, block until every declared
    /// backend health check passes, promote the copies, and prune the
    /// previous version's config files. On health failure nothing is
    /// promoted; rollback is the caller's responsibility.
    pub async fn deploy(&self, current: &DeploymentState, tag: &VersionTag) -> Result<()> {
        if current.tag.as_ref() == Some(tag) {
            tracing::debug!(%tag, "traffic already routed to tag, nothing to do");
            return Ok(());
        }

        let old_tag = current.tag.clone();
        let mut configs = self.configs.lock().await;

        if Self::has_deploy_configs(&configs, tag) {
            return Err(TrafficError::DeployConfigExists(tag.clone()));
        }

        let deploy_configs = self
            .create_deploy_configs(&mut configs, old_tag.as_ref(), tag)
            .await?;

        for (name, config) in &deploy_configs {
            let checks = Self::checks_for(config)?;
            tracing::debug!(config = %name, checks = checks.len(), "waiting for backend health");
            tokio::time::timeout(self.gate_timeout, self.health.wait_for_all(&checks))
                .await
                .map_err(|_| TrafficError::HealthGateTimeout {
                    config: name.clone(),
                })?;
        }

        self.promote(&mut configs, tag).await?;

        // versioned configs of the previous tag are garbage once the new
        // version is live; unversioned seed documents stay
        if let Some(old) = &old_tag {
            self.prune_tag(&mut configs, old).await?;
        }

        tracing::info!(%tag, "traffic routed to new version");
        Ok(())
    }

    /// The live (non-deploy) configs, as persisted into the state ledger.
    pub async fn dynamic_configs(&self) -> BTreeMap<String, DynamicConfig> {
        self.configs
            .lock()
            .await
            .iter()
            .filter(|(name, _)| !name.ends_with("-deploy.yml"))
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect()
    }

    /// Remove every config file embedding the given tag. Used to undo a
    /// shift that never had a previous version to return to.
    pub async fn remove_tag_configs(&self, tag: &VersionTag) -> Result<()> {
        let mut configs = self.configs.lock().await;
        self.prune_tag(&mut configs, tag).await
    }

    /// Restore the given configs as the live document set: rewrite each one
    /// to the dynamic directory and prune versioned copies for any other tag.
    /// Versioned copies are assumed to be named `<stem>-<tag>.yml`.
    pub async fn restore(
        &self,
        persisted: &BTreeMap<String, DynamicConfig>,
        tag: &VersionTag,
    ) -> Result<()> {
        let mut configs = self.configs.lock().await;

        for (name, config) in persisted {
            self.write_config(name, config).await?;
            configs.insert(name.clone(), config.clone());
        }

        let stems: Vec<String> = persisted
            .keys()
            .map(|name| proxy::config_stem(name, Some(tag)))
            .collect();

        let stale: Vec<String> = configs
            .keys()
            .filter(|name| !persisted.contains_key(*name))
            .filter(|name| {
                name.ends_with("-deploy.yml")
                    || stems
                        .iter()
                        .any(|stem| name.starts_with(&format!("{}-", stem)))
            })
            .cloned()
            .collect();

        for name in stale {
            exec::remove_file(
                self.executor.as_ref(),
                &format!("{}/{}", self.dynamic_dir, name),
            )
            .await?;
            configs.remove(&name);
        }

        Ok(())
    }

    fn has_deploy_configs(configs: &BTreeMap<String, DynamicConfig>, tag: &VersionTag) -> bool {
        configs
            .keys()
            .any(|name| name.ends_with(&format!("-{}-deploy.yml", tag)))
    }

    /// Copy each config of the currently live version (or the unversioned
    /// seed documents on first deployment) into a distinctly named deploy
    /// copy rewritten for the new tag. The originals are untouched.
    async fn create_deploy_configs(
        &self,
        configs: &mut BTreeMap<String, DynamicConfig>,
        old_tag: Option<&VersionTag>,
        tag: &VersionTag,
    ) -> Result<BTreeMap<String, DynamicConfig>> {
        let sources: Vec<(String, DynamicConfig)> = configs
            .iter()
            .filter(|(name, _)| {
                if name.ends_with("-deploy.yml") {
                    return false;
                }
                match old_tag {
                    Some(old) => proxy::embeds_tag(name, old),
                    None => true,
                }
            })
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();

        let mut deploy_configs = BTreeMap::new();

        for (name, config) in sources {
            let stem = proxy::config_stem(&name, old_tag);
            let deploy_name = proxy::deploy_config_name(&stem, tag);
            let rewritten = config.rewrite_for(tag)?;

            self.write_config(&deploy_name, &rewritten).await?;
            configs.insert(deploy_name.clone(), rewritten.clone());
            deploy_configs.insert(deploy_name, rewritten);
        }

        Ok(deploy_configs)
    }

    /// Make the new version live: each deploy copy becomes the promoted
    /// `<stem>-<tag>.yml` document, routers keeping their versioned service
    /// references.
    async fn promote(
        &self,
        configs: &mut BTreeMap<String, DynamicConfig>,
        tag: &VersionTag,
    ) -> Result<()> {
        let suffix = format!("-{}-deploy.yml", tag);
        let deploy_names: Vec<String> = configs
            .keys()
            .filter(|name| name.ends_with(&suffix))
            .cloned()
            .collect();

        for name in deploy_names {
            let stem = name
                .strip_suffix(&suffix)
                .unwrap_or(&name)
                .to_string();
            let live_name = proxy::live_config_name(&stem, tag);

            exec::rename_file(
                self.executor.as_ref(),
                &format!("{}/{}", self.dynamic_dir, name),
                &format!("{}/{}", self.dynamic_dir, live_name),
            )
            .await?;

            if let Some(config) = configs.remove(&name) {
                configs.insert(live_name, config);
            }
        }

        Ok(())
    }

    /// Delete every dynamic config file whose name embeds the given tag.
    async fn prune_tag(
        &self,
        configs: &mut BTreeMap<String, DynamicConfig>,
        tag: &VersionTag,
    ) -> Result<()> {
        let stale: Vec<String> = configs
            .keys()
            .filter(|name| proxy::embeds_tag(name, tag))
            .cloned()
            .collect();

        for name in stale {
            tracing::debug!(config = %name, "removing stale dynamic config");
            exec::remove_file(
                self.executor.as_ref(),
                &format!("{}/{}", self.dynamic_dir, name),
            )
            .await?;
            configs.remove(&name);
        }

        Ok(())
    }

    async fn write_config(&self, name: &str, config: &DynamicConfig) -> Result<()> {
        let path = format!("{}/{}", self.dynamic_dir, name);
        exec::write_file(self.executor.as_ref(), &path, &config.to_yaml()?).await?;
        Ok(())
    }

    /// Health checks for every backend in a config that declares one.
    fn checks_for(config: &DynamicConfig) -> Result<Vec<HealthCheck>> {
        Ok(backend_checks(config)?)
    }
}

/// HTTP health checks for every backend of every service in a config that
/// declares a health-check descriptor. Services without one are not probed.
pub fn backend_checks(config: &DynamicConfig) -> std::result::Result<Vec<HealthCheck>, ProxyError> {
    let mut checks = Vec::new();
    for service in config.http.services.values() {
        let Some(spec) = &service.load_balancer.health_check else {
            continue;
        };
        for server in &service.load_balancer.servers {
            checks.push(HealthCheck::http_for_backend(&server.url, spec)?);
        }
    }
    Ok(checks)
}
