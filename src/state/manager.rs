// ABOUTME: StateManager - loads and saves the per-host deployment ledger atomically.
// ABOUTME: Also owns the advisory deployment lock and the transaction audit trail.

use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    ComposeServiceState, DeploymentLock, DeploymentState, Result, StateError, TransactionLog,
    VersionTag,
};
use crate::compose::ComposeOverride;
use crate::exec::{self, Executor};
use crate::proxy::DynamicConfig;

pub const STATE_FILE: &str = "deployment-state.yml";

fn lock_lease() -> Duration {
    Duration::hours(1)
}

/// Loads and saves the deployment state for one host.
///
/// The state file is only ever mutated through this manager, and every
/// command goes through the host's executor, which serializes them.
pub struct StateManager {
    executor: Arc<dyn Executor>,
    work_dir: String,
}

impl StateManager {
    pub fn new(executor: Arc<dyn Executor>, work_dir: impl Into<String>) -> Self {
        Self {
            executor,
            work_dir: work_dir.into(),
        }
    }

    fn state_path(&self) -> String {
        format!("{}/{}", self.work_dir, STATE_FILE)
    }

    /// Load the current deployment state.
    ///
    /// A missing state file means first deployment and yields an empty state,
    /// not an error. Malformed content is a hard error.
    pub async fn load(&self) -> Result<DeploymentState> {
        match exec::read_file(self.executor.as_ref(), &self.state_path()).await? {
            Some(data) => serde_yaml::from_str(&data).map_err(StateError::Malformed),
            None => {
                tracing::debug!(path = %self.state_path(), "state file not found, using empty state");
                Ok(DeploymentState::default())
            }
        }
    }

    /// Persist the state atomically: serialize to a temporary file in the
    /// same directory, then rename over the canonical path. Concurrent
    /// readers never observe a half-written document.
    pub async fn save(&self, state: &DeploymentState) -> Result<()> {
        Self::validate(state)?;

        let data = serde_yaml::to_string(state).map_err(StateError::Serialize)?;

        let final_path = self.state_path();
        let temp_path = format!("{}.{}.tmp", final_path, Utc::now().timestamp_micros());

        exec::write_file(self.executor.as_ref(), &temp_path, &data).await?;

        if let Err(err) = exec::rename_file(self.executor.as_ref(), &temp_path, &final_path).await {
            let _ = exec::remove_file(self.executor.as_ref(), &temp_path).await;
            return Err(err.into());
        }

        tracing::debug!(path = %final_path, "state file updated");
        Ok(())
    }

    /// Fold a set of per-service overrides and a new proxy-config set into
    /// the state under the given tag, then save. Returns the updated state.
    pub async fn update(
        &self,
        overrides: &ComposeOverride,
        proxy_configs: &BTreeMap<String, DynamicConfig>,
        tag: &VersionTag,
    ) -> Result<DeploymentState> {
        let mut state = self.load().await?;

        for (name, service) in &overrides.services {
            let entry = state.compose.services.entry(name.clone()).or_default();
            entry.service_name = name.clone();
            entry.container_name = service.container_name.clone();
            entry.hostname = service.hostname.clone();
            entry.image = service.image.clone();
        }

        state.tag = Some(tag.clone());
        state.proxy.tag = Some(tag.clone());
        state.proxy.configs = proxy_configs.clone();

        self.save(&state).await?;
        Ok(state)
    }

    /// Validate the weight invariant before any write: while both versions
    /// of a service receive traffic, weights are percentages summing to 100.
    pub fn validate(state: &DeploymentState) -> Result<()> {
        for (name, service) in &state.compose.services {
            if let Some(split) = &service.traffic {
                if split.blue_weight == 0 && split.green_weight == 0 {
                    continue;
                }
                if split.blue_weight > 100
                    || split.green_weight > 100
                    || split.blue_weight as u16 + split.green_weight as u16 != 100
                {
                    return Err(StateError::InvalidWeights {
                        service: name.clone(),
                        blue: split.blue_weight,
                        green: split.green_weight,
                    });
                }
            }
        }
        Ok(())
    }

    /// Acquire the advisory deployment lock for this host.
    ///
    /// An unexpired lock held by anyone blocks. An expired lease is
    /// reclaimed; there is no fencing token, so a coordinator racing on an
    /// expired-but-unreclaimed lease can still slip through.
    pub async fn acquire_lock(&self, owner: &str) -> Result<()> {
        let mut state = self.load().await?;

        if let Some(lock) = &state.lock {
            if !lock.is_expired() {
                return Err(StateError::LockHeld {
                    owner: lock.owner.clone(),
                    expires_at: lock.expires_at,
                });
            }
            tracing::warn!(
                previous_owner = %lock.owner,
                expired_at = %lock.expires_at,
                "reclaiming expired deployment lock"
            );
        }

        let now = Utc::now();
        state.lock = Some(DeploymentLock {
            acquired_at: now,
            expires_at: now + lock_lease(),
            owner: owner.to_string(),
            renewable: true,
        });

        self.save(&state).await
    }

    /// Release the lock held by `owner`. Releasing a lock held by someone
    /// else is an error; releasing an absent lock is too.
    pub async fn release_lock(&self, owner: &str) -> Result<()> {
        let mut state = self.load().await?;

        match &state.lock {
            Some(lock) if lock.owner == owner => {
                state.lock = None;
                self.save(&state).await
            }
            _ => Err(StateError::LockNotHeld(owner.to_string())),
        }
    }

    /// Extend a renewable lease held by `owner`.
    pub async fn extend_lock(&self, owner: &str, extra: Duration) -> Result<()> {
        let mut state = self.load().await?;

        match &mut state.lock {
            Some(lock) if lock.owner == owner => {
                if !lock.renewable {
                    return Err(StateError::LockNotRenewable(owner.to_string()));
                }
                lock.expires_at = Utc::now() + extra;
                self.save(&state).await
            }
            _ => Err(StateError::LockNotHeld(owner.to_string())),
        }
    }

    /// Append an entry to the named service's audit trail. The trail is
    /// append-only; existing entries are never mutated.
    pub async fn log_transaction(&self, log: TransactionLog) -> Result<()> {
        let mut state = self.load().await?;

        let entry = state
            .compose
            .services
            .entry(log.service_name.clone())
            .or_insert_with(|| ComposeServiceState {
                service_name: log.service_name.clone(),
                ..Default::default()
            });
        entry.transactions.push(log);

        self.save(&state).await
    }
}
