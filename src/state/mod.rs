// ABOUTME: Persisted deployment state model - the per-host ledger of what is deployed.
// ABOUTME: Covers version tags, service state, proxy state, locks, and the audit trail.

mod manager;

pub use manager::{StateManager, STATE_FILE};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::proxy::DynamicConfig;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("malformed state file: {0}")]
    Malformed(serde_yaml::Error),

    #[error("failed to serialize state: {0}")]
    Serialize(serde_yaml::Error),

    #[error(
        "invalid traffic weights for service {service}: blue={blue} green={green} (must be 0-100 and sum to 100)"
    )]
    InvalidWeights { service: String, blue: u8, green: u8 },

    #[error("deployment in progress by {owner} until {expires_at}")]
    LockHeld {
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("lock not held by {0}")]
    LockNotHeld(String),

    #[error("lock held by {0} is not renewable")]
    LockNotRenewable(String),

    #[error(transparent)]
    Exec(#[from] crate::exec::ExecError),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Opaque, sortable version identifier - in practice a source-control revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionTag(String);

#[derive(Debug, Error)]
#[error("invalid version tag {0:?}: must be non-empty with no whitespace or '/'")]
pub struct VersionTagError(String);

impl VersionTag {
    pub fn parse(value: &str) -> std::result::Result<Self, VersionTagError> {
        let value = value.trim();
        if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '/') {
            return Err(VersionTagError(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for VersionTag {
    type Error = VersionTagError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        VersionTag::parse(&value)
    }
}

impl From<VersionTag> for String {
    fn from(tag: VersionTag) -> Self {
        tag.0
    }
}

/// The single source of truth for what is deployed on one host.
///
/// Equality compares the deployed content - tag, the full service map, and
/// the full proxy-config map. The advisory lock and the append-only audit
/// trail are excluded: neither describes what is running.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<VersionTag>,
    #[serde(default)]
    pub compose: ComposeState,
    #[serde(default)]
    pub proxy: ProxyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<DeploymentLock>,
}

impl PartialEq for DeploymentState {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.compose == other.compose && self.proxy == other.proxy
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeState {
    #[serde(default)]
    pub services: BTreeMap<String, ComposeServiceState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeServiceState {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic: Option<TrafficSplit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<TransactionLog>,
}

impl PartialEq for ComposeServiceState {
    fn eq(&self, other: &Self) -> bool {
        // the audit trail is history, not deployed content
        self.service_name == other.service_name
            && self.container_name == other.container_name
            && self.hostname == other.hostname
            && self.image == other.image
            && self.traffic == other.traffic
    }
}

/// Blue/green routing weights while both versions receive traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub blue_weight: u8,
    pub green_weight: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<VersionTag>,
    #[serde(default)]
    pub configs: BTreeMap<String, DynamicConfig>,
}

/// Advisory lease guarding destructive multi-host operations.
///
/// The lease has an expiry and may be renewed, but there is no fencing token:
/// two coordinators racing on an expired-but-unreclaimed lock can both
/// proceed. Honest lock-checking is assumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentLock {
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub owner: String,
    pub renewable: bool,
}

impl DeploymentLock {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Started,
    Completed,
    Failed,
    RolledBack,
}

/// One entry in the append-only per-service audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLog {
    pub id: String,
    pub service_name: String,
    pub action: String,
    pub status: TransactionStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl TransactionLog {
    pub fn new(
        service_name: impl Into<String>,
        action: impl Into<String>,
        status: TransactionStatus,
        version: &VersionTag,
    ) -> Self {
        let timestamp = Utc::now();
        Self {
            id: format!("tx-{}", timestamp.timestamp_micros()),
            service_name: service_name.into(),
            action: action.into(),
            status,
            timestamp,
            error: None,
            version: version.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn version_tag_rejects_empty_and_unsafe_input() {
        assert!(VersionTag::parse("").is_err());
        assert!(VersionTag::parse("  ").is_err());
        assert!(VersionTag::parse("a b").is_err());
        assert!(VersionTag::parse("a/b").is_err());
        assert_eq!(VersionTag::parse(" abc123 ").unwrap().as_str(), "abc123");
    }

    #[test]
    fn version_tags_sort_lexically() {
        let a = VersionTag::parse("aaa").unwrap();
        let b = VersionTag::parse("bbb").unwrap();
        assert!(a < b);
    }

    #[test]
    fn fresh_lock_is_not_expired() {
        let now = Utc::now();
        let lock = DeploymentLock {
            acquired_at: now,
            expires_at: now + Duration::hours(1),
            owner: "me".to_string(),
            renewable: true,
        };
        assert!(!lock.is_expired());
    }

    #[test]
    fn past_lease_is_expired() {
        let now = Utc::now();
        let lock = DeploymentLock {
            acquired_at: now - Duration::hours(2),
            expires_at: now - Duration::hours(1),
            owner: "me".to_string(),
            renewable: true,
        };
        assert!(lock.is_expired());
    }

    #[test]
    fn state_equality_ignores_lock_and_transactions() {
        let mut a = DeploymentState::default();
        a.tag = Some(VersionTag::parse("v1").unwrap());
        a.compose.services.insert(
            "web".to_string(),
            ComposeServiceState {
                service_name: "web".to_string(),
                container_name: "web-v1".to_string(),
                hostname: "web-v1".to_string(),
                image: "registry/web:v1".to_string(),
                traffic: None,
                transactions: Vec::new(),
            },
        );

        let mut b = a.clone();
        b.lock = Some(DeploymentLock {
            acquired_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(1),
            owner: "someone".to_string(),
            renewable: true,
        });
        b.compose
            .services
            .get_mut("web")
            .unwrap()
            .transactions
            .push(TransactionLog::new(
                "web",
                "deploy",
                TransactionStatus::Started,
                &VersionTag::parse("v1").unwrap(),
            ));

        assert_eq!(a, b);
    }

    #[test]
    fn state_equality_compares_service_content() {
        let mut a = DeploymentState::default();
        a.compose
            .services
            .insert("web".to_string(), ComposeServiceState::default());
        let mut b = a.clone();
        b.compose.services.get_mut("web").unwrap().container_name = "web-v9".to_string();
        assert_ne!(a, b);
    }

    #[test]
    fn state_yaml_round_trip() {
        let mut state = DeploymentState::default();
        state.tag = Some(VersionTag::parse("deadbeef").unwrap());
        state.proxy.tag = state.tag.clone();
        state.compose.services.insert(
            "api".to_string(),
            ComposeServiceState {
                service_name: "api".to_string(),
                container_name: "api-deadbeef".to_string(),
                hostname: "api-deadbeef".to_string(),
                image: "registry/api:deadbeef".to_string(),
                traffic: Some(TrafficSplit {
                    blue_weight: 30,
                    green_weight: 70,
                }),
                transactions: Vec::new(),
            },
        );

        let yaml = serde_yaml::to_string(&state).unwrap();
        let back: DeploymentState = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(state, back);
        assert_eq!(back.compose.services["api"].traffic.unwrap().blue_weight, 30);
    }
}
