// ABOUTME: Declarative compose-file model: services, placement labels, dependencies.
// ABOUTME: Parsed permissively - unknown keys are ignored, env/depends_on accept both forms.

mod override_file;
mod runner;

pub use override_file::{ComposeOverride, OverrideService};
pub use runner::{ComposeRunner, RegistryConfig};

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Label constraining a service to one host.
pub const PLACEMENT_HOST: &str = "stevedore.placement.host";
/// Label constraining a service to a comma-separated host set.
pub const PLACEMENT_HOSTS: &str = "stevedore.placement.hosts";

#[derive(Debug, Clone, Deserialize)]
pub struct ComposeConfig {
    #[serde(default)]
    pub version: Option<String>,
    pub services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeService {
    #[serde(default)]
    pub build: Option<BuildConfig>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, deserialize_with = "deserialize_env")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub env_file: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_depends_on")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    Context(String),
    Detailed {
        context: String,
        #[serde(default)]
        dockerfile: Option<String>,
        #[serde(default)]
        args: BTreeMap<String, String>,
    },
}

impl ComposeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ComposeNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }
}

impl ComposeService {
    /// Explicit placement constraint, resolved from labels.
    /// Empty means the service may run on every supplied host.
    pub fn placement(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        if let Some(host) = self.labels.get(PLACEMENT_HOST) {
            if !host.is_empty() {
                hosts.push(host.trim().to_string());
            }
        }
        if let Some(list) = self.labels.get(PLACEMENT_HOSTS) {
            for host in list.split(',') {
                let host = host.trim();
                if !host.is_empty() {
                    hosts.push(host.to_string());
                }
            }
        }
        hosts
    }

    /// Whether the service declares something to run.
    pub fn has_container(&self) -> bool {
        self.image.is_some() || self.build.is_some()
    }
}

// Compose allows `environment` as either a mapping (whose scalar values may
// be unquoted numbers or booleans) or a list of KEY=VALUE strings.
fn deserialize_env<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum EnvEntry {
        Map(BTreeMap<String, serde_yaml::Value>),
        List(Vec<String>),
    }

    match EnvEntry::deserialize(deserializer)? {
        EnvEntry::Map(map) => Ok(map
            .into_iter()
            .filter_map(|(key, value)| scalar_to_string(value).map(|v| (key, v)))
            .collect()),
        EnvEntry::List(list) => Ok(list
            .into_iter()
            .filter_map(|item| {
                item.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()),
    }
}

fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// `env_file` is a single path or a list of paths.
fn deserialize_string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entry {
        One(String),
        Many(Vec<String>),
    }

    match Entry::deserialize(deserializer)? {
        Entry::One(s) => Ok(vec![s]),
        Entry::Many(v) => Ok(v),
    }
}

// `depends_on` is a list of names or a mapping with per-dependency conditions;
// only the names matter here.
fn deserialize_depends_on<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entry {
        List(Vec<String>),
        Map(BTreeMap<String, serde_yaml::Value>),
    }

    match Entry::deserialize(deserializer)? {
        Entry::List(list) => Ok(list),
        Entry::Map(map) => Ok(map.into_keys().collect()),
    }
}
