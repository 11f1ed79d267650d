// ABOUTME: Versioned compose override - renames containers and retags images for one rollout.
// ABOUTME: Written beside the compose file so any process can derive container names from the tag.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ComposeConfig;
use crate::state::VersionTag;

/// A compose override fragment pinning every covered service to one version:
/// `container_name` and `hostname` gain the `-<tag>` suffix, and locally
/// built images are retagged to the deployed version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeOverride {
    pub services: BTreeMap<String, OverrideService>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideService {
    pub container_name: String,
    pub hostname: String,
    pub image: String,
}

impl ComposeOverride {
    /// Build an override covering every service in the compose file.
    pub fn new(compose: &ComposeConfig, tag: &VersionTag) -> Self {
        Self::for_services(compose, compose.services.keys().map(String::as_str), tag)
    }

    /// Build an override covering only the named services.
    pub fn for_services<'a>(
        compose: &ComposeConfig,
        names: impl IntoIterator<Item = &'a str>,
        tag: &VersionTag,
    ) -> Self {
        let mut services = BTreeMap::new();

        for name in names {
            let Some(service) = compose.services.get(name) else {
                continue;
            };
            if !service.has_container() {
                continue;
            }

            let hostname = service.hostname.as_deref().unwrap_or(name);
            let declared = service.image.as_deref().unwrap_or(name);
            // only locally built images are retagged; external images keep
            // their declared reference
            let image = if service.build.is_some() {
                format!("{}:{}", strip_tag(declared), tag)
            } else {
                declared.to_string()
            };

            services.insert(
                name.to_string(),
                OverrideService {
                    container_name: format!("{}-{}", name, tag),
                    hostname: format!("{}-{}", hostname, tag),
                    image,
                },
            );
        }

        Self { services }
    }

    pub fn to_yaml(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(self)
    }

    /// Container names this override will create.
    pub fn container_names(&self) -> Vec<String> {
        self.services
            .values()
            .map(|s| s.container_name.clone())
            .collect()
    }
}

/// Strip the tag from an image reference, keeping any registry port intact.
fn strip_tag(image: &str) -> &str {
    match image.rfind(':') {
        Some(idx) if !image[idx + 1..].contains('/') => &image[..idx],
        _ => image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> VersionTag {
        VersionTag::parse(s).unwrap()
    }

    fn sample() -> ComposeConfig {
        ComposeConfig::from_yaml(
            r#"
services:
  web:
    build: .
    image: registry.example.com:5000/web:latest
    hostname: web
  db:
    image: postgres:16
"#,
        )
        .unwrap()
    }

    #[test]
    fn built_services_are_retagged() {
        let override_file = ComposeOverride::new(&sample(), &tag("abc123"));
        let web = &override_file.services["web"];
        assert_eq!(web.container_name, "web-abc123");
        assert_eq!(web.hostname, "web-abc123");
        assert_eq!(web.image, "registry.example.com:5000/web:abc123");
    }

    #[test]
    fn external_images_keep_their_reference() {
        let override_file = ComposeOverride::new(&sample(), &tag("abc123"));
        let db = &override_file.services["db"];
        assert_eq!(db.container_name, "db-abc123");
        assert_eq!(db.image, "postgres:16");
    }

    #[test]
    fn for_services_filters_to_named_subset() {
        let override_file = ComposeOverride::for_services(&sample(), ["db"], &tag("v1"));
        assert_eq!(override_file.services.len(), 1);
        assert!(override_file.services.contains_key("db"));
    }

    #[test]
    fn strip_tag_handles_registry_ports() {
        assert_eq!(strip_tag("registry:5000/app:v1"), "registry:5000/app");
        assert_eq!(strip_tag("registry:5000/app"), "registry:5000/app");
        assert_eq!(strip_tag("app:v1"), "app");
        assert_eq!(strip_tag("app"), "app");
    }

    #[test]
    fn serializes_as_compose_fragment() {
        let override_file = ComposeOverride::for_services(&sample(), ["web"], &tag("v1"));
        let yaml = override_file.to_yaml().unwrap();
        assert!(yaml.contains("container_name: web-v1"));
        assert!(yaml.contains("services:"));
    }
}
