// ABOUTME: Reverse-proxy dynamic configuration schema and rewriting helpers.
// ABOUTME: The core only copies, rewrites, and deletes these documents - never authors them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::state::VersionTag;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid backend URL (expected host:port): {0}")]
    InvalidBackendUrl(String),

    #[error("invalid port number in backend URL {url}: {port}")]
    InvalidPort { url: String, port: String },

    #[error("YAML error in proxy config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// A hot-reloadable routing document for the reverse proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, Router>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ProxyService>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub rule: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTls>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterTls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyService {
    pub load_balancer: LoadBalancer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    #[serde(default)]
    pub servers: Vec<BackendServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendServer {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

/// Declarative health check attached to a load-balanced service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Override the probed hostname (defaults to the backend's host).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Override the probed port (defaults to the backend's port).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub interval: Option<Duration>,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl DynamicConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Produce a copy of this config retargeted at the given version:
    /// every backend server address becomes `host-<tag>:port`, and every
    /// router and service key (plus router service references) gains the
    /// `-<tag>` suffix.
    pub fn rewrite_for(&self, tag: &VersionTag) -> Result<DynamicConfig> {
        let mut http = HttpConfig::default();

        for (name, service) in &self.http.services {
            let mut service = service.clone();
            for server in &mut service.load_balancer.servers {
                let (host, port) = parse_backend_url(&server.url)?;
                server.url = format!("http://{}-{}:{}", host, tag, port);
            }
            http.services.insert(format!("{}-{}", name, tag), service);
        }

        for (name, router) in &self.http.routers {
            let mut router = router.clone();
            router.service = format!("{}-{}", router.service, tag);
            http.routers.insert(format!("{}-{}", name, tag), router);
        }

        Ok(DynamicConfig { http })
    }
}

/// Parse a backend URL into host and port components.
/// The URL must be in the form `host:port`, optionally with an http(s) scheme.
pub fn parse_backend_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');

    let (host, port) = stripped
        .split_once(':')
        .ok_or_else(|| ProxyError::InvalidBackendUrl(url.to_string()))?;

    if host.is_empty() || port.contains(':') {
        return Err(ProxyError::InvalidBackendUrl(url.to_string()));
    }

    let port: u16 = port.parse().map_err(|_| ProxyError::InvalidPort {
        url: url.to_string(),
        port: port.to_string(),
    })?;

    if port == 0 {
        return Err(ProxyError::InvalidPort {
            url: url.to_string(),
            port: "0".to_string(),
        });
    }

    Ok((host.to_string(), port))
}

/// Name of the transient deploy copy written for a version.
pub fn deploy_config_name(stem: &str, tag: &VersionTag) -> String {
    format!("{}-{}-deploy.yml", stem, tag)
}

/// Name of the promoted (live) config for a version.
pub fn live_config_name(stem: &str, tag: &VersionTag) -> String {
    format!("{}-{}.yml", stem, tag)
}

/// Strip the `.yml`/`.yaml` extension and an optional `-<tag>` suffix,
/// yielding the logical stem a versioned copy derives its name from.
pub fn config_stem(filename: &str, tag: Option<&VersionTag>) -> String {
    let stem = filename
        .strip_suffix(".yml")
        .or_else(|| filename.strip_suffix(".yaml"))
        .unwrap_or(filename);
    if let Some(tag) = tag {
        if let Some(base) = stem.strip_suffix(&format!("-{}", tag)) {
            return base.to_string();
        }
    }
    stem.to_string()
}

/// Whether a config filename embeds the given version tag.
pub fn embeds_tag(filename: &str, tag: &VersionTag) -> bool {
    filename.ends_with(&format!("-{}.yml", tag))
        || filename.ends_with(&format!("-{}-deploy.yml", tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> VersionTag {
        VersionTag::parse(s).unwrap()
    }

    fn sample_config() -> DynamicConfig {
        let yaml = r#"
http:
  routers:
    web:
      rule: "Host(`example.com`)"
      service: web
      entryPoints: [websecure]
  services:
    web:
      loadBalancer:
        servers:
          - url: "http://web:8080"
        healthCheck:
          path: /health
          interval: 5s
"#;
        DynamicConfig::from_yaml(yaml).unwrap()
    }

    #[test]
    fn parses_camel_case_keys() {
        let config = sample_config();
        let service = &config.http.services["web"];
        assert_eq!(service.load_balancer.servers[0].url, "http://web:8080");
        let check = service.load_balancer.health_check.as_ref().unwrap();
        assert_eq!(check.path, "/health");
        assert_eq!(check.interval, Some(Duration::from_secs(5)));
        assert_eq!(config.http.routers["web"].entry_points, vec!["websecure"]);
    }

    #[test]
    fn rewrite_suffixes_backends_and_routers() {
        let rewritten = sample_config().rewrite_for(&tag("v2")).unwrap();
        let service = &rewritten.http.services["web-v2"];
        assert_eq!(service.load_balancer.servers[0].url, "http://web-v2:8080");
        assert_eq!(rewritten.http.routers["web-v2"].service, "web-v2");
        // the health check spec rides along untouched
        assert!(service.load_balancer.health_check.is_some());
    }

    #[test]
    fn rewrite_rejects_malformed_backend_url() {
        let mut config = sample_config();
        config
            .http
            .services
            .get_mut("web")
            .unwrap()
            .load_balancer
            .servers[0]
            .url = "just-a-host".to_string();
        assert!(matches!(
            config.rewrite_for(&tag("v2")),
            Err(ProxyError::InvalidBackendUrl(_))
        ));
    }

    #[test]
    fn parse_backend_url_accepts_scheme_and_plain_forms() {
        assert_eq!(
            parse_backend_url("http://web:8080").unwrap(),
            ("web".to_string(), 8080)
        );
        assert_eq!(
            parse_backend_url("db:5432").unwrap(),
            ("db".to_string(), 5432)
        );
    }

    #[test]
    fn parse_backend_url_rejects_bad_input() {
        assert!(parse_backend_url("no-port").is_err());
        assert!(parse_backend_url("host:notaport").is_err());
        assert!(parse_backend_url("host:0").is_err());
        assert!(parse_backend_url(":8080").is_err());
    }

    #[test]
    fn config_stem_strips_extension_and_tag() {
        assert_eq!(config_stem("web.yml", None), "web");
        assert_eq!(config_stem("web-v1.yml", Some(&tag("v1"))), "web");
        assert_eq!(config_stem("web-v1.yml", Some(&tag("v2"))), "web-v1");
    }

    #[test]
    fn embeds_tag_matches_live_and_deploy_names() {
        assert!(embeds_tag("web-v1.yml", &tag("v1")));
        assert!(embeds_tag("web-v1-deploy.yml", &tag("v1")));
        assert!(!embeds_tag("web.yml", &tag("v1")));
        assert!(!embeds_tag("web-v2.yml", &tag("v1")));
    }

    #[test]
    fn yaml_round_trip_preserves_content() {
        let config = sample_config();
        let yaml = config.to_yaml().unwrap();
        let back = DynamicConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config, back);
    }
}
