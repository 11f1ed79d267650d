// ABOUTME: Internal service descriptor and dependency-ordered deployment planning.
// ABOUTME: Three-color depth-first traversal fails fast on cyclic depends_on graphs.

use std::collections::BTreeMap;

use super::DeployError;
use crate::compose::{ComposeConfig, ComposeService};

/// A deployable unit derived from one compose service.
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub image: Option<String>,
    pub hostname: String,
    pub depends_on: Vec<String>,
    /// Explicit placement; empty means every supplied host.
    pub placement: Vec<String>,
    pub env_files: Vec<String>,
    pub has_container: bool,
}

impl Service {
    pub fn from_compose(name: &str, service: &ComposeService) -> Self {
        Self {
            name: name.to_string(),
            image: service.image.clone(),
            hostname: service
                .hostname
                .clone()
                .unwrap_or_else(|| name.to_string()),
            depends_on: service.depends_on.clone(),
            placement: service.placement(),
            env_files: service.env_file.clone(),
            has_container: service.has_container(),
        }
    }

    /// Convert every compose service into a descriptor, keyed by name.
    pub fn all_from_compose(compose: &ComposeConfig) -> BTreeMap<String, Service> {
        compose
            .services
            .iter()
            .map(|(name, service)| (name.clone(), Service::from_compose(name, service)))
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Gray,
    Black,
}

/// Topologically order services so dependencies deploy before dependents.
///
/// Uses a three-color depth-first visit; a gray-on-gray hit is a cycle and
/// fails fast rather than guessing which edge to drop. A service with no
/// container spec contributes no edges.
pub fn deploy_order(services: &BTreeMap<String, Service>) -> Result<Vec<String>, DeployError> {
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut order = Vec::with_capacity(services.len());

    for name in services.keys() {
        visit(name, services, &mut marks, &mut order)?;
    }

    Ok(order)
}

fn visit<'a>(
    name: &'a str,
    services: &'a BTreeMap<String, Service>,
    marks: &mut BTreeMap<&'a str, Mark>,
    order: &mut Vec<String>,
) -> Result<(), DeployError> {
    match marks.get(name) {
        Some(Mark::Black) => return Ok(()),
        Some(Mark::Gray) => return Err(DeployError::CyclicDependency(name.to_string())),
        None => {}
    }

    let service = services
        .get(name)
        .ok_or_else(|| DeployError::UnknownService(name.to_string()))?;

    marks.insert(name, Mark::Gray);

    if service.has_container {
        for dependency in &service.depends_on {
            if !services.contains_key(dependency) {
                return Err(DeployError::UnknownDependency {
                    service: name.to_string(),
                    dependency: dependency.clone(),
                });
            }
            visit(dependency, services, marks, order)?;
        }
    }

    marks.insert(name, Mark::Black);
    order.push(name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, deps: &[&str]) -> Service {
        Service {
            name: name.to_string(),
            image: Some(name.to_string()),
            hostname: name.to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            placement: Vec::new(),
            env_files: Vec::new(),
            has_container: true,
        }
    }

    fn graph(entries: &[(&str, &[&str])]) -> BTreeMap<String, Service> {
        entries
            .iter()
            .map(|(name, deps)| (name.to_string(), service(name, deps)))
            .collect()
    }

    #[test]
    fn dependencies_come_before_dependents() {
        let services = graph(&[("web", &["db", "cache"]), ("db", &[]), ("cache", &["db"])]);
        let order = deploy_order(&services).unwrap();

        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("db") < pos("cache"));
        assert!(pos("cache") < pos("web"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn cycle_is_detected_not_recursed() {
        let services = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        assert!(matches!(
            deploy_order(&services),
            Err(DeployError::CyclicDependency(_))
        ));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let services = graph(&[("a", &["a"])]);
        assert!(matches!(
            deploy_order(&services),
            Err(DeployError::CyclicDependency(_))
        ));
    }

    #[test]
    fn unknown_dependency_fails_fast() {
        let services = graph(&[("web", &["ghost"])]);
        assert!(matches!(
            deploy_order(&services),
            Err(DeployError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn service_without_container_contributes_no_edges() {
        let mut services = graph(&[("web", &[])]);
        services.insert(
            "marker".to_string(),
            Service {
                name: "marker".to_string(),
                image: None,
                hostname: "marker".to_string(),
                depends_on: vec!["ghost".to_string()],
                placement: Vec::new(),
                env_files: Vec::new(),
                has_container: false,
            },
        );

        // the dangling edge is ignored because the service runs nothing
        let order = deploy_order(&services).unwrap();
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn diamond_dependencies_visit_each_service_once() {
        let services = graph(&[
            ("top", &["left", "right"]),
            ("left", &["base"]),
            ("right", &["base"]),
            ("base", &[]),
        ]);
        let order = deploy_order(&services).unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order.iter().filter(|n| *n == "base").count(), 1);
    }
}
