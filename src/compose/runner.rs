// ABOUTME: Thin wrapper shelling out to `docker compose` through an executor.
// ABOUTME: Build, push, pull, up, teardown, and registry login for one compose project.

use std::sync::Arc;

use crate::exec::{quote, ExecError, Executor, Result};

/// Registry credentials supplied via flags or environment.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub registry: String,
    pub username: String,
    pub password: String,
}

/// Runs compose operations for one project through an executor.
#[derive(Clone)]
pub struct ComposeRunner {
    executor: Arc<dyn Executor>,
    compose_file: String,
}

impl ComposeRunner {
    pub fn new(executor: Arc<dyn Executor>, compose_file: impl Into<String>) -> Self {
        Self {
            executor,
            compose_file: compose_file.into(),
        }
    }

    async fn compose(&self, override_file: Option<&str>, args: &str) -> Result<String> {
        let mut command = format!("docker compose -f {}", quote(&self.compose_file));
        if let Some(path) = override_file {
            command.push_str(&format!(" -f {}", quote(path)));
        }
        command.push(' ');
        command.push_str(args);

        let output = self.executor.exec_checked(&command).await?;
        Ok(output.stdout)
    }

    /// Authenticate against the image registry before push or pull.
    pub async fn login(&self, registry: &RegistryConfig) -> Result<()> {
        let command = format!(
            "printf '%s' {} | docker login {} -u {} --password-stdin",
            quote(&registry.password),
            quote(&registry.registry),
            quote(&registry.username),
        );
        self.executor.exec_checked(&command).await?;
        Ok(())
    }

    pub async fn build(&self, override_file: &str) -> Result<String> {
        self.compose(Some(override_file), "build").await
    }

    pub async fn push(&self, override_file: &str) -> Result<String> {
        self.compose(Some(override_file), "push").await
    }

    pub async fn pull(&self, override_file: &str) -> Result<String> {
        self.compose(Some(override_file), "pull").await
    }

    /// Start the override's containers alongside whatever is already
    /// running. Orphans are deliberately left alone - the previous version
    /// keeps serving until traffic has shifted.
    pub async fn up(&self, override_file: &str) -> Result<String> {
        self.compose(Some(override_file), "up -d --no-build").await
    }

    /// Force-remove the named containers. An empty list is a no-op.
    pub async fn down(&self, containers: &[String]) -> Result<()> {
        if containers.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = containers.iter().map(|c| quote(c)).collect();
        self.executor
            .exec_checked(&format!("docker rm -f {}", names.join(" ")))
            .await?;
        Ok(())
    }

    /// Report a container's run state, e.g. "running" or "exited".
    pub async fn inspect_status(&self, container: &str) -> Result<String> {
        let output = self
            .executor
            .exec(&format!(
                "docker inspect --format '{{{{.State.Status}}}}' {}",
                quote(container)
            ))
            .await?;
        if !output.success() {
            return Err(ExecError::CommandFailed {
                command: format!("docker inspect {}", container),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout.trim().to_string())
    }
}
