// ABOUTME: Local executor running commands through the system shell.
// ABOUTME: Used for building and pushing images on the machine invoking the tool.

use super::{CommandOutput, ExecError, Executor, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// Executes commands on the local machine via `sh -c`.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        tracing::debug!(command, "executing local command");
        let output = Command::new("sh").arg("-c").arg(command).output().await?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1) as u32,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn test(&self) -> bool {
        true
    }

    async fn verify(&self) -> Result<()> {
        for (binary, probe) in [
            ("git", "git --version"),
            ("docker compose", "docker compose version"),
        ] {
            let output = self.exec(probe).await?;
            if !output.success() {
                return Err(ExecError::EnvironmentCheck(format!(
                    "{} is not available: {}",
                    binary,
                    output.stderr.trim()
                )));
            }
        }
        Ok(())
    }

    async fn send_file(&self, local: &Path, remote: &str) -> Result<()> {
        if let Some(parent) = Path::new(remote).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, remote).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_captures_stdout_and_exit_code() {
        let executor = LocalExecutor::new();
        let output = executor.exec("echo hello").await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn exec_reports_failure_exit_code() {
        let executor = LocalExecutor::new();
        let output = executor.exec("exit 3").await.unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn exec_checked_maps_failure_to_error() {
        let executor = LocalExecutor::new();
        let err = executor.exec_checked("echo oops >&2; exit 1").await;
        assert!(matches!(err, Err(ExecError::CommandFailed { .. })));
    }
}
