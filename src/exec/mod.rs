// ABOUTME: The remote command executor boundary consumed by the orchestration core.
// ABOUTME: Defines the Executor trait plus canonical file-operation helpers over shell commands.

mod local;
mod ssh;

pub use local::LocalExecutor;
pub use ssh::{SshConfig, SshExecutor};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: no valid credentials")]
    AuthenticationFailed,

    #[error("failed to load key from {path}: {reason}")]
    KeyLoadFailed {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("command `{command}` failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: u32,
        stderr: String,
    },

    #[error("command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),

    #[error("channel closed unexpectedly without exit status")]
    ChannelClosed,

    #[error("environment check failed: {0}")]
    EnvironmentCheck(String),

    #[error("file transfer failed: {0}")]
    Transfer(String),

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Output from a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code of the command.
    pub exit_code: u32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: u32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Shell command and file transfer abstraction over a host.
///
/// Every `exec` is synchronous from the caller's point of view and may mutate
/// host state. The core does not retry failed commands; retry policy belongs
/// to the implementation behind this trait.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a shell command and return its output.
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Probe connectivity. Never fails; returns false when the host is unreachable.
    async fn test(&self) -> bool;

    /// Check that the host satisfies deployment prerequisites.
    async fn verify(&self) -> Result<()>;

    /// Transfer a local file to a path on the host.
    async fn send_file(&self, local: &std::path::Path, remote: &str) -> Result<()>;

    /// Execute a command, mapping a non-zero exit into an error.
    async fn exec_checked(&self, command: &str) -> Result<CommandOutput> {
        let output = self.exec(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ExecError::CommandFailed {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }
}

/// Quote a string for safe interpolation into a shell command.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Read a file from the host. A missing file is `None`, not an error;
/// only transport failures propagate.
pub async fn read_file(executor: &dyn Executor, path: &str) -> Result<Option<String>> {
    let output = executor.exec(&format!("cat {}", quote(path))).await?;
    if output.success() {
        Ok(Some(output.stdout))
    } else {
        Ok(None)
    }
}

/// Write a file on the host, creating its parent directory first.
pub async fn write_file(executor: &dyn Executor, path: &str, contents: &str) -> Result<()> {
    if let Some(dir) = parent_dir(path) {
        executor
            .exec_checked(&format!("mkdir -p {}", quote(dir)))
            .await?;
    }
    executor
        .exec_checked(&format!("printf '%s' {} > {}", quote(contents), quote(path)))
        .await?;
    Ok(())
}

/// Atomically rename a file on the host.
pub async fn rename_file(executor: &dyn Executor, from: &str, to: &str) -> Result<()> {
    executor
        .exec_checked(&format!("mv -f {} {}", quote(from), quote(to)))
        .await?;
    Ok(())
}

/// Remove a file on the host. Removing a missing file is not an error.
pub async fn remove_file(executor: &dyn Executor, path: &str) -> Result<()> {
    executor
        .exec_checked(&format!("rm -f {}", quote(path)))
        .await?;
    Ok(())
}

/// List the entries of a directory on the host. A missing directory is empty.
pub async fn list_dir(executor: &dyn Executor, dir: &str) -> Result<Vec<String>> {
    let output = executor.exec(&format!("ls -1 {}", quote(dir))).await?;
    if !output.success() {
        return Ok(Vec::new());
    }
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Check whether a path exists on the host.
pub async fn file_exists(executor: &dyn Executor, path: &str) -> Result<bool> {
    let output = executor.exec(&format!("test -e {}", quote(path))).await?;
    Ok(output.success())
}

pub(crate) fn parent_dir(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}
