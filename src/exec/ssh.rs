// ABOUTME: SSH-backed executor using russh.
// ABOUTME: Handles connection, authentication, command execution, and file transfer.

use super::{quote, CommandOutput, ExecError, Executor, Result};
use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::{check_known_hosts, learn_known_hosts};
use russh::keys::{load_secret_key, ssh_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

/// Configuration for establishing an SSH-backed executor.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote host to connect to.
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Username for authentication.
    pub user: String,
    /// Optional path to private key file.
    /// If None, will try SSH agent then default key locations.
    pub key_path: Option<PathBuf>,
    /// Whether to accept unknown hosts (Trust On First Use).
    pub trust_on_first_use: bool,
    /// Timeout for command execution (default: 5 minutes).
    pub command_timeout: Duration,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            key_path: None,
            trust_on_first_use: false,
            command_timeout: Duration::from_secs(300),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn trust_on_first_use(mut self, tofu: bool) -> Self {
        self.trust_on_first_use = tofu;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    trust_on_first_use: bool,
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) | Err(russh::keys::Error::KeyChanged { .. }) if !self.trust_on_first_use => {
                Ok(false)
            }
            Err(russh::keys::Error::KeyChanged { .. }) => Ok(false),
            _ => {
                if self.trust_on_first_use {
                    tracing::warn!(
                        "Trust-On-First-Use: accepting unknown host key for {}:{}",
                        self.host,
                        self.port
                    );
                    if let Err(e) = learn_known_hosts(&self.host, self.port, server_public_key) {
                        tracing::warn!("Failed to save host key to known_hosts: {}", e);
                    }
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }
}

/// Authentication method resolved from config.
enum AuthMethod {
    Agent(AgentClient<UnixStream>),
    KeyFile(Arc<ssh_key::PrivateKey>),
}

/// Executor that runs commands on a remote host over SSH.
///
/// All commands are serialized through an internal mutex so that per-host
/// state-file mutations issued through this executor never interleave.
pub struct SshExecutor {
    config: SshConfig,
    handle: Handle<SshHandler>,
    exec_lock: Mutex<()>,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .finish()
    }
}

impl SshExecutor {
    /// Connect to the remote host.
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let auth_method = Self::resolve_auth_method(&config).await?;

        let russh_config = Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            trust_on_first_use: config.trust_on_first_use,
        };

        let mut session = client::connect(
            Arc::new(russh_config),
            (config.host.as_str(), config.port),
            handler,
        )
        .await
        .map_err(|e| ExecError::Connection(format!("{}:{}: {}", config.host, config.port, e)))?;

        let auth_success = Self::authenticate(&mut session, &config, auth_method).await?;
        if !auth_success {
            return Err(ExecError::AuthenticationFailed);
        }

        Ok(Self {
            config,
            handle: session,
            exec_lock: Mutex::new(()),
        })
    }

    /// Resolve which authentication method to use.
    async fn resolve_auth_method(config: &SshConfig) -> Result<AuthMethod> {
        if let Some(key_path) = &config.key_path {
            let key = load_secret_key(key_path, None).map_err(|e| ExecError::KeyLoadFailed {
                path: key_path.clone(),
                reason: e.to_string(),
            })?;
            return Ok(AuthMethod::KeyFile(Arc::new(key)));
        }

        if let Ok(agent) = AgentClient::connect_env().await {
            return Ok(AuthMethod::Agent(agent));
        }

        let home = std::env::var("HOME").map_err(|_| {
            ExecError::Connection("SSH agent not available and HOME not set".to_string())
        })?;

        let default_keys = [
            format!("{}/.ssh/id_ed25519", home),
            format!("{}/.ssh/id_rsa", home),
            format!("{}/.ssh/id_ecdsa", home),
        ];

        for key_path in &default_keys {
            if let Ok(key) = load_secret_key(key_path, None) {
                return Ok(AuthMethod::KeyFile(Arc::new(key)));
            }
        }

        Err(ExecError::Connection(
            "SSH agent not available and no default keys found".to_string(),
        ))
    }

    /// Authenticate the session.
    async fn authenticate(
        session: &mut Handle<SshHandler>,
        config: &SshConfig,
        auth_method: AuthMethod,
    ) -> Result<bool> {
        match auth_method {
            AuthMethod::Agent(mut agent) => {
                let keys = agent.request_identities().await.map_err(|e| {
                    ExecError::Connection(format!("failed to list agent keys: {}", e))
                })?;

                if keys.is_empty() {
                    return Err(ExecError::Connection("no keys in SSH agent".to_string()));
                }

                for key in &keys {
                    match session
                        .authenticate_publickey_with(&config.user, key.clone(), None, &mut agent)
                        .await
                    {
                        Ok(result) if result.success() => return Ok(true),
                        _ => continue,
                    }
                }
                Ok(false)
            }
            AuthMethod::KeyFile(key) => {
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(ExecError::Protocol)?
                    .flatten();

                let result = session
                    .authenticate_publickey(&config.user, PrivateKeyWithHashAlg::new(key, hash_alg))
                    .await
                    .map_err(ExecError::Protocol)?;

                Ok(result.success())
            }
        }
    }

    async fn exec_inner(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(ExecError::Protocol)?;

        channel
            .exec(true, command)
            .await
            .map_err(ExecError::Protocol)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0u32;

        let mut got_exit_status = false;
        let mut got_eof = false;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        // stderr
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = exit_status;
                    got_exit_status = true;
                    if got_eof {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) => {
                    got_eof = true;
                    if got_exit_status {
                        break;
                    }
                }
                Some(ChannelMsg::Close) => break,
                Some(_) => {}
                None => break,
            }
        }

        // A channel that closes without an exit status indicates abnormal
        // termination (connection drop, network issue).
        if !got_exit_status {
            return Err(ExecError::ChannelClosed);
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }

    /// Disconnect from the remote host.
    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(ExecError::Protocol)?;
        Ok(())
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let _guard = self.exec_lock.lock().await;
        tracing::debug!(host = %self.config.host, command, "executing remote command");
        match tokio::time::timeout(self.config.command_timeout, self.exec_inner(command)).await {
            Ok(result) => result,
            Err(_) => Err(ExecError::CommandTimeout(self.config.command_timeout)),
        }
    }

    async fn test(&self) -> bool {
        matches!(self.exec("true").await, Ok(output) if output.success())
    }

    async fn verify(&self) -> Result<()> {
        let output = self.exec("docker compose version").await?;
        if !output.success() {
            return Err(ExecError::EnvironmentCheck(format!(
                "docker compose is not available on {}: {}",
                self.config.host,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn send_file(&self, local: &Path, remote: &str) -> Result<()> {
        let contents = tokio::fs::read(local).await?;

        let _guard = self.exec_lock.lock().await;
        tracing::debug!(
            host = %self.config.host,
            local = %local.display(),
            remote,
            bytes = contents.len(),
            "transferring file"
        );

        if let Some(dir) = super::parent_dir(remote) {
            // mkdir outside the streaming channel so the error is attributable
            let output = self
                .exec_inner(&format!("mkdir -p {}", quote(dir)))
                .await?;
            if !output.success() {
                return Err(ExecError::Transfer(format!(
                    "failed to create {}: {}",
                    dir, output.stderr
                )));
            }
        }

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(ExecError::Protocol)?;

        channel
            .exec(true, format!("cat > {}", quote(remote)))
            .await
            .map_err(ExecError::Protocol)?;

        channel
            .data(&contents[..])
            .await
            .map_err(|e| ExecError::Transfer(e.to_string()))?;
        channel.eof().await.map_err(ExecError::Protocol)?;

        let mut exit_code = None;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        match exit_code {
            Some(0) => Ok(()),
            Some(code) => Err(ExecError::Transfer(format!(
                "remote write to {} exited with {}",
                remote, code
            ))),
            None => Err(ExecError::ChannelClosed),
        }
    }
}
