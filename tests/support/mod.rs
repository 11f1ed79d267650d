// ABOUTME: Test support utilities.
// ABOUTME: Provides a scriptable in-memory executor and a canned HTTP responder.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Once;

use stevedore::exec::{CommandOutput, ExecError, Executor};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env()
            .add_directive("stevedore=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// In-memory executor interpreting the exact shell commands the core issues:
/// file operations against a fake filesystem, container inspection against a
/// scriptable health table, and pass-through recording for everything else.
#[derive(Default)]
pub struct MockExecutor {
    files: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, CommandOutput)>>,
    fail_patterns: Mutex<Vec<(String, String)>>,
    health: Mutex<BTreeMap<String, String>>,
}

#[allow(dead_code)]
impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file into the fake filesystem.
    pub fn with_file(self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.lock().insert(path.into(), contents.into());
        self
    }

    pub fn put_file(&self, path: impl Into<String>, contents: impl Into<String>) {
        self.files.lock().insert(path.into(), contents.into());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().get(path).cloned()
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.lock().keys().cloned().collect()
    }

    /// Script the inspected status of a container ("healthy", "running", ...).
    pub fn set_health(&self, container: impl Into<String>, status: impl Into<String>) {
        self.health.lock().insert(container.into(), status.into());
    }

    /// Any command containing `pattern` fails with exit code 1.
    pub fn fail_on(&self, pattern: impl Into<String>, stderr: impl Into<String>) {
        self.fail_patterns.lock().push((pattern.into(), stderr.into()));
    }

    pub fn clear_failures(&self) {
        self.fail_patterns.lock().clear();
    }

    /// Any command containing `pattern` returns the scripted output.
    pub fn respond(&self, pattern: impl Into<String>, output: CommandOutput) {
        self.responses.lock().push((pattern.into(), output));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.contains(pattern))
            .cloned()
            .collect()
    }

    /// Index of the first recorded command containing `pattern`.
    pub fn first_index_of(&self, pattern: &str) -> Option<usize> {
        self.commands.lock().iter().position(|c| c.contains(pattern))
    }

    fn dispatch(&self, command: &str) -> CommandOutput {
        for (pattern, output) in self.responses.lock().iter() {
            if command.contains(pattern.as_str()) {
                return output.clone();
            }
        }
        for (pattern, stderr) in self.fail_patterns.lock().iter() {
            if command.contains(pattern.as_str()) {
                return CommandOutput::failed(1, stderr.clone());
            }
        }

        if command.contains("docker login") {
            return CommandOutput::ok("");
        }
        if command.starts_with("docker compose") {
            return CommandOutput::ok("");
        }
        if command.starts_with("docker rm -f") {
            for name in shell_words(command).into_iter().skip(3) {
                self.health.lock().remove(&name);
            }
            return CommandOutput::ok("");
        }
        if command.starts_with("docker inspect") {
            let words = shell_words(command);
            let Some(name) = words.last() else {
                return CommandOutput::failed(1, "no container name");
            };
            return match self.health.lock().get(name) {
                Some(status) => CommandOutput::ok(format!("{}\n", status)),
                None => CommandOutput::failed(1, format!("no such container: {}", name)),
            };
        }
        if command.starts_with("git rev-parse") {
            return CommandOutput::ok("deadbee\n");
        }
        if command.starts_with("git") || command == "true" {
            return CommandOutput::ok("");
        }

        let words = shell_words(command);
        let program = words.first().cloned();
        match program.as_deref() {
            Some("cat") => match words.get(1).and_then(|p| self.files.lock().get(p).cloned()) {
                Some(contents) => CommandOutput::ok(contents),
                None => CommandOutput::failed(1, "No such file or directory"),
            },
            Some("mkdir") => CommandOutput::ok(""),
            Some("printf") => {
                // printf '%s' '<content>' > '<path>'
                let (content, path) = match (words.get(2), words.get(3), words.get(4)) {
                    (Some(content), Some(gt), Some(path)) if gt.as_str() == ">" => (content, path),
                    _ => return CommandOutput::failed(2, "printf: malformed invocation"),
                };
                self.files.lock().insert(path.clone(), content.clone());
                CommandOutput::ok("")
            }
            Some("mv") => {
                let (from, to) = match (words.get(2), words.get(3)) {
                    (Some(from), Some(to)) => (from.clone(), to.clone()),
                    _ => return CommandOutput::failed(2, "mv: malformed invocation"),
                };
                let mut files = self.files.lock();
                match files.remove(&from) {
                    Some(contents) => {
                        files.insert(to, contents);
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(1, "No such file or directory"),
                }
            }
            Some("rm") => {
                let mut files = self.files.lock();
                for path in words.into_iter().skip(2) {
                    files.remove(&path);
                }
                CommandOutput::ok("")
            }
            Some("ls") => {
                let Some(dir) = words.get(2) else {
                    return CommandOutput::failed(2, "ls: malformed invocation");
                };
                let prefix = format!("{}/", dir);
                let mut entries: Vec<String> = self
                    .files
                    .lock()
                    .keys()
                    .filter_map(|path| path.strip_prefix(&prefix))
                    .filter(|rest| !rest.contains('/'))
                    .map(String::from)
                    .collect();
                entries.sort();
                CommandOutput::ok(entries.join("\n"))
            }
            Some("test") => {
                let Some(path) = words.get(2) else {
                    return CommandOutput::failed(2, "test: malformed invocation");
                };
                let files = self.files.lock();
                let exists = files.contains_key(path)
                    || files.keys().any(|k| k.starts_with(&format!("{}/", path)));
                if exists {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(1, "")
                }
            }
            _ => CommandOutput::ok(""),
        }
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn exec(&self, command: &str) -> Result<CommandOutput, ExecError> {
        self.commands.lock().push(command.to_string());
        Ok(self.dispatch(command))
    }

    async fn test(&self) -> bool {
        true
    }

    async fn verify(&self) -> Result<(), ExecError> {
        Ok(())
    }

    async fn send_file(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        let contents = tokio::fs::read_to_string(local).await?;
        self.files.lock().insert(remote.to_string(), contents);
        Ok(())
    }
}

/// Split a shell command into words, honoring single quotes and the
/// `'\''` escape produced by `exec::quote`.
fn shell_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut has_word = false;
    let mut in_quote = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        if in_quote {
            if c == '\'' {
                in_quote = false;
            } else {
                current.push(c);
            }
            continue;
        }
        match c {
            '\'' => {
                in_quote = true;
                has_word = true;
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_word = true;
                }
            }
            c if c.is_whitespace() => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            _ => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if has_word {
        words.push(current);
    }
    words
}

/// Serve a canned HTTP response for every connection until dropped.
#[allow(dead_code)]
pub async fn spawn_http_responder(response: &'static str) -> std::net::SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

/// A TCP port with nothing listening on it.
#[allow(dead_code)]
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[allow(dead_code)]
pub const HTTP_OK: &str = "HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
#[allow(dead_code)]
pub const HTTP_SERVER_ERROR: &str =
    "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
