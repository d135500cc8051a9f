//! Local transport: the agent runs as a child process on this machine.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{AgentReader, AgentTransport, AgentWriter, ConnectTarget, AGENT_BINARY_NAME};
use crate::error::SessionError;

/// Development transport. No SSH; `deploy()` does nothing.
pub struct LocalTransport {
    binary: Option<PathBuf>,
    args: Vec<String>,
    child: Option<Child>,
    reader: Option<AgentReader>,
    writer: Option<AgentWriter>,
}

impl LocalTransport {
    /// Agent binary found by [`find_local_agent`] at `start()`.
    pub fn new() -> Self {
        Self {
            binary: None,
            args: Vec::new(),
            child: None,
            reader: None,
            writer: None,
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
            ..Self::new()
        }
    }

    /// Extra arguments for the agent (e.g. `--backend stub`).
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Agent next to the running executable, then `./dist`, then the working directory.
pub fn find_local_agent() -> Option<PathBuf> {
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(AGENT_BINARY_NAME)));

    beside_exe
        .into_iter()
        .chain([
            Path::new("./dist").join(AGENT_BINARY_NAME),
            Path::new(".").join(AGENT_BINARY_NAME),
        ])
        .find(|p| p.is_file())
}

#[async_trait]
impl AgentTransport for LocalTransport {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn connect(&mut self, _target: &ConnectTarget) -> Result<(), SessionError> {
        Ok(())
    }

    fn uploads(&self) -> bool {
        false
    }

    async fn deploy(&mut self, _local_binary: &Path) -> Result<(), SessionError> {
        Ok(())
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        let binary = match &self.binary {
            Some(b) => b.clone(),
            None => find_local_agent().ok_or_else(|| {
                SessionError::Spawn(format!(
                    "{} not found next to the executable, in ./dist or in .",
                    AGENT_BINARY_NAME
                ))
            })?,
        };

        let mut child = Command::new(&binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SessionError::Spawn(format!("Failed to start local agent {}: {}", binary.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Spawn("Agent stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Spawn("Agent stdout not captured".to_string()))?;

        info!(
            "[local-transport] Started {} (pid {:?})",
            binary.display(),
            child.id()
        );
        self.writer = Some(Box::new(stdin));
        self.reader = Some(Box::new(stdout));
        self.child = Some(child);
        Ok(())
    }

    fn take_write_end(&mut self) -> Option<AgentWriter> {
        self.writer.take()
    }

    fn take_read_end(&mut self) -> Option<AgentReader> {
        self.reader.take()
    }

    async fn close(&mut self) {
        self.reader = None;
        self.writer = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("[local-transport] Failed to kill agent: {}", e);
            }
            debug!("[local-transport] Agent stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let mut transport = LocalTransport::with_binary("/nonexistent/perssh-agent");
        assert!(matches!(
            transport.start().await,
            Err(SessionError::Spawn(_))
        ));
        assert!(transport.take_read_end().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut transport = LocalTransport::new();
        transport.close().await;
        transport.close().await;
        assert!(transport.take_write_end().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_stdio_is_exposed() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // `cat` echoes stdin, which is enough to exercise both ends
        let mut transport = LocalTransport::with_binary("cat");
        transport.start().await.unwrap();

        let mut writer = transport.take_write_end().unwrap();
        let mut reader = transport.take_read_end().unwrap();
        assert!(transport.take_write_end().is_none());

        writer.write_all(b"{\"id\":\"1\"}").await.unwrap();
        drop(writer);
        let mut echoed = String::new();
        reader.read_to_string(&mut echoed).await.unwrap();
        assert_eq!(echoed, "{\"id\":\"1\"}");

        transport.close().await;
    }
}
