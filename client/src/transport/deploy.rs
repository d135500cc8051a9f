//! Agent deployer: uploads and starts the agent through a transport.
//!
//! Workflow:
//! 1. Check whether the agent is already in place (`--version` match)
//! 2. Resolve the local binary
//! 3. Upload it and mark it executable
//! 4. Start it with stdin/stdout attached

use std::path::PathBuf;

use tracing::{debug, info};

use super::local::find_local_agent;
use super::AgentTransport;
use crate::config::AgentConfig;
use crate::error::SessionError;

/// File name of the agent binary, locally and on the remote host.
pub const AGENT_BINARY_NAME: &str = "perssh-agent";

/// Client and agent are released together from one workspace.
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Deployment errors.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Agent binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Agent start failed: {0}")]
    StartFailed(String),
}

impl From<DeployError> for SessionError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::StartFailed(msg) => SessionError::Spawn(msg),
            other => SessionError::Deploy(other.to_string()),
        }
    }
}

/// Deployer for the PerSSH agent.
#[derive(Debug, Clone)]
pub struct AgentDeployer {
    local_binary: Option<PathBuf>,
    auto_deploy: bool,
}

impl AgentDeployer {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            local_binary: config.local_binary.clone(),
            auto_deploy: config.auto_deploy,
        }
    }

    /// Upload (if needed) and start the agent. The transport must be connected.
    pub async fn deploy_and_start(&self, transport: &mut dyn AgentTransport) -> Result<(), SessionError> {
        if transport.uploads() && self.auto_deploy {
            if self.needs_upload(transport).await {
                let binary = self.resolve_binary()?;
                info!("[agent-deploy] Using binary: {}", binary.display());
                transport.deploy(&binary).await.map_err(|e| match e {
                    SessionError::Deploy(msg) => DeployError::Upload(msg),
                    other => DeployError::Upload(other.to_string()),
                })?;
                info!("[agent-deploy] Upload complete");
            } else {
                info!("[agent-deploy] Agent already deployed, skipping upload");
            }
        }

        transport.start().await.map_err(|e| match e {
            SessionError::Spawn(msg) => DeployError::StartFailed(msg),
            other => DeployError::StartFailed(other.to_string()),
        })?;
        Ok(())
    }

    /// Local agent binary: configured path, else the usual search locations.
    pub fn resolve_binary(&self) -> Result<PathBuf, DeployError> {
        match &self.local_binary {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(DeployError::BinaryNotFound(format!(
                "configured path {} does not exist",
                path.display()
            ))),
            None => find_local_agent().ok_or_else(|| {
                DeployError::BinaryNotFound(format!(
                    "{} not found next to the executable, in ./dist or in .",
                    AGENT_BINARY_NAME
                ))
            }),
        }
    }

    async fn needs_upload(&self, transport: &mut dyn AgentTransport) -> bool {
        match transport.installed_version().await {
            None => {
                debug!("[agent-deploy] Agent not found at destination");
                true
            }
            Some(output) if version_matches(&output) => {
                debug!("[agent-deploy] Version match: {}", output);
                false
            }
            Some(output) => {
                debug!(
                    "[agent-deploy] Version mismatch: got '{}', want '{}'",
                    output, AGENT_VERSION
                );
                true
            }
        }
    }
}

/// `perssh-agent 1.2.3` style output naming this exact version.
fn version_matches(output: &str) -> bool {
    output
        .split_whitespace()
        .any(|word| word.trim_start_matches('v') == AGENT_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AgentReader, AgentWriter, ConnectTarget};
    use async_trait::async_trait;
    use std::path::Path;

    #[derive(Default)]
    struct RecordingTransport {
        installed: Option<String>,
        deployed: Vec<PathBuf>,
        started: bool,
        fail_start: bool,
    }

    #[async_trait]
    impl AgentTransport for RecordingTransport {
        fn kind(&self) -> &'static str {
            "recording"
        }
        async fn connect(&mut self, _target: &ConnectTarget) -> Result<(), SessionError> {
            Ok(())
        }
        async fn installed_version(&mut self) -> Option<String> {
            self.installed.clone()
        }
        async fn deploy(&mut self, local_binary: &Path) -> Result<(), SessionError> {
            self.deployed.push(local_binary.to_path_buf());
            Ok(())
        }
        async fn start(&mut self) -> Result<(), SessionError> {
            if self.fail_start {
                return Err(SessionError::Spawn("exec refused".into()));
            }
            self.started = true;
            Ok(())
        }
        fn take_write_end(&mut self) -> Option<AgentWriter> {
            None
        }
        fn take_read_end(&mut self) -> Option<AgentReader> {
            None
        }
        async fn close(&mut self) {}
    }

    fn deployer_with(binary: &Path) -> AgentDeployer {
        AgentDeployer::new(&AgentConfig {
            local_binary: Some(binary.to_path_buf()),
            ..Default::default()
        })
    }

    #[test]
    fn test_version_matches() {
        assert!(version_matches(&format!("perssh-agent {}", AGENT_VERSION)));
        assert!(version_matches(&format!("perssh-agent v{}\n", AGENT_VERSION)));
        assert!(!version_matches("perssh-agent 0.0.0-old"));
        assert!(!version_matches(""));
    }

    #[tokio::test]
    async fn test_uploads_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join(AGENT_BINARY_NAME);
        std::fs::write(&binary, b"\x7fELF").unwrap();

        let mut transport = RecordingTransport::default();
        deployer_with(&binary)
            .deploy_and_start(&mut transport)
            .await
            .unwrap();
        assert_eq!(transport.deployed, vec![binary]);
        assert!(transport.started);
    }

    #[tokio::test]
    async fn test_skips_upload_on_version_match() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join(AGENT_BINARY_NAME);
        std::fs::write(&binary, b"\x7fELF").unwrap();

        let mut transport = RecordingTransport {
            installed: Some(format!("perssh-agent {}", AGENT_VERSION)),
            ..Default::default()
        };
        deployer_with(&binary)
            .deploy_and_start(&mut transport)
            .await
            .unwrap();
        assert!(transport.deployed.is_empty());
        assert!(transport.started);
    }

    #[tokio::test]
    async fn test_missing_binary_is_deploy_error() {
        let mut transport = RecordingTransport::default();
        let err = deployer_with(Path::new("/nonexistent/perssh-agent"))
            .deploy_and_start(&mut transport)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Deploy(_)));
        assert!(!transport.started);
    }

    #[tokio::test]
    async fn test_start_failure_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join(AGENT_BINARY_NAME);
        std::fs::write(&binary, b"\x7fELF").unwrap();

        let mut transport = RecordingTransport {
            fail_start: true,
            ..Default::default()
        };
        let err = deployer_with(&binary)
            .deploy_and_start(&mut transport)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));
    }
}
