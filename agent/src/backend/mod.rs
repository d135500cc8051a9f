//! Workload backends.
//!
//! The dispatcher is backend-agnostic: it talks to a [`Backend`] chosen once
//! at startup. When the container runtime does not answer its liveness ping
//! the agent falls back to [`StubBackend`], an in-memory stand-in that keeps
//! the protocol fully exercisable on hosts without Docker.

mod docker;
mod stub;

pub use docker::{container_env, DockerBackend};
pub use stub::StubBackend;

use std::sync::Arc;

use async_trait::async_trait;
use perssh_protocol::{ContainerInfo, CreateEnvPayload};
use thiserror::Error;
use tracing::{info, warn};

/// Label applied to every instance the agent creates.
pub const MANAGED_LABEL: &str = "perssh.managed";
/// Label carrying the environment type an instance was created from.
pub const TYPE_LABEL: &str = "perssh.type";

/// Backend errors. Always reported per command, never fatal to the session.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    CommandFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Workload lifecycle operations.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name for logs ("docker", "stub").
    fn name(&self) -> &'static str;

    /// Liveness of the underlying runtime.
    async fn is_running(&self) -> bool;

    /// Full inventory, including stopped instances.
    async fn list(&self) -> Result<Vec<ContainerInfo>, BackendError>;

    /// Create an instance and return its identifier. Does not start it.
    async fn create(&self, payload: &CreateEnvPayload) -> Result<String, BackendError>;

    async fn start(&self, id: &str) -> Result<(), BackendError>;

    async fn stop(&self, id: &str) -> Result<(), BackendError>;

    /// Remove an instance. Removing an unknown identifier is an error.
    async fn remove(&self, id: &str) -> Result<(), BackendError>;

    /// The last `tail` lines of combined output.
    async fn logs(&self, id: &str, tail: usize) -> Result<String, BackendError>;

    /// Write one line to the instance's standard input.
    async fn send_input(&self, id: &str, data: &str) -> Result<(), BackendError>;
}

/// Which backend the agent should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// Docker when it answers, otherwise the stub.
    #[default]
    Auto,
    Docker,
    Stub,
}

/// Pick the backend for this agent process. Only a forced docker backend
/// can fail; `Auto` falls back to the stub.
pub async fn select_backend(choice: BackendChoice) -> Result<Arc<dyn Backend>, BackendError> {
    match choice {
        BackendChoice::Stub => {
            info!("[agent-backend] Using stub backend (forced)");
            Ok(Arc::new(StubBackend::new()))
        }
        BackendChoice::Docker => {
            info!("[agent-backend] Using docker backend (forced)");
            Ok(Arc::new(DockerBackend::connect()?))
        }
        BackendChoice::Auto => match DockerBackend::connect() {
            Ok(docker) if docker.is_running().await => {
                info!("[agent-backend] Docker is available");
                Ok(Arc::new(docker))
            }
            Ok(_) => {
                warn!("[agent-backend] Docker not answering, using stub backend");
                Ok(Arc::new(StubBackend::new()))
            }
            Err(e) => {
                warn!("[agent-backend] Docker client unavailable ({}), using stub backend", e);
                Ok(Arc::new(StubBackend::new()))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forced_stub() {
        let backend = select_backend(BackendChoice::Stub).await.unwrap();
        assert_eq!(backend.name(), "stub");
        assert!(backend.is_running().await);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            BackendError::NotFound("abc123".to_string()).to_string(),
            "No such container: abc123"
        );
        assert_eq!(
            BackendError::CommandFailed("boom".to_string()).to_string(),
            "boom"
        );
    }
}
