//! Transport Session
//!
//! Produces a duplex byte stream connected to a running agent process.
//!
//! ```text
//!   connect() ──▸ deploy() ──▸ start() ──▸ take_write_end() / take_read_end()
//!                (optional)                         │
//!                                                   ▼
//!                                          owned by the RPC loop
//! ```
//!
//! Two variants share one interface: [`SshTransport`] uploads and runs the
//! agent on a remote host, [`LocalTransport`] spawns it as a child process
//! and treats `deploy()` as a no-op. Each stream end can be taken once;
//! keeping a single reader and a single writer is up to the caller.

mod deploy;
mod local;
mod ssh;

pub use deploy::{AgentDeployer, DeployError, AGENT_BINARY_NAME};
pub use local::LocalTransport;
pub use ssh::SshTransport;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SessionError;

/// Read side of the agent's stdout.
pub type AgentReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write side of the agent's stdin.
pub type AgentWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Credentials for an SSH login. The key is tried first, then the password
/// (plain, then keyboard-interactive).
#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
    pub key_passphrase: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// Where to connect.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub credentials: Credentials,
    /// Bound on TCP connect, handshake and authentication
    pub timeout: Duration,
}

impl ConnectTarget {
    pub fn display(&self) -> String {
        if self.port == 22 {
            format!("{}@{}", self.user, self.host)
        } else {
            format!("{}@{}:{}", self.user, self.host, self.port)
        }
    }
}

/// Lifecycle of one agent process and its stdio streams.
#[async_trait]
pub trait AgentTransport: Send {
    /// Short name for logs ("ssh", "local").
    fn kind(&self) -> &'static str;

    /// Open the underlying channel. No internal retry.
    async fn connect(&mut self, target: &ConnectTarget) -> Result<(), SessionError>;

    /// Whether `deploy()` actually transfers anything.
    fn uploads(&self) -> bool {
        true
    }

    /// `--version` output of the agent already present at the destination, if any.
    async fn installed_version(&mut self) -> Option<String> {
        None
    }

    /// Copy the agent binary into place and mark it executable.
    async fn deploy(&mut self, local_binary: &Path) -> Result<(), SessionError>;

    /// Launch the agent with its stdin/stdout attached.
    async fn start(&mut self) -> Result<(), SessionError>;

    /// Stream into the agent's stdin. `None` before `start()` or once taken.
    fn take_write_end(&mut self) -> Option<AgentWriter>;

    /// Stream from the agent's stdout. `None` before `start()` or once taken.
    fn take_read_end(&mut self) -> Option<AgentReader>;

    /// Release process, channel and connection. Idempotent.
    async fn close(&mut self);
}
