//! Session error types

use thiserror::Error;

/// Control-side errors for one agent session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Deploy failed: {0}")]
    Deploy(String),

    #[error("Failed to start agent: {0}")]
    Spawn(String),

    #[error("Protocol desynchronized: {0}")]
    Decode(String),

    #[error("Agent connection closed")]
    Closed,

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Response '{got}' arrived while '{expected}' was still pending")]
    OrderingViolation { expected: String, got: String },
}

impl SessionError {
    /// Errors raised while establishing the session, before any command
    /// was sent. Everything else ends a live session.
    pub fn is_connect_phase(&self) -> bool {
        matches!(
            self,
            Self::Auth(_) | Self::Network(_) | Self::Deploy(_) | Self::Spawn(_)
        )
    }
}

impl From<russh::Error> for SessionError {
    fn from(e: russh::Error) -> Self {
        Self::Ssh(e.to_string())
    }
}

impl serde::Serialize for SessionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
