//! Session State Machine
//!
//! Lifecycle of the one agent session a client process holds:
//!
//! ```text
//! ┌──────────────┐   begin()    ┌──────────────┐
//! │ Disconnected │ ───────────► │  Connecting  │  connect + deploy + start
//! └──────────────┘              └──────┬───────┘
//!        ▲                     established() / failed()
//!        │                 ┌───────────┴─────────────┐
//!        │                 ▼                         ▼
//!        │          ┌──────────────┐  lost()  ┌──────────────┐
//!        │          │  Connected   │ ───────► │    Error     │
//!        │          └──────┬───────┘          └──────┬───────┘
//!        │            begin_close()                  │
//!        │                 ▼                         │
//!        │          ┌──────────────┐                 │
//!        └───────── │Disconnecting │                 │
//!         closed()  └──────────────┘                 │
//!        ▲                                           │
//!        └──────────────── begin() ◄─────────────────┘
//! ```
//!
//! Error is terminal for the session: commands stop flowing and the operator
//! has to log in again.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    /// Connecting, deploying and starting the agent
    Connecting,
    /// Agent running, commands flowing
    Connected,
    Disconnecting,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Invalid session transition from {from} to {to}")]
pub struct StateTransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    /// user@host of the current or last session
    target: Option<String>,
    error_message: Option<String>,
    state_changed_at: Instant,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            target: None,
            error_message: None,
            state_changed_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn time_in_state(&self) -> Duration {
        self.state_changed_at.elapsed()
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn begin(&mut self, target: impl Into<String>) -> Result<(), StateTransitionError> {
        self.guard(
            matches!(self.state, SessionState::Disconnected | SessionState::Error),
            SessionState::Connecting,
        )?;
        self.target = Some(target.into());
        self.error_message = None;
        Ok(())
    }

    pub fn established(&mut self) -> Result<(), StateTransitionError> {
        self.guard(self.state == SessionState::Connecting, SessionState::Connected)
    }

    /// Establishment failed (auth, network, deploy, spawn).
    pub fn failed(&mut self, error: &SessionError) -> Result<(), StateTransitionError> {
        self.guard(self.state == SessionState::Connecting, SessionState::Error)?;
        self.error_message = Some(error.to_string());
        Ok(())
    }

    /// A live session hit a fatal error.
    pub fn lost(&mut self, error: &SessionError) -> Result<(), StateTransitionError> {
        self.guard(self.state == SessionState::Connected, SessionState::Error)?;
        self.error_message = Some(error.to_string());
        Ok(())
    }

    pub fn begin_close(&mut self) -> Result<(), StateTransitionError> {
        self.guard(
            matches!(self.state, SessionState::Connected | SessionState::Connecting),
            SessionState::Disconnecting,
        )
    }

    pub fn closed(&mut self) -> Result<(), StateTransitionError> {
        self.guard(self.state == SessionState::Disconnecting, SessionState::Disconnected)
    }

    fn guard(&mut self, allowed: bool, to: SessionState) -> Result<(), StateTransitionError> {
        if !allowed {
            return Err(StateTransitionError {
                from: self.state,
                to,
            });
        }
        tracing::debug!("[session] {} -> {}", self.state, to);
        self.state = to;
        self.state_changed_at = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = SessionStateMachine::new();
        sm.begin("root@10.0.0.2").unwrap();
        assert_eq!(sm.state(), SessionState::Connecting);
        sm.established().unwrap();
        assert!(sm.is_connected());
        sm.begin_close().unwrap();
        sm.closed().unwrap();
        assert_eq!(sm.state(), SessionState::Disconnected);
        assert_eq!(sm.target(), Some("root@10.0.0.2"));
    }

    #[test]
    fn test_establishment_failure_then_retry() {
        let mut sm = SessionStateMachine::new();
        sm.begin("root@10.0.0.2").unwrap();
        sm.failed(&SessionError::Auth("bad password".into())).unwrap();
        assert_eq!(sm.state(), SessionState::Error);
        assert_eq!(sm.error(), Some("Authentication failed: bad password"));

        sm.begin("root@10.0.0.3").unwrap();
        assert_eq!(sm.error(), None);
    }

    #[test]
    fn test_lost_session() {
        let mut sm = SessionStateMachine::new();
        sm.begin("dev").unwrap();
        sm.established().unwrap();
        sm.lost(&SessionError::Closed).unwrap();
        assert_eq!(sm.state(), SessionState::Error);
        assert!(sm.begin_close().is_err());
    }

    #[test]
    fn test_invalid_transition() {
        let mut sm = SessionStateMachine::new();
        let err = sm.established().unwrap_err();
        assert_eq!(err.from, SessionState::Disconnected);
        assert_eq!(err.to, SessionState::Connected);
        assert!(sm.lost(&SessionError::Closed).is_err());
    }
}
