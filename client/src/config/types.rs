//! Configuration Types
//!
//! Client settings with version support for migrations. Every field has a
//! serde default so older or hand-edited files still load.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current configuration version
pub const CONFIG_VERSION: u32 = 1;

/// Default remote location of the uploaded agent, relative to the login directory
pub const DEFAULT_REMOTE_AGENT_PATH: &str = "./perssh-agent";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Verbose logging without having to pass `--log-level`
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Upper bound on TCP connect + SSH handshake
    pub connect_timeout_secs: u64,
    /// Per-host timeout for LAN discovery dials
    pub scan_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            scan_timeout_ms: 500,
        }
    }
}

/// Last successful login, offered as defaults on the next prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub last_host: Option<String>,
    pub last_user: Option<String>,
    pub last_port: u16,
    /// Private key tried before password authentication
    pub key_path: Option<PathBuf>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            last_host: None,
            last_user: None,
            last_port: 22,
            key_path: None,
            last_login_at: None,
        }
    }
}

/// Poll cadences in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub telemetry_ms: u64,
    pub inventory_ms: u64,
    pub logs_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            telemetry_ms: 1000,
            inventory_ms: 6000,
            logs_ms: 250,
        }
    }
}

impl PollingConfig {
    pub fn telemetry(&self) -> Duration {
        Duration::from_millis(self.telemetry_ms.max(1))
    }

    pub fn inventory(&self) -> Duration {
        Duration::from_millis(self.inventory_ms.max(1))
    }

    pub fn logs(&self) -> Duration {
        Duration::from_millis(self.logs_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Local agent binary to upload; searched for when unset
    pub local_binary: Option<PathBuf>,
    pub remote_path: String,
    /// Upload when the remote agent is missing or reports another version
    pub auto_deploy: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            local_binary: None,
            remote_path: DEFAULT_REMOTE_AGENT_PATH.to_string(),
            auto_deploy: true,
        }
    }
}

/// Root configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub version: u32,
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub polling: PollingConfig,
    pub agent: AgentConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            general: GeneralConfig::default(),
            network: NetworkConfig::default(),
            session: SessionConfig::default(),
            polling: PollingConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_secs.max(1))
    }

    /// Record a successful login
    pub fn remember_login(&mut self, host: &str, user: &str, port: u16) {
        self.session.last_host = Some(host.to_string());
        self.session.last_user = Some(user.to_string());
        self.session.last_port = port;
        self.session.last_login_at = Some(Utc::now());
    }

    /// Display string for the last login (user@host[:port])
    pub fn last_login_display(&self) -> Option<String> {
        let host = self.session.last_host.as_deref()?;
        let user = self.session.last_user.as_deref().unwrap_or("root");
        Some(if self.session.last_port == 22 {
            format!("{}@{}", user, host)
        } else {
            format!("{}@{}:{}", user, host, self.session.last_port)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.last_port, 22);
        assert_eq!(config.agent.remote_path, "./perssh-agent");
        assert!(config.agent.auto_deploy);
        assert_eq!(config.polling.telemetry(), Duration::from_millis(1000));
        assert_eq!(config.polling.inventory(), Duration::from_millis(6000));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"session": {"last_host": "10.0.0.5"}, "polling": {"logs_ms": 500}}"#)
                .unwrap();
        assert_eq!(config.session.last_host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.session.last_port, 22);
        assert_eq!(config.polling.logs_ms, 500);
        assert_eq!(config.polling.telemetry_ms, 1000);
        assert_eq!(config.version, CONFIG_VERSION);
    }

    #[test]
    fn test_remember_login_display() {
        let mut config = ClientConfig::default();
        assert_eq!(config.last_login_display(), None);

        config.remember_login("example.com", "admin", 22);
        assert_eq!(config.last_login_display().as_deref(), Some("admin@example.com"));
        assert!(config.session.last_login_at.is_some());

        config.remember_login("example.com", "admin", 2222);
        assert_eq!(
            config.last_login_display().as_deref(),
            Some("admin@example.com:2222")
        );
    }
}
