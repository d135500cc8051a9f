//! Configuration Management Module
//!
//! Client settings persisted as JSON under the user config directory.
//! Credentials are never stored; only the last-used host, user and port.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, ConfigStorage, StorageError};
pub use types::{
    AgentConfig, ClientConfig, GeneralConfig, NetworkConfig, PollingConfig, SessionConfig,
    CONFIG_VERSION, DEFAULT_REMOTE_AGENT_PATH,
};
