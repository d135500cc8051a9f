//! Envelope and payload types of the command catalog.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Identifier the agent uses for the error it emits when a request cannot be
/// decoded at all (the real `id` is unreadable at that point).
pub const DECODE_ERROR_ID: &str = "DECODE";

/// Number of trailing log lines returned by `GET_LOGS`.
pub const LOG_TAIL_LINES: usize = 100;

/// Literal data returned for `PING`.
pub const PONG: &str = "PONG";

/// Collections arrive as `null` from clients that never initialised them.
fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

// ═══════════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════════

/// Closed set of commands the agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Ping,
    GetTelemetry,
    ListContainers,
    CreateEnv,
    StartEnv,
    StopEnv,
    RemoveEnv,
    GetLogs,
    SendInput,
}

impl CommandType {
    pub const ALL: [CommandType; 9] = [
        CommandType::Ping,
        CommandType::GetTelemetry,
        CommandType::ListContainers,
        CommandType::CreateEnv,
        CommandType::StartEnv,
        CommandType::StopEnv,
        CommandType::RemoveEnv,
        CommandType::GetLogs,
        CommandType::SendInput,
    ];

    /// Wire literal, e.g. `"CREATE_ENV"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::GetTelemetry => "GET_TELEMETRY",
            Self::ListContainers => "LIST_CONTAINERS",
            Self::CreateEnv => "CREATE_ENV",
            Self::StartEnv => "START_ENV",
            Self::StopEnv => "STOP_ENV",
            Self::RemoveEnv => "REMOVE_ENV",
            Self::GetLogs => "GET_LOGS",
            Self::SendInput => "SEND_INPUT",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `type` field of a request as it appeared on the wire.
///
/// Unrecognized literals still decode so the agent can answer them with a
/// failed response instead of treating the stream as desynchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestType {
    Known(CommandType),
    Unrecognized(String),
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(t) => t.fmt(f),
            Self::Unrecognized(s) => f.write_str(s),
        }
    }
}

impl From<CommandType> for RequestType {
    fn from(t: CommandType) -> Self {
        Self::Known(t)
    }
}

/// Request sent from the control process to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-assigned, opaque. Echoed back verbatim.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Response emitted by the agent, exactly one per decoded request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Matches the triggering request's `id`.
    pub id: String,
    pub success: bool,
    /// Failure message, or a non-fatal warning on a successful `CREATE_ENV`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    pub fn ok(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            error: None,
            data: (!data.is_null()).then_some(data),
        }
    }

    pub fn ok_empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: true,
            error: None,
            data: None,
        }
    }

    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            error: Some(message.into()),
            data: None,
        }
    }

    /// Successful response that still carries a warning in `error`.
    pub fn with_warning(
        id: impl Into<String>,
        data: serde_json::Value,
        warning: impl Into<String>,
    ) -> Self {
        let mut resp = Self::ok(id, data);
        resp.error = Some(warning.into());
        resp
    }

    /// Decode `data` into the result shape of the originating command.
    /// A missing `data` field decodes as JSON `null`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone().unwrap_or(serde_json::Value::Null))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// GET_TELEMETRY
// ═══════════════════════════════════════════════════════════════════════════

/// Host telemetry snapshot plus backend liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryData {
    pub timestamp: DateTime<Utc>,
    /// Percentage, two decimals.
    pub cpu_usage: f64,
    /// Celsius, 0 when no sensor is readable.
    pub cpu_temp: f64,
    /// Percentage, two decimals.
    pub ram_usage: f64,
    pub ram_total: u64,
    pub ram_used: u64,
    pub disk_free: u64,
    pub disk_total: u64,
    /// Whether the container daemon answered its liveness ping.
    pub docker_running: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// LIST_CONTAINERS
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[serde(other)]
    Unknown,
}

impl ContainerStatus {
    /// Parse a runtime state literal; anything unfamiliar becomes `Unknown`.
    pub fn from_state(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One managed instance in an inventory snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    /// Unix seconds.
    pub created: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// CREATE_ENV
// ═══════════════════════════════════════════════════════════════════════════

/// Template an environment is created from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentType {
    #[default]
    Standard,
    Minecraft,
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::Minecraft => "MINECRAFT",
        }
    }
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const FEATURE_AIKAR_FLAGS: &str = "AIKAR_FLAGS";
pub const FEATURE_AUTO_UPDATE: &str = "AUTO_UPDATE";

/// Game-server specific settings. Unset fields are filled from the template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinecraftConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eula: Option<bool>,
    /// VANILLA, FORGE, FABRIC, ARCLIGHT, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
    /// "latest" or a concrete release such as "1.20.4".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Modpack URL or platform slug.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modpack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    /// Plugin download URLs.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub plugins: Vec<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub op_users: Vec<String>,
}

impl MinecraftConfig {
    /// True when every field holds its zero value (unset, `false`, blank or
    /// empty). Such a block carries no settings and declares no kind.
    pub fn is_unset(&self) -> bool {
        let blank = |s: &Option<String>| s.as_deref().map_or(true, |s| s.trim().is_empty());
        self.eula != Some(true)
            && blank(&self.server_type)
            && blank(&self.version)
            && blank(&self.modpack)
            && blank(&self.motd)
            && self.features.as_ref().map_or(true, Vec::is_empty)
            && self.plugins.is_empty()
            && self.op_users.is_empty()
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == feature))
    }
}

/// Parameters for `CREATE_ENV`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEnvPayload {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: EnvironmentType,
    #[serde(default)]
    pub image: String,
    /// Publish specs, e.g. `"8080:80"`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub ports: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub env_vars: BTreeMap<String, String>,
    /// Memory limit such as `"2g"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_limit: Option<String>,
    /// Present only for `MINECRAFT` environments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minecraft: Option<MinecraftConfig>,
}

impl CreateEnvPayload {
    /// Kind declared by the nested configuration block. A block with only
    /// zero values declares nothing.
    pub fn block_kind(&self) -> Option<EnvironmentType> {
        self.minecraft
            .as_ref()
            .filter(|block| !block.is_unset())
            .map(|_| EnvironmentType::Minecraft)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SEND_INPUT
// ═══════════════════════════════════════════════════════════════════════════

/// Parameters for `SEND_INPUT`: one line written to the instance's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendInputPayload {
    pub id: String,
    pub data: String,
}
