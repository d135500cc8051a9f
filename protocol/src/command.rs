//! Typed commands.
//!
//! The envelope keeps `payload` untyped so that a request with an unexpected
//! payload shape still decodes (and fails only that one command). Both sides
//! work with [`Command`], which carries exactly the payload each row of the
//! catalog expects.

use serde_json::Value;
use thiserror::Error;

use crate::catalog::{
    CommandType, CreateEnvPayload, EnvironmentType, Request, RequestType, SendInputPayload,
};

/// A request payload that does not match what its command expects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Payload must be a string (container ID)")]
    NotAString,

    #[error("Missing container ID")]
    MissingInstanceId,

    #[error("Invalid payload format for SEND_INPUT")]
    InvalidSendInput,

    #[error("Failed to parse creation payload: {0}")]
    InvalidCreate(String),

    #[error("Configuration block does not match environment type {0}")]
    BlockKindMismatch(String),
}

/// One variant per command, carrying its decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    GetTelemetry,
    ListContainers,
    CreateEnv(CreateEnvPayload),
    StartEnv(String),
    StopEnv(String),
    RemoveEnv(String),
    GetLogs(String),
    SendInput(SendInputPayload),
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Ping => CommandType::Ping,
            Self::GetTelemetry => CommandType::GetTelemetry,
            Self::ListContainers => CommandType::ListContainers,
            Self::CreateEnv(_) => CommandType::CreateEnv,
            Self::StartEnv(_) => CommandType::StartEnv,
            Self::StopEnv(_) => CommandType::StopEnv,
            Self::RemoveEnv(_) => CommandType::RemoveEnv,
            Self::GetLogs(_) => CommandType::GetLogs,
            Self::SendInput(_) => CommandType::SendInput,
        }
    }

    /// Re-decode a request's payload into the shape its `type` requires.
    pub fn from_request(req: &Request) -> Result<Self, PayloadError> {
        let kind = match &req.kind {
            RequestType::Known(kind) => *kind,
            RequestType::Unrecognized(other) => {
                return Err(PayloadError::UnknownCommand(other.clone()))
            }
        };
        let payload = req.payload.as_ref();

        let command = match kind {
            CommandType::Ping => Self::Ping,
            CommandType::GetTelemetry => Self::GetTelemetry,
            CommandType::ListContainers => Self::ListContainers,
            CommandType::CreateEnv => Self::CreateEnv(create_payload(payload)?),
            CommandType::StartEnv => Self::StartEnv(instance_id(payload)?),
            CommandType::StopEnv => Self::StopEnv(instance_id(payload)?),
            CommandType::RemoveEnv => Self::RemoveEnv(instance_id(payload)?),
            CommandType::GetLogs => Self::GetLogs(instance_id(payload)?),
            CommandType::SendInput => Self::SendInput(send_input(payload)?),
        };
        Ok(command)
    }

    /// Wrap this command in a request envelope with the given id.
    pub fn into_request(self, id: impl Into<String>) -> Result<Request, serde_json::Error> {
        let kind = RequestType::Known(self.command_type());
        let payload = match self {
            Self::Ping | Self::GetTelemetry | Self::ListContainers => None,
            Self::CreateEnv(p) => Some(serde_json::to_value(p)?),
            Self::StartEnv(id) | Self::StopEnv(id) | Self::RemoveEnv(id) | Self::GetLogs(id) => {
                Some(Value::String(id))
            }
            Self::SendInput(p) => Some(serde_json::to_value(p)?),
        };
        Ok(Request {
            id: id.into(),
            kind,
            payload,
        })
    }
}

fn instance_id(payload: Option<&Value>) -> Result<String, PayloadError> {
    match payload {
        Some(Value::String(id)) => Ok(id.clone()),
        _ => Err(PayloadError::NotAString),
    }
}

fn send_input(payload: Option<&Value>) -> Result<SendInputPayload, PayloadError> {
    let Some(Value::Object(map)) = payload else {
        return Err(PayloadError::InvalidSendInput);
    };
    let field = |name: &str| {
        map.get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let id = field("id");
    if id.is_empty() {
        return Err(PayloadError::MissingInstanceId);
    }
    Ok(SendInputPayload {
        id,
        data: field("data"),
    })
}

fn create_payload(payload: Option<&Value>) -> Result<CreateEnvPayload, PayloadError> {
    let value = payload.cloned().unwrap_or(Value::Null);
    let mut parsed: CreateEnvPayload = serde_json::from_value(value)
        .map_err(|e| PayloadError::InvalidCreate(e.to_string()))?;

    match parsed.block_kind() {
        Some(block) if block != parsed.kind => {
            return Err(PayloadError::BlockKindMismatch(parsed.kind.to_string()));
        }
        // Zero-valued block on a standard environment
        None if parsed.kind == EnvironmentType::Standard => parsed.minecraft = None,
        _ => {}
    }
    Ok(parsed)
}
