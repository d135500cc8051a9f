//! Correlated RPC Loop
//!
//! Owns the duplex stream to the agent and splits it into two halves with
//! different concurrency models:
//!
//! ```text
//!  ┌────────────┐  Request   ┌─────────────┐  JSON   ┌─────────┐
//!  │ RpcSender  │ ──mpsc───▸ │ writer task │ ──────▸ │         │
//!  │ (clone)    │            └─────────────┘         │  Agent  │
//!  └─────┬──────┘                                    │         │
//!        │ push id         ┌────────────────┐  JSON  │         │
//!        └───────────────▸ │ ResponseStream │ ◂───── │         │
//!            InFlight      │ (one decode)   │        └─────────┘
//!                          └────────────────┘
//! ```
//!
//! - Sending is fire-and-continue: the request is queued and the call returns.
//! - Receiving takes `&mut self`, so exactly one decode is outstanding and
//!   the caller re-arms it after handling each response.
//! - The agent answers strictly in arrival order. `InFlight` records ids in
//!   send order and a response matching anything but the oldest pending id
//!   is an [`SessionError::OrderingViolation`].
//! - Responses are routed by the [`Topic`] encoded in their id.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use perssh_protocol::{Command, CommandType, JsonCodec, Request, Response, DECODE_ERROR_ID};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::error::SessionError;

/// Logical operation a response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Ping,
    Telemetry,
    Inventory,
    Logs,
    Create,
    Action,
    Input,
}

impl Topic {
    pub fn for_command(kind: CommandType) -> Self {
        match kind {
            CommandType::Ping => Self::Ping,
            CommandType::GetTelemetry => Self::Telemetry,
            CommandType::ListContainers => Self::Inventory,
            CommandType::GetLogs => Self::Logs,
            CommandType::CreateEnv => Self::Create,
            CommandType::StartEnv | CommandType::StopEnv | CommandType::RemoveEnv => Self::Action,
            CommandType::SendInput => Self::Input,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Telemetry => "telemetry",
            Self::Inventory => "list",
            Self::Logs => "logs",
            Self::Create => "create",
            Self::Action => "action",
            Self::Input => "input",
        }
    }

    /// Topic from an id of the form `<topic>-<seq>` or `<topic>@<target>-<seq>`.
    pub fn from_id(id: &str) -> Option<Self> {
        let (prefix, _) = id.rsplit_once('-')?;
        match prefix.split_once('@').map_or(prefix, |(topic, _)| topic) {
            "ping" => Some(Self::Ping),
            "telemetry" => Some(Self::Telemetry),
            "list" => Some(Self::Inventory),
            "logs" => Some(Self::Logs),
            "create" => Some(Self::Create),
            "action" => Some(Self::Action),
            "input" => Some(Self::Input),
            _ => None,
        }
    }
}

/// Instance a log request was sent for, read back from its id.
pub fn log_target(id: &str) -> Option<&str> {
    let (target, _) = id.strip_prefix("logs@")?.rsplit_once('-')?;
    Some(target)
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ids sent and not yet answered, oldest first.
#[derive(Debug, Default)]
pub struct InFlight {
    pending: VecDeque<String>,
}

impl InFlight {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn push(&mut self, id: String) {
        self.pending.push_back(id);
    }

    /// Retire `id`. `Ok(true)` when it was the oldest pending id, `Ok(false)`
    /// when it was never sent.
    fn complete(&mut self, id: &str) -> Result<bool, SessionError> {
        match self.pending.front() {
            Some(front) if front == id => {
                self.pending.pop_front();
                Ok(true)
            }
            Some(front) if self.pending.iter().any(|p| p == id) => {
                Err(SessionError::OrderingViolation {
                    expected: front.clone(),
                    got: id.to_string(),
                })
            }
            _ => Ok(false),
        }
    }
}

/// A decoded response and the operation it answers.
#[derive(Debug, Clone)]
pub struct Routed {
    pub topic: Option<Topic>,
    pub response: Response,
}

/// Clone-able send half.
#[derive(Clone)]
pub struct RpcSender {
    tx: mpsc::UnboundedSender<Request>,
    in_flight: Arc<Mutex<InFlight>>,
    seq: Arc<AtomicU64>,
}

impl RpcSender {
    /// Queue a command and return the id it was sent with.
    pub fn send(&self, command: Command) -> Result<String, SessionError> {
        let topic = Topic::for_command(command.command_type());
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = match &command {
            Command::GetLogs(target) => format!("{}@{}-{}", topic, target, seq),
            _ => format!("{}-{}", topic, seq),
        };
        let request = command
            .into_request(id.clone())
            .map_err(|e| SessionError::Decode(format!("Failed to encode request: {}", e)))?;

        // Ledger and queue are updated together so their order always matches
        let mut in_flight = self.in_flight.lock();
        self.tx.send(request).map_err(|_| SessionError::Closed)?;
        in_flight.push(id.clone());
        Ok(id)
    }

    pub fn pending(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receive half. `next_response` takes `&mut self`: one decode at a time.
pub struct ResponseStream<R> {
    frames: FramedRead<R, JsonCodec<Response>>,
    in_flight: Arc<Mutex<InFlight>>,
}

impl<R: AsyncRead + Unpin> ResponseStream<R> {
    /// Wait for the next response. Any error is fatal to the session and the
    /// stream must not be polled again.
    pub async fn next_response(&mut self) -> Result<Routed, SessionError> {
        let response = match self.frames.next().await {
            Some(Ok(response)) => response,
            Some(Err(e)) => return Err(SessionError::Decode(e.to_string())),
            None => return Err(SessionError::Closed),
        };

        if response.id == DECODE_ERROR_ID {
            let reason = response.error.unwrap_or_default();
            warn!("[rpc] Agent reported a desynchronized stream: {}", reason);
            return Err(SessionError::Decode(format!("agent: {}", reason)));
        }

        let known = self.in_flight.lock().complete(&response.id)?;
        if !known {
            warn!("[rpc] Response for unknown id {}", response.id);
        }
        debug!("[rpc] Response id={} success={}", response.id, response.success);

        Ok(Routed {
            topic: Topic::from_id(&response.id),
            response,
        })
    }
}

/// Split the agent stream into its send and receive halves. Spawns the
/// writer task, which ends when every sender is dropped or a write fails.
pub fn attach<R, W>(reader: R, writer: W) -> (RpcSender, ResponseStream<R>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
    let in_flight = Arc::new(Mutex::new(InFlight::default()));

    tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, JsonCodec::<Request>::new());
        while let Some(request) = rx.recv().await {
            debug!("[rpc] Sending id={} type={}", request.id, request.kind);
            if let Err(e) = sink.send(request).await {
                warn!("[rpc] Write failed, channel closed: {}", e);
                break;
            }
        }
        info!("[rpc] Writer task ended");
    });

    let sender = RpcSender {
        tx,
        in_flight: in_flight.clone(),
        seq: Arc::new(AtomicU64::new(0)),
    };
    let stream = ResponseStream {
        frames: FramedRead::new(reader, JsonCodec::new()),
        in_flight,
    };
    (sender, stream)
}
