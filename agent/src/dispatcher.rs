//! Agent Dispatcher
//!
//! ```text
//!            ┌─────────── response written ───────────┐
//!            ▼                                         │
//!     ┌────────────┐   decode ok   ┌──────────────────┴──┐
//!     │ Listening  │ ────────────▸ │ route → backend →   │
//!     └─────┬──────┘               │ encode one response │
//!           │                      └─────────────────────┘
//!   EOF / malformed frame / write failure
//!           ▼
//!     ┌────────────┐
//!     │ Terminated │
//!     └────────────┘
//! ```
//!
//! Requests are handled strictly one at a time: the next decode starts only
//! after the previous response has been written. A malformed frame ends the
//! session after one best-effort error response; the stream is never
//! rescanned for the next frame boundary.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use perssh_protocol::{
    Command, JsonCodec, Request, Response, DECODE_ERROR_ID, LOG_TAIL_LINES, PONG,
};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError};
use crate::telemetry::TelemetrySource;

/// Why a dispatch session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Clean end of input.
    InputClosed,
    /// A frame could not be decoded; one error response was attempted.
    Desynchronized,
    /// The response could not be written.
    WriteFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Listening,
    Terminated(SessionEnd),
}

/// Routes decoded requests to the backend.
pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    telemetry: Arc<dyn TelemetrySource>,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn Backend>, telemetry: Arc<dyn TelemetrySource>) -> Self {
        Self { backend, telemetry }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Serve one stream until it terminates.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> SessionEnd
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut frames = FramedRead::new(reader, JsonCodec::<Request>::new());
        let mut sink = FramedWrite::new(writer, JsonCodec::<Response>::new());

        let end = loop {
            match self.step(&mut frames, &mut sink).await {
                DispatcherState::Listening => continue,
                DispatcherState::Terminated(end) => break end,
            }
        };
        info!("[agent-dispatch] Session ended: {:?}", end);
        end
    }

    /// One Listening → (Listening | Terminated) transition.
    async fn step<R, W>(
        &self,
        frames: &mut FramedRead<R, JsonCodec<Request>>,
        sink: &mut FramedWrite<W, JsonCodec<Response>>,
    ) -> DispatcherState
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let request = match frames.next().await {
            None => return DispatcherState::Terminated(SessionEnd::InputClosed),
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                warn!("[agent-dispatch] Decode error, terminating: {}", e);
                let resp = Response::failure(
                    DECODE_ERROR_ID,
                    format!("Failed to decode request: {}", e),
                );
                if let Err(e) = sink.send(resp).await {
                    debug!("[agent-dispatch] Could not report decode error: {}", e);
                }
                return DispatcherState::Terminated(SessionEnd::Desynchronized);
            }
        };

        debug!(
            "[agent-dispatch] Received request id={} type={}",
            request.id, request.kind
        );
        let resp = self.handle(request).await;
        if resp.success {
            debug!("[agent-dispatch] Sending success response id={}", resp.id);
        } else {
            debug!(
                "[agent-dispatch] Sending error response id={} error={}",
                resp.id,
                resp.error.as_deref().unwrap_or_default()
            );
        }

        match sink.send(resp).await {
            Ok(()) => DispatcherState::Listening,
            Err(e) => {
                warn!("[agent-dispatch] Write failed: {}", e);
                DispatcherState::Terminated(SessionEnd::WriteFailed)
            }
        }
    }

    /// Execute one request. Always yields exactly one response with the
    /// request's id.
    pub async fn handle(&self, request: Request) -> Response {
        match Command::from_request(&request) {
            Ok(command) => self.execute(request.id, command).await,
            Err(e) => Response::failure(request.id, e.to_string()),
        }
    }

    async fn execute(&self, id: String, command: Command) -> Response {
        match command {
            Command::Ping => Response::ok(id, json!(PONG)),

            Command::GetTelemetry => match self.telemetry.snapshot().await {
                Ok(mut snapshot) => {
                    snapshot.docker_running = self.backend.is_running().await;
                    data_response(id, &snapshot)
                }
                Err(e) => Response::failure(id, e.to_string()),
            },

            Command::ListContainers => match self.backend.list().await {
                Ok(list) => data_response(id, &list),
                Err(e) => Response::failure(id, e.to_string()),
            },

            Command::CreateEnv(mut payload) => {
                payload.apply_template_defaults();
                let created = match self.backend.create(&payload).await {
                    Ok(created) => created,
                    Err(e) => return Response::failure(id, e.to_string()),
                };
                info!(
                    "[agent-dispatch] Created {} ({}) from {}",
                    created, payload.kind, payload.image
                );

                // Auto-start; a failure here is reported but the create stands
                match self.backend.start(&created).await {
                    Ok(()) => Response::ok(id, json!(created)),
                    Err(e) => {
                        warn!("[agent-dispatch] Auto-start of {} failed: {}", created, e);
                        Response::with_warning(
                            id,
                            json!(created),
                            format!("Container created but failed to start: {}", e),
                        )
                    }
                }
            }

            Command::StartEnv(target) => unit_response(id, self.backend.start(&target).await),
            Command::StopEnv(target) => unit_response(id, self.backend.stop(&target).await),
            Command::RemoveEnv(target) => unit_response(id, self.backend.remove(&target).await),

            Command::GetLogs(target) => match self.backend.logs(&target, LOG_TAIL_LINES).await {
                Ok(logs) => Response::ok(id, json!(logs)),
                Err(e) => Response::failure(id, e.to_string()),
            },

            Command::SendInput(input) => {
                debug!("[agent-dispatch] Sending input to {}: {:?}", input.id, input.data);
                unit_response(id, self.backend.send_input(&input.id, &input.data).await)
            }
        }
    }
}

fn data_response<T: Serialize>(id: String, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(data) => Response::ok(id, data),
        Err(e) => Response::failure(id, format!("Failed to encode result: {}", e)),
    }
}

fn unit_response(id: String, result: Result<(), BackendError>) -> Response {
    match result {
        Ok(()) => Response::ok_empty(id),
        Err(e) => Response::failure(id, e.to_string()),
    }
}
