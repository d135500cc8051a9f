//! PerSSH wire protocol.
//!
//! Shared vocabulary between the control process and the remote agent:
//! request/response envelopes, the typed command catalog, environment
//! templates and the JSON stream codec both sides frame the duplex stream with.
//!
//! Wire format: self-delimiting JSON documents written back-to-back.
//! - Requests carry `id` + `type` + optional `payload`
//! - Responses carry `id` + `success` + optional `error` / `data`

mod catalog;
mod codec;
mod command;
pub mod templates;

pub use catalog::*;
pub use codec::{CodecError, JsonCodec, MAX_FRAME_SIZE};
pub use command::{Command, PayloadError};
