//! PerSSH Agent
//!
//! Runs on the managed host. Decodes one request at a time from its input
//! stream, routes it to a [`backend::Backend`], and writes exactly one
//! response back. Holds no state of its own between requests.

pub mod backend;
pub mod dispatcher;
pub mod server;
pub mod telemetry;

pub use dispatcher::{Dispatcher, DispatcherState, SessionEnd};
