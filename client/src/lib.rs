//! PerSSH client library.
//!
//! Connects to a host, deploys and starts the agent, then drives it over a
//! correlated request/response stream while keeping a live dashboard.

pub mod app;
pub mod config;
pub mod dashboard;
pub mod discovery;
pub mod error;
pub mod rpc;
pub mod scheduler;
pub mod session;
pub mod transport;
