//! perssh-agent
//!
//! Uploaded to the managed host and run over SSH. Reads requests from stdin
//! and writes one response per request to stdout; all logging goes to stderr.

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use perssh_agent::backend::{select_backend, BackendChoice};
use perssh_agent::server;
use perssh_agent::telemetry::SystemTelemetry;
use perssh_agent::Dispatcher;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Docker,
    Stub,
}

impl From<BackendArg> for BackendChoice {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => BackendChoice::Auto,
            BackendArg::Docker => BackendChoice::Docker,
            BackendArg::Stub => BackendChoice::Stub,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "perssh-agent", version)]
#[command(about = "PerSSH remote agent: executes workload commands read from stdin")]
struct Args {
    /// Serve TCP on this address instead of stdio (development only)
    #[arg(long)]
    listen: Option<String>,

    /// Workload backend
    #[arg(long, value_enum, default_value = "auto")]
    backend: BackendArg,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stderr only: stdout carries protocol frames
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("[agent] perssh-agent v{} starting", env!("CARGO_PKG_VERSION"));

    let backend = select_backend(args.backend.into())
        .await
        .context("Failed to initialise the workload backend")?;
    let dispatcher = Dispatcher::new(backend, Arc::new(SystemTelemetry::new()));

    match args.listen {
        Some(addr) => server::serve_tcp(addr.as_str(), Arc::new(dispatcher))
            .await
            .with_context(|| format!("Failed to serve on {}", addr))?,
        None => {
            if std::io::stdin().is_terminal() {
                eprintln!("perssh-agent speaks JSON on stdin, e.g. {{\"id\":\"1\",\"type\":\"PING\"}}");
            }
            let end = server::serve_stdio(&dispatcher).await;
            info!("[agent] Exiting: {:?}", end);
        }
    }

    Ok(())
}
