//! perssh console client

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use perssh_lib::app::{self, App, RunOutcome};
use perssh_lib::config::{ClientConfig, ConfigStorage};
use perssh_lib::discovery;
use perssh_lib::session::{establish, SessionStateMachine};
use perssh_lib::transport::{
    AgentDeployer, AgentTransport, ConnectTarget, Credentials, LocalTransport, SshTransport,
};

#[derive(Parser, Debug)]
#[command(name = "perssh", version)]
#[command(about = "Manage containers and Minecraft servers on a remote host through the PerSSH agent")]
struct Args {
    /// Run the agent locally as a child process instead of over SSH
    #[arg(long)]
    dev: bool,

    /// Scan the local network for SSH hosts before the login prompt
    #[arg(long)]
    scan: bool,

    /// Config file (default: <config dir>/perssh/client.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let storage = match &args.config {
        Some(path) => ConfigStorage::new(path),
        None => ConfigStorage::default_location().context("Failed to locate config directory")?,
    };
    let mut config = storage
        .load_or_create()
        .with_context(|| format!("Failed to load {}", storage.path().display()))?;

    let default_level = if config.general.debug { "debug" } else { args.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("[perssh] v{} config={}", env!("CARGO_PKG_VERSION"), storage.path().display());

    let mut lines = app::stdin_lines();
    let mut state = SessionStateMachine::new();
    let suggested_host = if args.scan && !args.dev {
        scan(&config).await
    } else {
        None
    };

    loop {
        let (transport, target): (Box<dyn AgentTransport>, ConnectTarget) = if args.dev {
            (Box::new(local_transport(&config)), dev_target(&config))
        } else {
            let Some(target) = app::read_login(&mut lines, &config, suggested_host.as_deref()).await
            else {
                break;
            };
            (Box::new(SshTransport::new(config.agent.remote_path.clone())), target)
        };

        state.begin(target.display())?;
        println!("Connecting to {}...", target.display());
        let deployer = AgentDeployer::new(&config.agent);

        let mut session = match establish(transport, &target, &deployer, &config.polling).await {
            Ok(session) => session,
            Err(e) => {
                state.failed(&e)?;
                println!("Connection failed: {}", e);
                if retry(&mut lines).await {
                    continue;
                }
                break;
            }
        };
        state.established()?;
        info!(target: "audit", "login {}", target.display());

        if !args.dev {
            config.remember_login(&target.host, &target.user, target.port);
            if let Err(e) = storage.save(&config) {
                warn!("[perssh] Failed to save config: {}", e);
            }
        }

        println!("Connected. Type 'help' for commands.");
        let outcome = App::new().run(&mut session, &mut lines, &mut std::io::stdout()).await;
        match outcome {
            RunOutcome::Quit => {
                state.begin_close()?;
                session.close().await;
                state.closed()?;
                info!(target: "audit", "logout {}", target.display());
                break;
            }
            RunOutcome::Disconnected(e) => {
                state.lost(&e)?;
                session.close().await;
                println!("Session lost: {}", e);
                if !retry(&mut lines).await {
                    break;
                }
            }
        }
    }

    Ok(())
}

fn local_transport(config: &ClientConfig) -> LocalTransport {
    match &config.agent.local_binary {
        Some(path) => LocalTransport::with_binary(path),
        None => LocalTransport::new(),
    }
}

fn dev_target(config: &ClientConfig) -> ConnectTarget {
    ConnectTarget {
        host: "localhost".to_string(),
        user: "dev".to_string(),
        port: 0,
        credentials: Credentials::default(),
        timeout: config.connect_timeout(),
    }
}

/// Offer discovered SSH hosts; the chosen one becomes the default host.
async fn scan(config: &ClientConfig) -> Option<String> {
    println!("Scanning local network for SSH hosts...");
    let timeout = Duration::from_millis(config.network.scan_timeout_ms);
    match discovery::scan_local_subnet(22, timeout).await {
        None => {
            println!("No local IPv4 network found");
            None
        }
        Some(found) if found.is_empty() => {
            println!("No SSH hosts found");
            None
        }
        Some(found) => {
            for addr in &found {
                println!("  {}", addr.ip());
            }
            found.first().map(|addr| addr.ip().to_string())
        }
    }
}

async fn retry(lines: &mut tokio::sync::mpsc::Receiver<String>) -> bool {
    match app::prompt(lines, "Reconnect? [Y/n]", None).await {
        Some(answer) => !answer.eq_ignore_ascii_case("n") && !answer.eq_ignore_ascii_case("no"),
        None => false,
    }
}
