//! Console front end
//!
//! A single reactor reacts to three kinds of events and never blocks on
//! I/O in between:
//!
//! - an operator line (command)
//! - a decoded agent response (folded into the dashboard)
//! - the render tick (pending notices and log lines are printed)
//!
//! Any error from the response stream ends the session; the caller decides
//! whether to log in again.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use perssh_protocol::{
    Command, CreateEnvPayload, EnvironmentType, MinecraftConfig, SendInputPayload,
};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::ClientConfig;
use crate::dashboard::Dashboard;
use crate::error::SessionError;
use crate::session::LiveSession;
use crate::transport::{ConnectTarget, Credentials};

const RENDER_INTERVAL: Duration = Duration::from_millis(200);

const HELP: &str = "\
Commands:
  status                         telemetry and instances
  list                           instances
  create <name> [image]          standard container (default ubuntu:latest)
  mc <name> [version] [type]     Minecraft server (VANILLA, FORGE, FABRIC, ARCLIGHT)
  start|stop|rm <id|name>        lifecycle
  logs <id|name>                 follow logs; 'close' to stop
  input <id|name> <text>         send a line to an instance's stdin
  > <text>                       send a line to the instance whose logs are open
  ping                           check the agent
  quit";

/// One parsed operator line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Status,
    List,
    Ping,
    Create { name: String, image: Option<String> },
    Minecraft { name: String, version: Option<String>, server_type: Option<String> },
    Start(String),
    Stop(String),
    Remove(String),
    Logs(String),
    CloseLogs,
    Input { target: Option<String>, data: String },
    Quit,
}

impl ConsoleCommand {
    /// `Ok(None)` for a blank line; `Err` carries a usage hint.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if let Some(data) = line.strip_prefix('>') {
            return Ok(Some(Self::Input {
                target: None,
                data: data.trim_start().to_string(),
            }));
        }

        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default().to_lowercase();
        let arg = |w: Option<&str>, usage: &str| {
            w.map(str::to_string).ok_or_else(|| format!("usage: {}", usage))
        };

        let cmd = match verb.as_str() {
            "help" | "?" => Self::Help,
            "status" => Self::Status,
            "list" | "ls" => Self::List,
            "ping" => Self::Ping,
            "create" => Self::Create {
                name: arg(words.next(), "create <name> [image]")?,
                image: words.next().map(str::to_string),
            },
            "mc" | "minecraft" => Self::Minecraft {
                name: arg(words.next(), "mc <name> [version] [type]")?,
                version: words.next().map(str::to_string),
                server_type: words.next().map(str::to_uppercase),
            },
            "start" => Self::Start(arg(words.next(), "start <id|name>")?),
            "stop" => Self::Stop(arg(words.next(), "stop <id|name>")?),
            "rm" | "remove" => Self::Remove(arg(words.next(), "rm <id|name>")?),
            "logs" => Self::Logs(arg(words.next(), "logs <id|name>")?),
            "close" => Self::CloseLogs,
            "input" => {
                let target = arg(words.next(), "input <id|name> <text>")?;
                let data = words.collect::<Vec<_>>().join(" ");
                Self::Input {
                    target: Some(target),
                    data,
                }
            }
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command '{}', try 'help'", other)),
        };
        Ok(Some(cmd))
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum RunOutcome {
    Quit,
    Disconnected(SessionError),
}

enum Flow {
    Continue,
    Quit,
}

/// State of one logged-in session.
#[derive(Default)]
pub struct App {
    dashboard: Dashboard,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dashboard(&self) -> &Dashboard {
        &self.dashboard
    }

    /// Run until the operator quits, input closes or the session breaks.
    pub async fn run<W: Write>(
        &mut self,
        session: &mut LiveSession,
        lines: &mut mpsc::Receiver<String>,
        out: &mut W,
    ) -> RunOutcome {
        let mut render = tokio::time::interval(RENDER_INTERVAL);
        let outcome = loop {
            tokio::select! {
                line = lines.recv() => {
                    let Some(line) = line else {
                        break RunOutcome::Quit;
                    };
                    if let Flow::Quit = self.handle_line(&line, session, out) {
                        break RunOutcome::Quit;
                    }
                }
                routed = session.responses().next_response() => match routed {
                    Ok(routed) => self.dashboard.apply(routed),
                    Err(e) => {
                        error!("[app] Session lost: {}", e);
                        break RunOutcome::Disconnected(e);
                    }
                },
                _ = render.tick() => self.flush(out),
            }
        };
        self.flush(out);
        outcome
    }

    fn handle_line<W: Write>(&mut self, line: &str, session: &LiveSession, out: &mut W) -> Flow {
        let cmd = match ConsoleCommand::parse(line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return Flow::Continue,
            Err(usage) => {
                let _ = writeln!(out, "{}", usage);
                return Flow::Continue;
            }
        };

        let command = match cmd {
            ConsoleCommand::Quit => return Flow::Quit,
            ConsoleCommand::Help => {
                let _ = writeln!(out, "{}", HELP);
                return Flow::Continue;
            }
            ConsoleCommand::Status => {
                let _ = write!(out, "{}", self.dashboard.render());
                return Flow::Continue;
            }
            ConsoleCommand::List => {
                let _ = write!(out, "{}", self.dashboard.render_inventory());
                return Flow::Continue;
            }
            ConsoleCommand::Logs(target) => {
                let id = self.resolve(&target);
                let _ = writeln!(
                    out,
                    "Following logs of {} ('close' to stop, '> text' to send input)",
                    target
                );
                self.dashboard.focus(Some(id.clone()));
                session.focus(Some(id));
                return Flow::Continue;
            }
            ConsoleCommand::CloseLogs => {
                self.dashboard.focus(None);
                session.focus(None);
                return Flow::Continue;
            }
            ConsoleCommand::Ping => Command::Ping,
            ConsoleCommand::Create { name, image } => {
                info!(target: "audit", "create {} ({})", name, image.as_deref().unwrap_or("default image"));
                Command::CreateEnv(CreateEnvPayload {
                    name,
                    kind: EnvironmentType::Standard,
                    image: image.unwrap_or_default(),
                    ..Default::default()
                })
            }
            ConsoleCommand::Minecraft { name, version, server_type } => {
                info!(target: "audit", "create minecraft {}", name);
                Command::CreateEnv(CreateEnvPayload {
                    name,
                    kind: EnvironmentType::Minecraft,
                    minecraft: Some(MinecraftConfig {
                        version,
                        server_type,
                        ..Default::default()
                    }),
                    ..Default::default()
                })
            }
            ConsoleCommand::Start(target) => {
                let id = self.resolve(&target);
                info!(target: "audit", "start {}", id);
                Command::StartEnv(id)
            }
            ConsoleCommand::Stop(target) => {
                let id = self.resolve(&target);
                info!(target: "audit", "stop {}", id);
                Command::StopEnv(id)
            }
            ConsoleCommand::Remove(target) => {
                let id = self.resolve(&target);
                info!(target: "audit", "remove {}", id);
                Command::RemoveEnv(id)
            }
            ConsoleCommand::Input { target, data } => {
                let id = match target {
                    Some(t) => self.resolve(&t),
                    None => match self.dashboard.logs().target() {
                        Some(t) => t.to_string(),
                        None => {
                            let _ = writeln!(out, "No logs open; use 'input <id> <text>'");
                            return Flow::Continue;
                        }
                    },
                };
                info!(target: "audit", "input to {}: {:?}", id, data);
                Command::SendInput(SendInputPayload { id, data })
            }
        };

        let mutates = matches!(
            command,
            Command::CreateEnv(_) | Command::StartEnv(_) | Command::StopEnv(_) | Command::RemoveEnv(_)
        );
        if let Err(e) = session.sender().send(command) {
            let _ = writeln!(out, "error: {}", e);
            return Flow::Continue;
        }
        // Refresh the inventory right behind a lifecycle change
        if mutates {
            let _ = session.sender().send(Command::ListContainers);
        }
        Flow::Continue
    }

    fn resolve(&self, target: &str) -> String {
        self.dashboard
            .resolve_instance(target)
            .unwrap_or_else(|| target.to_string())
    }

    fn flush<W: Write>(&mut self, out: &mut W) {
        let (notices, log_lines) = self.dashboard.drain_updates();
        for line in log_lines {
            let _ = writeln!(out, "│ {}", line);
        }
        for notice in notices {
            let _ = writeln!(out, "{}", notice);
        }
        let _ = out.flush();
    }
}

/// Spawn a task forwarding stdin lines. The channel closes at EOF.
pub fn stdin_lines() -> mpsc::Receiver<String> {
    use tokio::io::AsyncBufReadExt;

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Print `label [default]: ` and read one line. `None` when input closed.
pub async fn prompt(
    lines: &mut mpsc::Receiver<String>,
    label: &str,
    default: Option<&str>,
) -> Option<String> {
    {
        let mut stdout = std::io::stdout();
        let _ = match default {
            Some(d) if !d.is_empty() => write!(stdout, "{} [{}]: ", label, d),
            _ => write!(stdout, "{}: ", label),
        };
        let _ = stdout.flush();
    }
    let answer = lines.recv().await?;
    let answer = answer.trim();
    Some(match (answer.is_empty(), default) {
        (true, Some(d)) => d.to_string(),
        _ => answer.to_string(),
    })
}

/// Ask for host, user, port and credentials, defaulting to the last login.
/// `PERSSH_PASSWORD` skips the password prompt.
pub async fn read_login(
    lines: &mut mpsc::Receiver<String>,
    config: &ClientConfig,
    suggested_host: Option<&str>,
) -> Option<ConnectTarget> {
    let session = &config.session;
    let default_host = suggested_host.or(session.last_host.as_deref());

    let host = loop {
        let host = prompt(lines, "Host", default_host).await?;
        if !host.is_empty() {
            break host;
        }
    };
    let user = prompt(lines, "User", Some(session.last_user.as_deref().unwrap_or("root"))).await?;
    let port = loop {
        let port = session.last_port.to_string();
        match prompt(lines, "Port", Some(&port)).await?.parse::<u16>() {
            Ok(p) if p > 0 => break p,
            _ => println!("Port must be a number between 1 and 65535"),
        }
    };

    let key_default = session
        .key_path
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned());
    let key_path = prompt(lines, "Private key (empty for none)", key_default.as_deref())
        .await?;
    let password = match std::env::var("PERSSH_PASSWORD") {
        Ok(p) => p,
        Err(_) => prompt(lines, "Password (empty for none)", None).await?,
    };

    Some(ConnectTarget {
        host,
        user,
        port,
        credentials: Credentials {
            password: (!password.is_empty()).then_some(password),
            key_path: (!key_path.is_empty()).then(|| PathBuf::from(key_path)),
            key_passphrase: None,
        },
        timeout: config.connect_timeout(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollingConfig;
    use perssh_agent::backend::StubBackend;
    use perssh_agent::telemetry::SystemTelemetry;
    use perssh_agent::Dispatcher;
    use std::sync::Arc;

    fn quiet_polling() -> PollingConfig {
        PollingConfig {
            telemetry_ms: 3_600_000,
            inventory_ms: 3_600_000,
            logs_ms: 250,
        }
    }

    fn session_with_agent() -> LiveSession {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let dispatcher = Dispatcher::new(Arc::new(StubBackend::new()), Arc::new(SystemTelemetry::new()));
        tokio::spawn(async move {
            let (r, w) = tokio::io::split(server);
            dispatcher.serve(r, w).await
        });
        let (r, w) = tokio::io::split(client);
        LiveSession::attach(None, Box::new(r), Box::new(w), &quiet_polling())
    }

    /// Feed lines with a pause after each so responses settle in between.
    fn script(lines: &[&str]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        tokio::spawn(async move {
            for line in lines {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        rx
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("  "), Ok(None));
        assert_eq!(
            ConsoleCommand::parse("create web nginx:latest"),
            Ok(Some(ConsoleCommand::Create {
                name: "web".into(),
                image: Some("nginx:latest".into())
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("mc survival 1.20.4 fabric"),
            Ok(Some(ConsoleCommand::Minecraft {
                name: "survival".into(),
                version: Some("1.20.4".into()),
                server_type: Some("FABRIC".into())
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("input web say hello world"),
            Ok(Some(ConsoleCommand::Input {
                target: Some("web".into()),
                data: "say hello world".into()
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("> op steve"),
            Ok(Some(ConsoleCommand::Input {
                target: None,
                data: "op steve".into()
            }))
        );
        assert_eq!(ConsoleCommand::parse("RM abc"), Ok(Some(ConsoleCommand::Remove("abc".into()))));
        assert!(ConsoleCommand::parse("start").is_err());
        assert!(ConsoleCommand::parse("reboot").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_ping_through_agent() {
        let mut session = session_with_agent();
        let mut lines = script(&["create web nginx", "ping", "quit"]);
        let mut out = Vec::new();

        let mut app = App::new();
        let outcome = app.run(&mut session, &mut lines, &mut out).await;
        assert!(matches!(outcome, RunOutcome::Quit));

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ok: created mock-"), "{}", text);
        assert!(text.contains("ok: agent answered PONG"), "{}", text);
        assert_eq!(app.dashboard().inventory().len(), 1);
        assert_eq!(app.dashboard().inventory()[0].name, "web");
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_instance_leaves_view() {
        let mut session = session_with_agent();
        let mut lines = script(&["create a img", "create b img", "rm a", "quit"]);
        let mut out = Vec::new();

        let mut app = App::new();
        app.run(&mut session, &mut lines, &mut out).await;

        let names: Vec<&str> = app
            .dashboard()
            .inventory()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logs_follow_and_input() {
        let mut session = session_with_agent();
        let mut lines = script(&["create web img", "logs web", "> hello", "quit"]);
        let mut out = Vec::new();

        let mut app = App::new();
        app.run(&mut session, &mut lines, &mut out).await;

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Following logs of web"), "{}", text);
        assert!(text.contains("│ > hello"), "{}", text);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_exit_disconnects() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let (r, w) = tokio::io::split(client);
        let mut session = LiveSession::attach(None, Box::new(r), Box::new(w), &quiet_polling());
        let (_tx, mut lines) = mpsc::channel(1);
        let mut out = Vec::new();

        let outcome = App::new().run(&mut session, &mut lines, &mut out).await;
        assert!(matches!(outcome, RunOutcome::Disconnected(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_input_without_focus() {
        let session = session_with_agent();
        let mut app = App::new();
        let mut out = Vec::new();
        let before = session.sender().pending();
        app.handle_line("> hi", &session, &mut out);
        assert!(String::from_utf8(out).unwrap().contains("No logs open"));
        assert_eq!(session.sender().pending(), before);
    }
}
