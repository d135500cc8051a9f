//! Dashboard snapshot
//!
//! Client-side view assembled from routed responses. Inventory is replaced
//! wholesale on every listing; nothing is merged across responses.

use std::collections::VecDeque;

use perssh_protocol::{ContainerInfo, Response, TelemetryData};
use tracing::{debug, warn};

use crate::rpc::{log_target, Routed, Topic};

/// Telemetry samples kept for sparklines (5 minutes at the default cadence)
pub const HISTORY_CAPACITY: usize = 300;

/// Outcome of an operator action, shown once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Done(String),
    Warning(String),
    Failed(String),
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done(msg) => write!(f, "ok: {}", msg),
            Self::Warning(msg) => write!(f, "warning: {}", msg),
            Self::Failed(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Log tail of the focused instance.
#[derive(Debug, Default)]
pub struct LogPane {
    target: Option<String>,
    lines: Vec<String>,
}

impl LogPane {
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    fn focus(&mut self, target: Option<String>) {
        if self.target != target {
            self.target = target;
            self.lines.clear();
        }
    }

    /// Replace the tail and return the lines not shown before.
    fn update(&mut self, text: &str) -> Vec<String> {
        let next: Vec<String> = text.lines().map(str::to_string).collect();
        // Longest tail of the shown window that the new window starts with
        let shown = &self.lines;
        let overlap = (0..=shown.len().min(next.len()))
            .rev()
            .find(|&k| shown[shown.len() - k..] == next[..k])
            .unwrap_or(0);
        let fresh = next[overlap..].to_vec();
        self.lines = next;
        fresh
    }
}

#[derive(Debug, Default)]
pub struct Dashboard {
    history: VecDeque<TelemetryData>,
    telemetry_error: Option<String>,
    inventory: Vec<ContainerInfo>,
    inventory_error: Option<String>,
    logs: LogPane,
    pending_log_lines: Vec<String>,
    notices: VecDeque<Notice>,
}

impl Dashboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_telemetry(&self) -> Option<&TelemetryData> {
        self.history.back()
    }

    pub fn history(&self) -> impl Iterator<Item = &TelemetryData> {
        self.history.iter()
    }

    pub fn inventory(&self) -> &[ContainerInfo] {
        &self.inventory
    }

    pub fn logs(&self) -> &LogPane {
        &self.logs
    }

    /// Switch the log pane to another instance (or close it).
    pub fn focus(&mut self, target: Option<String>) {
        self.logs.focus(target);
        self.pending_log_lines.clear();
    }

    /// Notices and new log lines since the last call.
    pub fn drain_updates(&mut self) -> (Vec<Notice>, Vec<String>) {
        (
            self.notices.drain(..).collect(),
            std::mem::take(&mut self.pending_log_lines),
        )
    }

    /// Fold one routed response into the view.
    pub fn apply(&mut self, routed: Routed) {
        let Routed { topic, response } = routed;
        match topic {
            Some(Topic::Telemetry) => self.apply_telemetry(response),
            Some(Topic::Inventory) => self.apply_inventory(response),
            Some(Topic::Logs) => self.apply_logs(response),
            Some(Topic::Create) => self.apply_create(response),
            Some(Topic::Action) | Some(Topic::Input) => self.apply_action(response),
            Some(Topic::Ping) => self.notices.push_back(match response.error {
                None if response.success => Notice::Done("agent answered PONG".to_string()),
                error => Notice::Failed(error.unwrap_or_default()),
            }),
            None => warn!("[dashboard] Unroutable response id={}", response.id),
        }
    }

    fn apply_telemetry(&mut self, response: Response) {
        if !response.success {
            self.telemetry_error = response.error;
            return;
        }
        match response.data_as::<TelemetryData>() {
            Ok(sample) => {
                if self.history.len() >= HISTORY_CAPACITY {
                    self.history.pop_front();
                }
                self.history.push_back(sample);
                self.telemetry_error = None;
            }
            Err(e) => self.telemetry_error = Some(format!("Invalid telemetry: {}", e)),
        }
    }

    fn apply_inventory(&mut self, response: Response) {
        if !response.success {
            self.inventory_error = response.error;
            return;
        }
        // `data` is omitted when the agent has nothing to report
        let listed = match response.data {
            None => Ok(Vec::new()),
            Some(_) => response.data_as::<Vec<ContainerInfo>>(),
        };
        match listed {
            Ok(list) => {
                self.inventory = list;
                self.inventory_error = None;
            }
            Err(e) => self.inventory_error = Some(format!("Invalid inventory: {}", e)),
        }
    }

    fn apply_logs(&mut self, response: Response) {
        let Some(focused) = self.logs.target() else {
            return;
        };
        if let Some(requested) = log_target(&response.id) {
            if requested != focused {
                debug!("[dashboard] Dropping logs of {} after focus moved to {}", requested, focused);
                return;
            }
        }
        if !response.success {
            self.pending_log_lines
                .push(format!("(logs unavailable: {})", response.error.unwrap_or_default()));
            return;
        }
        let text = response.data_as::<String>().unwrap_or_default();
        let fresh = self.logs.update(&text);
        self.pending_log_lines.extend(fresh);
    }

    fn apply_create(&mut self, response: Response) {
        if !response.success {
            self.notices
                .push_back(Notice::Failed(response.error.unwrap_or_default()));
            return;
        }
        let id = response.data_as::<String>().unwrap_or_default();
        self.notices.push_back(Notice::Done(format!("created {}", short_id(&id))));
        // Created but auto-start failed
        if let Some(warning) = response.error {
            self.notices.push_back(Notice::Warning(warning));
        }
    }

    fn apply_action(&mut self, response: Response) {
        self.notices.push_back(if response.success {
            Notice::Done("done".to_string())
        } else {
            Notice::Failed(response.error.unwrap_or_default())
        });
    }

    /// Full id for an operator-supplied id prefix or instance name.
    pub fn resolve_instance(&self, needle: &str) -> Option<String> {
        if let Some(c) = self.inventory.iter().find(|c| c.id == needle || c.name == needle) {
            return Some(c.id.clone());
        }
        let mut matches = self.inventory.iter().filter(|c| c.id.starts_with(needle));
        match (matches.next(), matches.next()) {
            (Some(only), None) => Some(only.id.clone()),
            _ => None,
        }
    }

    /// Multi-line status view.
    pub fn render(&self) -> String {
        let mut out = String::new();
        match self.latest_telemetry() {
            Some(t) => {
                let ram_gib = t.ram_total as f64 / (1024.0 * 1024.0 * 1024.0);
                let disk_gib = t.disk_free as f64 / (1024.0 * 1024.0 * 1024.0);
                out.push_str(&format!(
                    "CPU {:5.1}%  {:4.1}°C  {}\nRAM {:5.1}% of {:.1} GiB  Disk {:.1} GiB free  Docker {}\n",
                    t.cpu_usage,
                    t.cpu_temp,
                    sparkline(self.history.iter().map(|s| s.cpu_usage)),
                    t.ram_usage,
                    ram_gib,
                    disk_gib,
                    if t.docker_running { "running" } else { "unavailable" },
                ));
            }
            None => out.push_str("Waiting for telemetry...\n"),
        }
        if let Some(e) = &self.telemetry_error {
            out.push_str(&format!("Telemetry error: {}\n", e));
        }
        out.push_str(&self.render_inventory());
        out
    }

    pub fn render_inventory(&self) -> String {
        let mut out = String::new();
        if let Some(e) = &self.inventory_error {
            out.push_str(&format!("Inventory error: {}\n", e));
        }
        if self.inventory.is_empty() {
            out.push_str("No instances.\n");
            return out;
        }
        out.push_str(&format!("{:<14} {:<20} {:<10} {}\n", "ID", "NAME", "STATUS", "IMAGE"));
        for c in &self.inventory {
            out.push_str(&format!(
                "{:<14} {:<20} {:<10} {}\n",
                short_id(&c.id),
                c.name,
                c.status,
                c.image
            ));
        }
        out
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Last 30 samples as block characters (0-100 scale).
fn sparkline(values: impl DoubleEndedIterator<Item = f64>) -> String {
    const BARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
    let mut recent: Vec<f64> = values.rev().take(30).collect();
    recent.reverse();
    recent
        .into_iter()
        .map(|v| BARS[((v.clamp(0.0, 100.0) / 100.0) * 7.0).round() as usize])
        .collect()
}
