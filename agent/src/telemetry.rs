//! Host telemetry.
//!
//! CPU usage is a delta between two refreshes, so the collector keeps its
//! `System` across calls; the first snapshot after startup reports 0% CPU.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use perssh_protocol::TelemetryData;
use sysinfo::{Disks, System};
use thiserror::Error;
use tracing::trace;

/// hwmon drivers that report the CPU package temperature.
const CPU_SENSOR_DRIVERS: [&str; 4] = ["coretemp", "k10temp", "cpu_thermal", "acpitz"];

/// Number of hwmon devices scanned.
const MAX_HWMON_DEVICES: usize = 10;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Memory statistics unavailable")]
    MemoryUnavailable,

    #[error("No disks reported by the host")]
    NoDisks,
}

/// Source of telemetry snapshots. `docker_running` is filled in by the
/// dispatcher from the backend and left `false` here.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn snapshot(&self) -> Result<TelemetryData, TelemetryError>;
}

/// Reads telemetry from the local host.
pub struct SystemTelemetry {
    system: Mutex<System>,
    hwmon_root: PathBuf,
}

impl SystemTelemetry {
    pub fn new() -> Self {
        let mut system = System::new();
        // Baseline for the first CPU delta
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
            hwmon_root: PathBuf::from("/sys/class/hwmon"),
        }
    }
}

impl Default for SystemTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for SystemTelemetry {
    async fn snapshot(&self) -> Result<TelemetryData, TelemetryError> {
        let (cpu_usage, ram_total, ram_used) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                f64::from(system.global_cpu_usage()),
                system.total_memory(),
                system.used_memory(),
            )
        };
        if ram_total == 0 {
            return Err(TelemetryError::MemoryUnavailable);
        }

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| disks.list().first())
            .ok_or(TelemetryError::NoDisks)?;

        Ok(TelemetryData {
            timestamp: Utc::now(),
            cpu_usage: round2(cpu_usage),
            cpu_temp: read_cpu_temperature(&self.hwmon_root).unwrap_or(0.0),
            ram_usage: round2(ram_used as f64 / ram_total as f64 * 100.0),
            ram_total,
            ram_used,
            disk_free: root.available_space(),
            disk_total: root.total_space(),
            docker_running: false,
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// First CPU sensor found under `root` (a `/sys/class/hwmon`-like tree), in °C.
fn read_cpu_temperature(root: &Path) -> Option<f64> {
    (0..MAX_HWMON_DEVICES).find_map(|i| {
        let device = root.join(format!("hwmon{}", i));
        let name = std::fs::read_to_string(device.join("name")).ok()?;
        let name = name.trim();
        if !CPU_SENSOR_DRIVERS.iter().any(|d| name.contains(d)) {
            return None;
        }
        let raw = std::fs::read_to_string(device.join("temp1_input")).ok()?;
        let millidegrees: f64 = raw.trim().parse().ok()?;
        trace!("[telemetry] {} reports {} m°C", name, millidegrees);
        Some(millidegrees / 1000.0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round2() {
        assert_eq!(round2(12.3456), 12.35);
        assert_eq!(round2(0.0), 0.0);
    }

    #[test]
    fn test_hwmon_scan_prefers_cpu_drivers() {
        let dir = tempfile::tempdir().unwrap();
        let nvme = dir.path().join("hwmon0");
        let cpu = dir.path().join("hwmon1");
        std::fs::create_dir_all(&nvme).unwrap();
        std::fs::create_dir_all(&cpu).unwrap();
        std::fs::write(nvme.join("name"), "nvme\n").unwrap();
        std::fs::write(nvme.join("temp1_input"), "38000\n").unwrap();
        std::fs::write(cpu.join("name"), "k10temp\n").unwrap();
        std::fs::write(cpu.join("temp1_input"), "52500\n").unwrap();

        assert_eq!(read_cpu_temperature(dir.path()), Some(52.5));
    }

    #[test]
    fn test_hwmon_scan_missing_tree() {
        assert_eq!(read_cpu_temperature(Path::new("/nonexistent/hwmon")), None);
    }
}
