//! User-facing report of a finished capture run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use super::state::{CaptureRun, DeviceStatus, RunState};
use crate::error::Result;
use crate::registry::DeviceId;
use crate::utils::{format_bytes, millis_f64};

/// Spread of per-round broadcast latencies, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BroadcastStats {
    pub rounds: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
}

impl BroadcastStats {
    pub fn from_latencies(latencies: &[Duration]) -> Self {
        if latencies.is_empty() {
            return Self::default();
        }

        let millis: Vec<f64> = latencies.iter().copied().map(millis_f64).collect();
        let min_ms = millis.iter().copied().fold(f64::INFINITY, f64::min);
        let max_ms = millis.iter().copied().fold(0.0, f64::max);
        let mean_ms = millis.iter().sum::<f64>() / millis.len() as f64;

        Self {
            rounds: millis.len(),
            min_ms,
            max_ms,
            mean_ms,
        }
    }
}

/// Per-device line of a run summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub address: String,
    pub status: DeviceStatus,
    /// At least one image was retrieved
    pub contributed: bool,
    /// Capture process did not shut down cleanly
    pub incomplete: bool,
    pub signals_sent: u32,
    pub files_retrieved: usize,
    pub bytes_retrieved: u64,
    pub errors: Vec<String>,
}

/// Outcome of one capture run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub session: String,
    pub state: RunState,
    pub target_rounds: u32,
    pub history: Vec<RunState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub broadcast: BroadcastStats,
    pub devices: Vec<DeviceSummary>,
}

impl RunSummary {
    pub fn from_run(run: &CaptureRun) -> Self {
        let devices = run
            .devices
            .values()
            .map(|record| DeviceSummary {
                id: record.id,
                address: record.address.clone(),
                status: record.status,
                contributed: record.contributed(),
                incomplete: record.incomplete,
                signals_sent: record.signals_sent,
                files_retrieved: record.collected.len(),
                bytes_retrieved: record.bytes_collected(),
                errors: record
                    .faults
                    .iter()
                    .map(|f| format!("{}: {}", f.phase, f.fault))
                    .collect(),
            })
            .collect();

        Self {
            run_id: run.id,
            session: run.session.clone(),
            state: run.state,
            target_rounds: run.target,
            history: run.history.clone(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            broadcast: BroadcastStats::from_latencies(&run.broadcast_latencies),
            devices,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceSummary> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Devices that contributed at least one image
    pub fn contributing_devices(&self) -> usize {
        self.devices.iter().filter(|d| d.contributed).count()
    }

    pub fn files_retrieved(&self) -> usize {
        self.devices.iter().map(|d| d.files_retrieved).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the summary as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run '{}' ({}) ended {}: {}/{} devices contributed, {} files retrieved",
            self.session,
            self.run_id,
            self.state,
            self.contributing_devices(),
            self.devices.len(),
            self.files_retrieved()
        )?;

        if self.broadcast.rounds > 0 {
            writeln!(
                f,
                "Broadcast latency over {} rounds: min {:.1}ms, mean {:.1}ms, max {:.1}ms",
                self.broadcast.rounds, self.broadcast.min_ms, self.broadcast.mean_ms, self.broadcast.max_ms
            )?;
        }

        writeln!(
            f,
            "{:<10} {:<16} {:<12} {:>7} {:>7} {:>10}  NOTES",
            "DEVICE", "ADDRESS", "STATUS", "SIGNALS", "FILES", "SIZE"
        )?;

        for device in &self.devices {
            let status = if device.incomplete {
                format!("{}*", device.status.as_str())
            } else {
                device.status.as_str().to_string()
            };
            writeln!(
                f,
                "{:<10} {:<16} {:<12} {:>7} {:>7} {:>10}  {}",
                device.id.to_string(),
                device.address,
                status,
                device.signals_sent,
                device.files_retrieved,
                format_bytes(device.bytes_retrieved),
                device.errors.join("; ")
            )?;
        }

        Ok(())
    }
}
