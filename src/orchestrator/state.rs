//! Capture run state: lifecycle states, per-device records, broadcast timings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::error::DeviceFault;
use crate::registry::DeviceId;

/// Lifecycle state of a capture run
///
/// `Idle → Preparing → Capturing(1..=k) → Finalizing → Collecting → Done`,
/// with `Aborted` reachable from any state but `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Preparing,
    Capturing { round: u32, of: u32 },
    Finalizing,
    Collecting,
    Done,
    Aborted,
}

impl RunState {
    /// Phase name used in logs, faults and metric labels
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Capturing { .. } => "capturing",
            Self::Finalizing => "finalizing",
            Self::Collecting => "collecting",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capturing { round, of } => write!(f, "capturing({round}/{of})"),
            other => f.write_str(other.phase()),
        }
    }
}

/// Where a device stands in the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Taking part in the run
    Live,
    /// Dropped from the remaining phases after a fault
    Excluded,
    /// Never connected
    Unreachable,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Excluded => "excluded",
            Self::Unreachable => "unreachable",
        }
    }
}

/// A fault and the phase it was raised in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub phase: String,
    #[serde(flatten)]
    pub fault: DeviceFault,
}

/// One file copied off a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedFile {
    /// Name in the remote run directory
    pub remote: String,
    pub local: PathBuf,
    pub bytes: u64,
}

/// Everything the run learned about one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub address: String,
    pub status: DeviceStatus,
    /// Capture process was started
    pub spawned: bool,
    /// Capture process did not exit cleanly; frames may be missing
    pub incomplete: bool,
    /// Capture signals dispatched to the device
    pub signals_sent: u32,
    /// Files listed in the remote run directory at collection time
    pub remote_files: Vec<String>,
    pub collected: Vec<CollectedFile>,
    pub faults: Vec<FaultRecord>,
}

impl DeviceRecord {
    pub fn new(id: DeviceId, address: impl Into<String>, status: DeviceStatus) -> Self {
        Self {
            id,
            address: address.into(),
            status,
            spawned: false,
            incomplete: false,
            signals_sent: 0,
            remote_files: Vec::new(),
            collected: Vec::new(),
            faults: Vec::new(),
        }
    }

    /// At least one image was retrieved from the device
    pub fn contributed(&self) -> bool {
        !self.collected.is_empty()
    }

    pub fn bytes_collected(&self) -> u64 {
        self.collected.iter().map(|f| f.bytes).sum()
    }
}

/// One named capture run and its accumulated results
#[derive(Debug, Clone)]
pub struct CaptureRun {
    pub id: Uuid,
    pub session: String,
    /// Trigger rounds requested
    pub target: u32,
    pub state: RunState,
    /// States visited, in order
    pub history: Vec<RunState>,
    pub devices: BTreeMap<DeviceId, DeviceRecord>,
    pub broadcast_latencies: Vec<Duration>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CaptureRun {
    pub fn new(session: impl Into<String>, target: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            session: session.into(),
            target,
            state: RunState::Idle,
            history: vec![RunState::Idle],
            devices: BTreeMap::new(),
            broadcast_latencies: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: RunState) {
        tracing::info!(session = %self.session, from = %self.state, to = %next, "Run state change");
        self.state = next;
        self.history.push(next);
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn add_device(&mut self, record: DeviceRecord) {
        self.devices.insert(record.id, record);
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(&id)
    }

    pub fn record_fault(&mut self, id: DeviceId, phase: &str, fault: DeviceFault) {
        if let Some(record) = self.devices.get_mut(&id) {
            if fault.excludes_device() && record.status == DeviceStatus::Live {
                record.status = DeviceStatus::Excluded;
            }
            if matches!(fault, DeviceFault::TerminationTimeout { .. }) {
                record.incomplete = true;
            }
            record.faults.push(FaultRecord {
                phase: phase.to_string(),
                fault,
            });
        }
    }

    pub fn record_broadcast(&mut self, latency: Duration) {
        self.broadcast_latencies.push(latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(RunState::Capturing { round: 2, of: 9 }.to_string(), "capturing(2/9)");
        assert_eq!(RunState::Finalizing.to_string(), "finalizing");
        assert!(RunState::Aborted.is_terminal());
        assert!(!RunState::Collecting.is_terminal());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&RunState::Capturing { round: 1, of: 3 }).unwrap();
        assert_eq!(json, r#"{"state":"capturing","round":1,"of":3}"#);
    }

    #[test]
    fn test_transition_history() {
        let mut run = CaptureRun::new("studio", 2);
        run.transition(RunState::Preparing);
        run.transition(RunState::Aborted);

        assert_eq!(run.history, vec![RunState::Idle, RunState::Preparing, RunState::Aborted]);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_record_fault_updates_status() {
        let mut run = CaptureRun::new("studio", 1);
        run.add_device(DeviceRecord::new(DeviceId(0), "10.0.0.1", DeviceStatus::Live));
        run.add_device(DeviceRecord::new(DeviceId(1), "10.0.0.2", DeviceStatus::Live));

        run.record_fault(DeviceId(0), "finalizing", DeviceFault::TerminationTimeout { timeout_ms: 10 });
        run.record_fault(DeviceId(1), "preparing", DeviceFault::preparation("read-only file system"));

        let a = &run.devices[&DeviceId(0)];
        assert_eq!(a.status, DeviceStatus::Live);
        assert!(a.incomplete);

        let b = &run.devices[&DeviceId(1)];
        assert_eq!(b.status, DeviceStatus::Excluded);
        assert_eq!(b.faults[0].phase, "preparing");
    }
}
