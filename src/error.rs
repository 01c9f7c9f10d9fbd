//! Unified error handling for the pifleet crate
//!
//! Errors come in two flavours:
//!
//! - [`DeviceFault`] - something went wrong on one device. These are values,
//!   not propagated errors: the fan-out boundary records them against the
//!   device and the run carries on with the rest of the fleet.
//! - [`RunError`] - the run as a whole cannot continue (discovery failed, or
//!   no device survived a phase).
//!
//! [`Error`] wraps every layer's error type for callers that want a single
//! type across module boundaries.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::discovery::DiscoveryError;
pub use crate::transport::TransportError;

use crate::orchestrator::RunSummary;
use crate::registry::DeviceId;

/// Common trait for pifleet error types
pub trait FleetErrorTrait: std::error::Error {
    /// Check if this error is recoverable (a later attempt may succeed)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Network-related errors (unreachable device, lost channel, timeout)
    Network,
    /// Discovery scan errors
    Discovery,
    /// A device misbehaved (failed command, hung process)
    Device,
    /// Local storage and I/O errors
    Storage,
    /// Configuration and validation errors
    Config,
    /// The run could not continue
    Run,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Discovery => "discovery",
            Self::Device => "device",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Run => "run",
            Self::Other => "other",
        }
    }
}

/// A failure confined to one device
///
/// Recorded in the run's per-device results; never aborts the run on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceFault {
    #[error("connection failed: {reason}")]
    ConnectionFailure { reason: String },

    #[error("preparation failed: {reason}")]
    PreparationFailure { reason: String },

    #[error("capture process failed to start: {reason}")]
    SpawnFailure { reason: String },

    /// The capture process outlived the termination wait; frames may be missing
    #[error("capture process did not exit within {timeout_ms}ms")]
    TerminationTimeout { timeout_ms: u64 },

    #[error("failed to collect {file}: {reason}")]
    CollectionFailure { file: String, reason: String },

    #[error("{phase} did not finish within {timeout_ms}ms")]
    PhaseTimeout { phase: String, timeout_ms: u64 },

    #[error("cancelled during {phase} after another device failed")]
    Cancelled { phase: String },
}

impl DeviceFault {
    pub fn connection(reason: impl ToString) -> Self {
        Self::ConnectionFailure {
            reason: reason.to_string(),
        }
    }

    pub fn preparation(reason: impl ToString) -> Self {
        Self::PreparationFailure {
            reason: reason.to_string(),
        }
    }

    pub fn spawn(reason: impl ToString) -> Self {
        Self::SpawnFailure {
            reason: reason.to_string(),
        }
    }

    pub fn collection(file: impl Into<String>, reason: impl ToString) -> Self {
        Self::CollectionFailure {
            file: file.into(),
            reason: reason.to_string(),
        }
    }

    /// Faults after which the device takes no further part in the run
    pub fn excludes_device(&self) -> bool {
        !matches!(
            self,
            Self::TerminationTimeout { .. } | Self::CollectionFailure { .. }
        )
    }
}

impl FleetErrorTrait for DeviceFault {
    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailure { .. } | Self::PhaseTimeout { .. } | Self::Cancelled { .. }
        )
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionFailure { .. } | Self::PhaseTimeout { .. } => ErrorCategory::Network,
            Self::CollectionFailure { .. } => ErrorCategory::Storage,
            Self::Cancelled { .. } => ErrorCategory::Run,
            Self::PreparationFailure { .. }
            | Self::SpawnFailure { .. }
            | Self::TerminationTimeout { .. } => ErrorCategory::Device,
        }
    }
}

/// Errors that end a capture run
#[derive(Error, Debug)]
pub enum RunError {
    /// No device list could be produced
    #[error("Discovery failed: {0}")]
    DiscoveryFailure(#[from] DiscoveryError),

    /// Zero devices survived a phase boundary
    #[error("No devices left to control after {phase}")]
    FleetExhausted {
        phase: String,
        summary: Box<RunSummary>,
    },

    /// A device failed while the run required every device to succeed
    #[error("{device} failed during {phase} in strict mode: {fault}")]
    StrictAbort {
        device: DeviceId,
        phase: String,
        fault: DeviceFault,
        summary: Box<RunSummary>,
    },

    #[error("Invalid session: {0}")]
    InvalidSession(#[from] ConfigError),
}

impl RunError {
    /// Summary of the aborted run, when it got far enough to have one
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            Self::FleetExhausted { summary, .. } | Self::StrictAbort { summary, .. } => Some(summary),
            Self::DiscoveryFailure(_) | Self::InvalidSession(_) => None,
        }
    }
}

impl FleetErrorTrait for RunError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::DiscoveryFailure(e) => e.is_recoverable(),
            Self::FleetExhausted { .. } | Self::StrictAbort { .. } => true,
            Self::InvalidSession(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::DiscoveryFailure(_) => ErrorCategory::Discovery,
            Self::FleetExhausted { .. } | Self::StrictAbort { .. } => ErrorCategory::Run,
            Self::InvalidSession(_) => ErrorCategory::Config,
        }
    }
}

/// Unified error type for the pifleet crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl FleetErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Discovery(e) => e.is_recoverable(),
            Self::Transport(e) => e.is_recoverable(),
            Self::Run(e) => e.is_recoverable(),
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Config,
            Self::Discovery(_) => ErrorCategory::Discovery,
            Self::Transport(TransportError::Command { .. } | TransportError::Spawn { .. }) => {
                ErrorCategory::Device
            }
            Self::Transport(TransportError::Io(_)) => ErrorCategory::Storage,
            Self::Transport(_) => ErrorCategory::Network,
            Self::Run(e) => e.category(),
            Self::Io(_) => ErrorCategory::Storage,
            Self::Json(_) => ErrorCategory::Other,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
