//! pifleet - synchronized photo capture across a fleet of Raspberry Pis
//!
//! Discovers camera devices on the local network, opens a remote control
//! session to each, triggers captures on all of them in lock-step and
//! collects the resulting images into one local directory.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`discovery`] - Finding device addresses (network scan or fixed list)
//! - [`transport`] - Remote session contract, SSH and in-memory implementations
//! - [`registry`] - Per-device sessions, identities and concurrent fan-out
//! - [`orchestrator`] - The capture lifecycle state machine and run summary
//! - [`metrics`] - Prometheus metrics (broadcast latency, faults, files)
//! - [`error`] - Error types
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pifleet::config::Config;
//! use pifleet::discovery::provider_for;
//! use pifleet::orchestrator::run_fleet;
//! use pifleet::transport::SshTransport;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::from_env());
//!     config.validate()?;
//!
//!     let discovery = provider_for(&config.discovery);
//!     let transport = SshTransport::new(&config);
//!     let summary = run_fleet(config, discovery.as_ref(), &transport, "studio").await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod transport;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::discovery::{DiscoveryProvider, NmapDiscovery, StaticDiscovery};
    pub use crate::error::{DeviceFault, Error, ErrorCategory, FleetErrorTrait, Result, RunError};
    pub use crate::orchestrator::{run_fleet, CaptureOrchestrator, RunState, RunSummary};
    pub use crate::registry::{DeviceId, FaultPolicy, SessionRegistry};
    pub use crate::transport::{MemoryTransport, RemoteTransport, SignalKind, SshTransport};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use orchestrator::{RunState, RunSummary};
pub use registry::DeviceId;
