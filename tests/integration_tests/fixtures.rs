//! Test fixtures for integration tests
//!
//! Provides a fast configuration and helpers for building simulated fleets

use std::path::Path;
use std::sync::Arc;

use pifleet::config::Config;
use pifleet::registry::SessionRegistry;
use pifleet::transport::{DeviceBehavior, MemoryTransport};

/// Session name used by most tests
pub const SESSION: &str = "shoot";

/// Remote run directory for [`SESSION`] under the default base path
pub const REMOTE_DIR: &str = "/tmp/shoot";

/// Configuration with short intervals, writing into `output`
pub fn fast_config(output: &Path, images: u32) -> Config {
    let mut config = Config::default();
    config.storage.local_output = output.to_path_buf();
    config.capture.images_per_session = images;
    config.capture.settle_interval_ms = 5;
    config.capture.trigger_interval_ms = 5;
    config.timeouts.connect_attempts = 1;
    config.timeouts.termination_secs = 1;
    config
}

/// Simulated fleet of `count` devices with per-index behaviours applied
pub fn fleet(count: usize, behaviors: &[(usize, DeviceBehavior)]) -> (MemoryTransport, Vec<String>) {
    let (transport, addresses) = MemoryTransport::fleet(count);
    for (index, behavior) in behaviors {
        transport.set_behavior(&addresses[*index], behavior.clone());
    }
    (transport, addresses)
}

pub async fn connect(transport: &MemoryTransport, addresses: &[String], config: &Config) -> SessionRegistry {
    SessionRegistry::connect(transport, addresses, config).await
}

pub fn shared(config: Config) -> Arc<Config> {
    Arc::new(config)
}

/// Sorted file names in a local directory
pub fn local_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
