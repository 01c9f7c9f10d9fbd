use anyhow::{bail, Context, Result};
use std::sync::Arc;

use pifleet::config::Config;
use pifleet::discovery::StaticDiscovery;
use pifleet::orchestrator::run_fleet;
use pifleet::transport::{DeviceBehavior, MemoryTransport};

/// Parameters for a simulated run
#[derive(Debug, Clone)]
pub struct SimulateParams {
    pub session: String,
    pub devices: usize,
    /// Indices of devices that refuse connections
    pub unreachable: Vec<usize>,
    /// Indices of devices whose capture process ignores shutdown
    pub hang: Vec<usize>,
    pub json: bool,
}

pub async fn simulate(config: Config, params: SimulateParams) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    if let Some(index) = params
        .unreachable
        .iter()
        .chain(&params.hang)
        .find(|&&i| i >= params.devices)
    {
        bail!("device index {index} is out of range for {} devices", params.devices);
    }

    let (transport, addresses) = MemoryTransport::fleet(params.devices);
    for (index, address) in addresses.iter().enumerate() {
        let behavior = DeviceBehavior {
            refuse_connection: params.unreachable.contains(&index),
            hang_on_shutdown: params.hang.contains(&index),
            ..Default::default()
        };
        transport.set_behavior(address, behavior);
    }

    tracing::info!(
        devices = params.devices,
        unreachable = ?params.unreachable,
        hang = ?params.hang,
        "Simulating capture run"
    );

    let discovery = StaticDiscovery::new(addresses);
    let result = run_fleet(Arc::new(config), &discovery, &transport, &params.session).await;

    super::report(result, params.json)
}
