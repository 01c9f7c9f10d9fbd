use anyhow::{Context, Result};

use pifleet::config::Config;
use pifleet::discovery::provider_for;

pub async fn discover(config: &Config) -> Result<()> {
    let provider = provider_for(&config.discovery);
    let addresses = provider
        .discover()
        .await
        .context("Device discovery failed")?;

    if addresses.is_empty() {
        println!(
            "No devices matching '{}' found on {}",
            config.discovery.vendor_signature, config.discovery.subnet
        );
        return Ok(());
    }

    println!("Found {} devices:", addresses.len());
    for (index, address) in addresses.iter().enumerate() {
        println!("  device{index}  {address}");
    }

    Ok(())
}
