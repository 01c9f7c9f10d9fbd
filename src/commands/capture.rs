use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use pifleet::config::Config;
use pifleet::discovery::provider_for;
use pifleet::metrics;
use pifleet::orchestrator::run_fleet;
use pifleet::transport::SshTransport;

pub async fn capture(
    config: Config,
    session: &str,
    json: bool,
    metrics_out: Option<&Path>,
) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed");
    }

    let config = Arc::new(config);
    let discovery = provider_for(&config.discovery);
    let transport = SshTransport::new(&config);

    let result = run_fleet(Arc::clone(&config), discovery.as_ref(), &transport, session).await;

    if let Some(path) = metrics_out {
        match metrics::encode_metrics() {
            Ok(text) => std::fs::write(path, text)
                .with_context(|| format!("Failed to write metrics to {}", path.display()))?,
            Err(e) => tracing::warn!(error = %e, "Could not encode metrics"),
        }
    }

    super::report(result, json)
}
