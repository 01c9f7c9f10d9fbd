pub mod capture;
pub mod discover;
pub mod simulate;

// Re-export command functions for convenience
pub use capture::capture;
pub use discover::discover;
pub use simulate::{simulate, SimulateParams};

use anyhow::{bail, Context};
use std::path::Path;

use pifleet::config::Config;
use pifleet::error::{FleetErrorTrait, RunError};
use pifleet::RunSummary;

/// Defaults, then the optional TOML file, then `PIFLEET_*` overrides
pub fn load_config(path: Option<&Path>) -> pifleet::Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

/// Print the outcome of a run; an aborted run becomes an error (non-zero exit)
pub fn report(result: Result<RunSummary, RunError>, json: bool) -> anyhow::Result<()> {
    match result {
        Ok(summary) => {
            print_summary(&summary, json)?;
            Ok(())
        }
        Err(err) => {
            if let Some(summary) = err.summary() {
                print_summary(summary, json)?;
            }
            tracing::error!(
                category = err.category().as_str(),
                recoverable = err.is_recoverable(),
                error = %err,
                "Run failed"
            );
            bail!(err)
        }
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", summary.to_json().context("Failed to encode run summary")?);
    } else {
        print!("{summary}");
    }
    Ok(())
}
