//! Device discovery
//!
//! A [`DiscoveryProvider`] produces the ordered list of device addresses a
//! run will try to connect to. [`NmapDiscovery`] ping-scans a subnet and keeps
//! hosts whose network card belongs to the configured vendor;
//! [`StaticDiscovery`] returns a fixed list.

use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::process::Command;

use crate::config::DiscoveryConfig;

/// Errors raised while discovering devices
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Scanner could not be started
    #[error("Failed to launch scanner `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Scanner ran but reported failure
    #[error("Scanner exited with status {status:?}: {stderr}")]
    ScanFailed { status: Option<i32>, stderr: String },
}

impl DiscoveryError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ScanFailed { .. })
    }
}

/// Source of device addresses
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Addresses in discovery order. Finding nothing is `Ok(vec![])`.
    async fn discover(&self) -> Result<Vec<String>, DiscoveryError>;
}

/// Fixed address list
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    hosts: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl DiscoveryProvider for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(dedup_preserving_order(self.hosts.iter().cloned()))
    }
}

/// Ping scan with vendor filtering
#[derive(Debug, Clone)]
pub struct NmapDiscovery {
    subnet: String,
    vendor_signature: String,
    program: String,
    use_sudo: bool,
}

impl NmapDiscovery {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            subnet: config.subnet.clone(),
            vendor_signature: config.vendor_signature.clone(),
            program: config.nmap_path.clone(),
            use_sudo: config.use_sudo,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.program);
            cmd
        } else {
            Command::new(&self.program)
        };
        cmd.arg("-sn").arg(&self.subnet);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl DiscoveryProvider for NmapDiscovery {
    async fn discover(&self) -> Result<Vec<String>, DiscoveryError> {
        tracing::info!(subnet = %self.subnet, vendor = %self.vendor_signature, "Scanning for devices");

        let output = self
            .command()
            .output()
            .await
            .map_err(|source| DiscoveryError::Launch {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DiscoveryError::ScanFailed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let hosts = parse_scan(&String::from_utf8_lossy(&output.stdout));
        let matched = filter_by_vendor(&hosts, &self.vendor_signature);

        tracing::info!(
            scanned = hosts.len(),
            matched = matched.len(),
            "Discovery finished"
        );

        Ok(matched)
    }
}

/// One host from a ping scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedHost {
    pub address: String,
    pub mac: Option<String>,
    pub vendor: Option<String>,
}

/// Parse `nmap -sn` normal output into hosts, in report order
pub fn parse_scan(output: &str) -> Vec<ScannedHost> {
    static REPORT_RE: OnceLock<Regex> = OnceLock::new();
    static MAC_RE: OnceLock<Regex> = OnceLock::new();

    let report_re = REPORT_RE.get_or_init(|| {
        Regex::new(r"^Nmap scan report for (?:\S+ \(([^)]+)\)|(\S+))\s*$").expect("Invalid regex pattern")
    });
    let mac_re = MAC_RE.get_or_init(|| {
        Regex::new(r"^MAC Address: ([0-9A-Fa-f:]{17})(?: \((.*)\))?\s*$").expect("Invalid regex pattern")
    });

    let mut hosts: Vec<ScannedHost> = Vec::new();

    for line in output.lines().map(str::trim) {
        if let Some(caps) = report_re.captures(line) {
            if let Some(addr) = caps.get(1).or_else(|| caps.get(2)) {
                hosts.push(ScannedHost {
                    address: addr.as_str().to_string(),
                    mac: None,
                    vendor: None,
                });
            }
        } else if let Some(caps) = mac_re.captures(line) {
            if let Some(host) = hosts.last_mut() {
                host.mac = caps.get(1).map(|m| m.as_str().to_string());
                host.vendor = caps
                    .get(2)
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|v| !v.is_empty() && v != "Unknown");
            }
        }
    }

    hosts
}

/// Keep hosts whose vendor string occurs in `signature`
///
/// Hosts without a hardware address (the scanning machine itself, or hosts
/// behind a router) cannot be attributed to a vendor and are skipped.
pub fn filter_by_vendor(hosts: &[ScannedHost], signature: &str) -> Vec<String> {
    dedup_preserving_order(
        hosts
            .iter()
            .filter(|h| {
                h.vendor
                    .as_deref()
                    .is_some_and(|vendor| signature.contains(vendor))
            })
            .map(|h| h.address.clone()),
    )
}

fn dedup_preserving_order(addresses: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    addresses.filter(|a| seen.insert(a.clone())).collect()
}

/// Build the provider a config asks for: fixed hosts when listed, a scan otherwise
pub fn provider_for(config: &DiscoveryConfig) -> Box<dyn DiscoveryProvider> {
    if config.hosts.is_empty() {
        Box::new(NmapDiscovery::new(config))
    } else {
        Box::new(StaticDiscovery::new(config.hosts.clone()))
    }
}
