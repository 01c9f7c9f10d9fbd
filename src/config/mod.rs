//! Configuration management for pifleet
//!
//! All tunables of a capture run live in one immutable [`Config`] that is
//! built once at startup (defaults, a TOML file, then `PIFLEET_*` environment
//! overrides), validated, and handed to the registry and orchestrator by
//! reference.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::registry::DeviceId;
use crate::transport::Credentials;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device discovery
    pub discovery: DiscoveryConfig,

    /// Pre-shared login for every device
    pub credentials: CredentialsConfig,

    /// Remote and local storage layout
    pub storage: StorageConfig,

    /// Capture process and trigger timing
    pub capture: CaptureConfig,

    /// Per-phase timeouts and connection retries
    pub timeouts: TimeoutConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Subnet handed to the network scanner
    pub subnet: String,

    /// Vendor string a MAC address must belong to
    pub vendor_signature: String,

    /// Scanner executable
    pub nmap_path: String,

    /// Run the scanner through sudo (MAC vendors need raw sockets)
    pub use_sudo: bool,

    /// Fixed device addresses; when non-empty the scan is skipped
    pub hosts: Vec<String>,
}

/// Credentials configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub username: String,

    /// Password login (requires `sshpass`); `None` uses key authentication
    pub password: Option<String>,

    pub port: u16,

    /// Private key passed to ssh with `-i`
    pub identity_file: Option<PathBuf>,
}

/// Storage layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Absolute directory on each device under which run directories live
    pub remote_base: String,

    /// Local directory collected images are copied into
    pub local_output: PathBuf,

    /// Remote filename prefix
    pub file_prefix: String,

    /// Image file extension
    pub file_extension: String,
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture executable on the device
    pub executable: String,

    /// JPEG quality (1-100)
    pub jpeg_quality: u8,

    /// Trigger rounds per run
    pub images_per_session: u32,

    /// Pause after spawning capture processes, in milliseconds
    pub settle_interval_ms: u64,

    /// Pause between trigger rounds, in milliseconds
    pub trigger_interval_ms: u64,

    /// Abort the run when any device fails to start its capture process
    pub strict: bool,
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_secs: u64,
    pub command_secs: u64,
    pub termination_secs: u64,
    pub collection_secs: u64,

    /// Limit for copying one file back from a device
    pub transfer_secs: u64,

    /// Connection attempts per device (1 = no retry)
    pub connect_attempts: u32,

    /// Base backoff between connection attempts, in milliseconds
    pub retry_base_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            subnet: String::from("192.168.66.0/24"),
            vendor_signature: String::from("Raspberry Pi Foundation"),
            nmap_path: String::from("nmap"),
            use_sudo: true,
            hosts: Vec::new(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            username: String::from("pi"),
            password: Some(String::from("raspberry")),
            port: 22,
            identity_file: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            remote_base: String::from("/tmp"),
            local_output: PathBuf::from("./captures"),
            file_prefix: String::from("capture"),
            file_extension: String::from("jpg"),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            executable: String::from("raspistill"),
            jpeg_quality: 99,
            images_per_session: 9,
            settle_interval_ms: 1000,
            trigger_interval_ms: 1000,
            strict: false,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            command_secs: 30,
            termination_secs: 15,
            collection_secs: 120,
            transfer_secs: 60,
            connect_attempts: 2,
            retry_base_delay_ms: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults with `PIFLEET_*` environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `PIFLEET_*` environment overrides on top of the current values
    pub fn apply_env(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            var(name).and_then(|v| v.parse().ok())
        }

        if let Some(subnet) = var("PIFLEET_SUBNET") {
            self.discovery.subnet = subnet;
        }
        if let Some(hosts) = var("PIFLEET_HOSTS") {
            self.discovery.hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(username) = var("PIFLEET_USERNAME") {
            self.credentials.username = username;
        }
        if let Some(password) = var("PIFLEET_PASSWORD") {
            self.credentials.password = Some(password);
        }
        if let Some(path) = var("PIFLEET_IDENTITY_FILE") {
            self.credentials.identity_file = Some(PathBuf::from(path));
        }
        if let Some(dir) = var("PIFLEET_OUTPUT_DIR") {
            self.storage.local_output = PathBuf::from(dir);
        }
        if let Some(images) = parsed("PIFLEET_IMAGES") {
            self.capture.images_per_session = images;
        }
        if let Some(quality) = parsed("PIFLEET_JPEG_QUALITY") {
            self.capture.jpeg_quality = quality;
        }
        if let Some(level) = var("PIFLEET_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("PIFLEET_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.images_per_session == 0 {
            return Err(ConfigError::invalid(
                "capture.images_per_session",
                "must be at least 1",
            ));
        }

        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(ConfigError::invalid(
                "capture.jpeg_quality",
                format!("{} is outside 1-100", self.capture.jpeg_quality),
            ));
        }

        if self.capture.executable.trim().is_empty() {
            return Err(ConfigError::invalid("capture.executable", "must not be empty"));
        }

        if self.storage.file_prefix.is_empty() || self.storage.file_prefix.contains('/') {
            return Err(ConfigError::invalid(
                "storage.file_prefix",
                "must be non-empty and contain no '/'",
            ));
        }

        if !self.storage.remote_base.starts_with('/') {
            return Err(ConfigError::invalid(
                "storage.remote_base",
                "must be an absolute path",
            ));
        }

        if self.credentials.username.is_empty() {
            return Err(ConfigError::invalid("credentials.username", "must not be empty"));
        }

        let t = &self.timeouts;
        if t.connect_secs == 0
            || t.command_secs == 0
            || t.termination_secs == 0
            || t.collection_secs == 0
            || t.transfer_secs == 0
        {
            return Err(ConfigError::invalid("timeouts", "timeouts must be greater than 0"));
        }

        if t.connect_attempts == 0 {
            return Err(ConfigError::invalid(
                "timeouts.connect_attempts",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
            port: self.credentials.port,
            identity_file: self.credentials.identity_file.clone(),
        }
    }

    /// Remote directory holding one run's images, e.g. `/tmp/studio/`
    #[must_use]
    pub fn remote_session_dir(&self, session: &str) -> String {
        format!("{}/{}", self.storage.remote_base.trim_end_matches('/'), session)
    }

    /// Output filename template handed to the capture executable
    #[must_use]
    pub fn remote_file_template(&self, device: DeviceId, session: &str) -> String {
        format!(
            "{}/{}_{}_%d.{}",
            self.remote_session_dir(session),
            self.storage.file_prefix,
            device,
            self.storage.file_extension
        )
    }

    /// Long-running capture command: USR1 takes a frame, USR2 shuts it down
    #[must_use]
    pub fn capture_command(&self, device: DeviceId, session: &str) -> Vec<String> {
        vec![
            self.capture.executable.clone(),
            "-o".to_string(),
            self.remote_file_template(device, session),
            "-dt".to_string(),
            "-t".to_string(),
            "0".to_string(),
            "-q".to_string(),
            self.capture.jpeg_quality.to_string(),
            "-s".to_string(),
        ]
    }

    /// Local directory a run's images are collected into
    #[must_use]
    pub fn local_session_dir(&self, session: &str) -> PathBuf {
        self.storage.local_output.join(session)
    }

    #[must_use]
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.capture.settle_interval_ms)
    }

    #[must_use]
    pub fn trigger_interval(&self) -> Duration {
        Duration::from_millis(self.capture.trigger_interval_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.command_secs)
    }

    /// Per-device budget for Preparing: killall, rm and mkdir, one command timeout each
    #[must_use]
    pub fn prepare_timeout(&self) -> Duration {
        self.command_timeout() * 3 + Duration::from_secs(1)
    }

    #[must_use]
    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.termination_secs)
    }

    #[must_use]
    pub fn collection_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.collection_secs)
    }

    #[must_use]
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.transfer_secs)
    }
}

/// Check that a session name is safe to use as a remote directory name
///
/// The directory is removed with `rm -rf` during preparation, so only a
/// conservative character set is accepted.
pub fn validate_session_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(ConfigError::invalid("session", "must be a non-empty name"));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(ConfigError::invalid(
            "session",
            format!("character {c:?} is not allowed"),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.images_per_session, 9);
        assert_eq!(config.credentials.username, "pi");
    }

    #[test]
    fn test_invalid_images_per_session() {
        let mut config = Config::default();
        config.capture.images_per_session = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_quality() {
        let mut config = Config::default();
        config.capture.jpeg_quality = 0;
        assert!(config.validate().is_err());
        config.capture.jpeg_quality = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relative_remote_base_rejected() {
        let mut config = Config::default();
        config.storage.remote_base = "tmp".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_capture_command() {
        let config = Config::default();
        let cmd = config.capture_command(DeviceId(2), "studio");
        assert_eq!(
            cmd,
            vec![
                "raspistill",
                "-o",
                "/tmp/studio/capture_device2_%d.jpg",
                "-dt",
                "-t",
                "0",
                "-q",
                "99",
                "-s"
            ]
        );
    }

    #[test]
    fn test_remote_session_dir_trims_slash() {
        let mut config = Config::default();
        config.storage.remote_base = "/home/pi/".to_string();
        assert_eq!(config.remote_session_dir("a"), "/home/pi/a");
    }

    #[test]
    fn test_prepare_budget_covers_every_step() {
        let mut config = Config::default();
        config.timeouts.command_secs = 2;
        assert!(config.prepare_timeout() > config.command_timeout() * 3);

        config.timeouts.transfer_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [capture]
            images_per_session = 3

            [discovery]
            hosts = ["10.0.0.5", "10.0.0.6"]
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.images_per_session, 3);
        assert_eq!(config.capture.jpeg_quality, 99);
        assert_eq!(config.discovery.hosts.len(), 2);
        assert_eq!(config.timeouts.connect_attempts, 2);
    }

    #[test]
    fn test_session_name_validation() {
        assert!(validate_session_name("test").is_ok());
        assert!(validate_session_name("shoot-2024_01.a").is_ok());
        assert!(validate_session_name("").is_err());
        assert!(validate_session_name("..").is_err());
        assert!(validate_session_name("a/b").is_err());
        assert!(validate_session_name("a b").is_err());
        assert!(validate_session_name("$(reboot)").is_err());
    }

    #[test]
    fn test_interval_conversion() {
        let config = Config::default();
        assert_eq!(config.settle_interval(), Duration::from_secs(1));
        assert_eq!(config.trigger_interval(), Duration::from_secs(1));
        assert_eq!(config.termination_timeout(), Duration::from_secs(15));
    }
}
