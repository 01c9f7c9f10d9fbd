//! Remote session transport
//!
//! The registry and orchestrator only talk to devices through the traits in
//! this module:
//!
//! - [`RemoteTransport`] opens a control channel to one device
//! - [`RemoteConnection`] runs commands, spawns background processes, lists
//!   directories and streams files off the device
//! - [`RemoteProcess`] is a spawned background process that can be signalled
//!   and awaited
//!
//! Two implementations ship with the crate: [`ssh::SshTransport`] drives the
//! system OpenSSH client, and [`memory::MemoryTransport`] simulates a fleet
//! in-process (used by the test-suite and the `simulate` command).

pub mod memory;
pub mod ssh;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub use memory::{DeviceBehavior, MemoryTransport};
pub use ssh::SshTransport;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Channel could not be opened
    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    /// Command ran but exited unsuccessfully
    #[error("Command `{command}` failed (status {status:?}): {stderr}")]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// Background process could not be started
    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Remote path does not exist
    #[error("Remote path not found: {0}")]
    NotFound(String),

    /// Channel was lost mid-operation
    #[error("Connection to {0} lost")]
    Disconnected(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether retrying the same operation could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout { .. } | Self::Disconnected(_) | Self::Io(_)
        )
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

/// Pre-shared login used for every device in a fleet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
}

/// Signals understood by the capture process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Take one frame (SIGUSR1)
    Capture,
    /// Finish and exit (SIGUSR2)
    Shutdown,
    /// Forced termination (SIGKILL)
    Kill,
}

impl SignalKind {
    /// Signal name as accepted by `kill -s`
    pub fn as_signal_name(&self) -> &'static str {
        match self {
            Self::Capture => "USR1",
            Self::Shutdown => "USR2",
            Self::Kill => "KILL",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Shutdown => "shutdown",
            Self::Kill => "kill",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exit status and output of a blocking remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the command was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into [`TransportError::Command`]
    pub fn ensure_success(self, argv: &[String]) -> TransportResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(TransportError::Command {
                command: argv.join(" "),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// How a background process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationStatus {
    /// Exit code; `None` when terminated by a signal
    pub code: Option<i32>,
}

impl TerminationStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Opens control channels to devices
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Open a channel to `address` using the fleet's credentials
    async fn open(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> TransportResult<Box<dyn RemoteConnection>>;
}

/// One live control channel to a device
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Network address this channel is connected to
    fn address(&self) -> &str;

    /// Run a command to completion. A non-zero exit is not an error here.
    async fn run(&self, argv: &[String]) -> TransportResult<CommandOutput>;

    /// Start a long-lived background process
    async fn spawn(&self, argv: &[String]) -> TransportResult<Box<dyn RemoteProcess>>;

    /// Entry names of a remote directory, sorted
    async fn list_directory(&self, path: &str) -> TransportResult<Vec<String>>;

    /// Stream a remote file into `local`, returning the number of bytes copied
    async fn stream_copy(&self, remote: &str, local: &Path) -> TransportResult<u64>;

    /// Tear the channel down
    async fn close(&self) {}
}

/// Handle to a background process started with [`RemoteConnection::spawn`]
#[async_trait]
pub trait RemoteProcess: Send + Sync {
    /// Remote process id, when the transport knows it
    fn pid(&self) -> Option<u32>;

    /// Deliver a signal. Fire-and-forget: there is no acknowledgement and
    /// delivery failures are only logged.
    async fn signal(&self, kind: SignalKind);

    /// Wait for the process to exit, giving up after `timeout`
    async fn wait(&mut self, timeout: Duration) -> TransportResult<TerminationStatus>;
}

/// Quote one argument for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%' | '=' | ':' | ','))
    {
        return arg.to_string();
    }

    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Quote and join an argument vector into one shell command line
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build an owned argument vector from string literals
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}
