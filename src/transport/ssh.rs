//! Transport over the system OpenSSH client
//!
//! Every device gets one multiplexed master connection (`ControlMaster`), so
//! the individual commands, signal deliveries and file streams issued during a
//! run reuse the already-authenticated channel instead of paying a full
//! handshake each time. Password logins go through `sshpass -e`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{
    shell_join, shell_quote, CommandOutput, Credentials, RemoteConnection, RemoteProcess,
    RemoteTransport, SignalKind, TerminationStatus, TransportError, TransportResult,
};
use crate::config::Config;

/// ssh reserves exit status 255 for its own failures
const SSH_ERROR_STATUS: i32 = 255;

/// How long an idle master connection outlives its last client
const CONTROL_PERSIST_SECS: u64 = 300;

/// [`RemoteTransport`] backed by `ssh`
#[derive(Debug, Clone)]
pub struct SshTransport {
    control_dir: PathBuf,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            control_dir: std::env::temp_dir().join("pifleet-ssh"),
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
        }
    }

    /// Override where master-connection sockets are placed
    pub fn with_control_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.control_dir = dir.into();
        self
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn open(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> TransportResult<Box<dyn RemoteConnection>> {
        tokio::fs::create_dir_all(&self.control_dir).await?;

        let target = Arc::new(SshTarget {
            address: address.to_string(),
            credentials: credentials.clone(),
            control_dir: self.control_dir.clone(),
            connect_timeout: self.connect_timeout,
        });

        // Establishes the master connection as a side effect.
        let mut probe = target.remote_command("true");
        let output = tokio::time::timeout(self.connect_timeout + Duration::from_secs(5), probe.output())
            .await
            .map_err(|_| TransportError::Connect {
                address: address.to_string(),
                reason: format!("no response within {:?}", self.connect_timeout),
            })?
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: format!("failed to launch ssh: {e}"),
            })?;

        if !output.status.success() {
            return Err(TransportError::Connect {
                address: address.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(address = %address, "SSH master connection established");

        Ok(Box::new(SshConnection {
            target,
            command_timeout: self.command_timeout,
        }))
    }
}

/// Everything needed to build an ssh invocation for one device
#[derive(Debug)]
struct SshTarget {
    address: String,
    credentials: Credentials,
    control_dir: PathBuf,
    connect_timeout: Duration,
}

impl SshTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.credentials.username, self.address)
    }

    /// `ssh` (or `sshpass -e ssh`) with connection options, before the destination
    fn ssh_command(&self, extra: &[&str]) -> Command {
        let mut cmd = match &self.credentials.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            None => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };

        cmd.arg("-p")
            .arg(self.credentials.port.to_string())
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "ControlMaster=auto"])
            .arg("-o")
            .arg(format!("ControlPath={}/%C", self.control_dir.display()))
            .arg("-o")
            .arg(format!("ControlPersist={CONTROL_PERSIST_SECS}"))
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));

        if let Some(identity) = &self.credentials.identity_file {
            cmd.arg("-i").arg(identity);
        }

        cmd.args(extra);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// ssh invocation running `script` through the remote login shell
    fn remote_command(&self, script: &str) -> Command {
        let mut cmd = self.ssh_command(&[]);
        cmd.arg(self.destination()).arg("--").arg(script);
        cmd
    }
}

/// A live, multiplexed ssh channel to one device
pub struct SshConnection {
    target: Arc<SshTarget>,
    command_timeout: Duration,
}

impl SshConnection {
    async fn output(&self, script: &str, operation: &str) -> TransportResult<std::process::Output> {
        let mut cmd = self.target.remote_command(script);
        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| TransportError::timeout(operation, self.command_timeout))??;

        if output.status.code() == Some(SSH_ERROR_STATUS) {
            return Err(TransportError::Disconnected(self.target.address.clone()));
        }

        Ok(output)
    }
}

#[async_trait]
impl RemoteConnection for SshConnection {
    fn address(&self) -> &str {
        &self.target.address
    }

    async fn run(&self, argv: &[String]) -> TransportResult<CommandOutput> {
        let output = self.output(&shell_join(argv), &argv.join(" ")).await?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn(&self, argv: &[String]) -> TransportResult<Box<dyn RemoteProcess>> {
        let command = shell_join(argv);
        // The remote shell reports its pid, then becomes the capture process.
        let script = format!("echo $$; exec {command}");

        let mut child = self
            .target
            .remote_command(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TransportError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| TransportError::Spawn {
            command: command.clone(),
            reason: "stdout not captured".to_string(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let first = tokio::time::timeout(self.command_timeout, lines.next_line())
            .await
            .map_err(|_| TransportError::timeout("reading remote pid", self.command_timeout))??;

        let pid = first
            .as_deref()
            .and_then(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| TransportError::Spawn {
                command: command.clone(),
                reason: format!("expected pid, got {first:?}"),
            })?;

        // Keep draining output so a chatty process never blocks on a full pipe.
        let address = self.target.address.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(address = %address, pid, line = %line, "capture process output");
            }
        });

        debug!(address = %self.target.address, pid, "Spawned remote process");

        Ok(Box::new(SshProcess {
            target: Arc::clone(&self.target),
            pid,
            child,
        }))
    }

    async fn list_directory(&self, path: &str) -> TransportResult<Vec<String>> {
        let script = format!("ls -1A -- {}", shell_quote(path));
        let output = self.output(&script, "list directory").await?;

        if !output.status.success() {
            return Err(TransportError::NotFound(path.to_string()));
        }

        let mut names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn stream_copy(&self, remote: &str, local: &Path) -> TransportResult<u64> {
        let script = format!("cat -- {}", shell_quote(remote));
        let mut child = self
            .target
            .remote_command(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(TransportError::Disconnected(self.target.address.clone()));
        };
        let mut file = tokio::fs::File::create(local).await?;

        // stderr is drained alongside the copy so neither pipe can fill up
        let mut message = String::new();
        let (copied, _) = tokio::join!(
            tokio::io::copy(&mut stdout, &mut file),
            stderr.read_to_string(&mut message),
        );
        let status = child.wait().await?;

        match copied {
            Ok(bytes) if status.success() => Ok(bytes),
            Ok(_) => {
                let _ = tokio::fs::remove_file(local).await;
                if status.code() == Some(SSH_ERROR_STATUS) {
                    return Err(TransportError::Disconnected(self.target.address.clone()));
                }
                Err(copy_failure(remote, status.code(), &message))
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(local).await;
                Err(e.into())
            }
        }
    }

    async fn close(&self) {
        let mut cmd = self.target.ssh_command(&["-O", "exit"]);
        cmd.arg(self.target.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Err(e) = cmd.status().await {
            debug!(address = %self.target.address, error = %e, "Failed to close master connection");
        }
    }
}

fn copy_failure(remote: &str, status: Option<i32>, stderr: &str) -> TransportError {
    TransportError::Command {
        command: format!("cat {remote}"),
        status,
        stderr: stderr.trim().to_string(),
    }
}

/// A remote process started through [`SshConnection::spawn`]
pub struct SshProcess {
    target: Arc<SshTarget>,
    pid: u32,
    child: Child,
}

#[async_trait]
impl RemoteProcess for SshProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn signal(&self, kind: SignalKind) {
        let script = format!("kill -s {} {}", kind.as_signal_name(), self.pid);
        let mut cmd = self.target.remote_command(&script);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        match cmd.spawn() {
            Ok(mut child) => {
                let address = self.target.address.clone();
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) if !status.success() => {
                            debug!(address = %address, signal = %kind, ?status, "Signal delivery reported failure");
                        }
                        Err(e) => debug!(address = %address, signal = %kind, error = %e, "Signal delivery failed"),
                        Ok(_) => {}
                    }
                });
            }
            Err(e) => warn!(address = %self.target.address, signal = %kind, error = %e, "Could not dispatch signal"),
        }
    }

    async fn wait(&mut self, timeout: Duration) -> TransportResult<TerminationStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(TerminationStatus {
                code: status?.code(),
            }),
            Err(_) => Err(TransportError::timeout(
                format!("waiting for pid {} on {}", self.pid, self.target.address),
                timeout,
            )),
        }
    }
}
