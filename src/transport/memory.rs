//! In-process simulated fleet
//!
//! [`MemoryTransport`] models a set of devices with a tiny file system and a
//! capture process that honours the same signal contract as the real camera
//! tool: USR1 writes the next frame into the configured output template, USR2
//! makes it exit. Per-device [`DeviceBehavior`] injects the failures a real
//! fleet produces (unreachable units, full disks, hung processes, broken
//! transfers) so the orchestrator can be exercised end to end without
//! hardware.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    CommandOutput, Credentials, RemoteConnection, RemoteProcess, RemoteTransport, SignalKind,
    TerminationStatus, TransportError, TransportResult,
};

/// Poll period used while waiting for a simulated process to exit
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Faults injected into one simulated device
#[derive(Debug, Clone, Default)]
pub struct DeviceBehavior {
    /// `open` fails
    pub refuse_connection: bool,
    /// Creating the run directory fails
    pub fail_mkdir: bool,
    /// Starting the capture process fails
    pub fail_spawn: bool,
    /// The capture process ignores USR2 and never exits on its own
    pub hang_on_shutdown: bool,
    /// The capture process never writes frames
    pub drop_frames: bool,
    /// File names whose transfer fails
    pub failing_copies: HashSet<String>,
    /// File names whose transfer never completes
    pub stalled_copies: HashSet<String>,
    /// Commands (by program name) that take this long before running
    pub slow_commands: HashMap<String, Duration>,
}

impl DeviceBehavior {
    pub fn unreachable() -> Self {
        Self {
            refuse_connection: true,
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang_on_shutdown: true,
            ..Default::default()
        }
    }

    pub fn failing_mkdir() -> Self {
        Self {
            fail_mkdir: true,
            ..Default::default()
        }
    }

    pub fn with_failing_copy(mut self, file_name: impl Into<String>) -> Self {
        self.failing_copies.insert(file_name.into());
        self
    }

    pub fn with_stalled_copy(mut self, file_name: impl Into<String>) -> Self {
        self.stalled_copies.insert(file_name.into());
        self
    }

    pub fn with_slow_command(mut self, program: impl Into<String>, delay: Duration) -> Self {
        self.slow_commands.insert(program.into(), delay);
        self
    }
}

#[derive(Debug)]
struct SimProcess {
    pid: u32,
    template: Option<String>,
    next_frame: u32,
    exited: bool,
}

#[derive(Debug, Default)]
struct SimDevice {
    behavior: DeviceBehavior,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    process: Option<SimProcess>,
    next_pid: u32,
    connections: u32,
    commands: Vec<Vec<String>>,
    signals: Vec<SignalKind>,
}

impl SimDevice {
    fn remove_tree(&mut self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.dirs.retain(|d| d != path && !d.starts_with(&prefix));
        self.files.retain(|f, _| !f.starts_with(&prefix));
    }

    fn exec(&mut self, argv: &[String]) -> CommandOutput {
        let fail = |code: i32, stderr: String| CommandOutput {
            status: Some(code),
            stdout: String::new(),
            stderr,
        };
        let ok = CommandOutput {
            status: Some(0),
            ..Default::default()
        };

        match argv.first().map(String::as_str) {
            Some("killall") => {
                let target = argv.last().cloned().unwrap_or_default();
                match self.process.as_mut() {
                    Some(p) if !p.exited => {
                        p.exited = true;
                        ok
                    }
                    _ => fail(1, format!("{target}: no process found\n")),
                }
            }
            Some("rm") => {
                if let Some(path) = argv.last() {
                    self.remove_tree(path);
                }
                ok
            }
            Some("mkdir") => {
                let Some(path) = argv.last() else {
                    return fail(1, "mkdir: missing operand\n".to_string());
                };
                if self.behavior.fail_mkdir {
                    return fail(1, format!("mkdir: cannot create directory '{path}': No space left on device\n"));
                }
                if self.dirs.contains(path) {
                    return fail(1, format!("mkdir: cannot create directory '{path}': File exists\n"));
                }
                self.dirs.insert(path.clone());
                ok
            }
            Some(other) => fail(127, format!("sh: {other}: not found\n")),
            None => ok,
        }
    }

    fn deliver(&mut self, address: &str, kind: SignalKind) {
        self.signals.push(kind);
        let drop_frames = self.behavior.drop_frames;
        let hang = self.behavior.hang_on_shutdown;

        let Some(process) = self.process.as_mut().filter(|p| !p.exited) else {
            return;
        };

        match kind {
            SignalKind::Capture => {
                if drop_frames {
                    return;
                }
                if let Some(template) = &process.template {
                    let path = template.replace("%d", &process.next_frame.to_string());
                    let content = format!("frame {} from {address}", process.next_frame).into_bytes();
                    process.next_frame += 1;
                    self.files.insert(path, content);
                }
            }
            SignalKind::Shutdown => {
                if !hang {
                    process.exited = true;
                }
            }
            SignalKind::Kill => process.exited = true,
        }
    }
}

/// A simulated fleet reachable through the [`RemoteTransport`] traits
#[derive(Clone, Default)]
pub struct MemoryTransport {
    devices: Arc<Mutex<HashMap<String, SimDevice>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` well-behaved devices at `10.0.0.1`, `10.0.0.2`, ...
    pub fn fleet(count: usize) -> (Self, Vec<String>) {
        let transport = Self::new();
        let addresses: Vec<String> = (1..=count).map(|i| format!("10.0.0.{i}")).collect();
        for address in &addresses {
            transport.add_device(address, DeviceBehavior::default());
        }
        (transport, addresses)
    }

    pub fn add_device(&self, address: &str, behavior: DeviceBehavior) {
        self.lock().insert(
            address.to_string(),
            SimDevice {
                behavior,
                next_pid: 1000,
                ..Default::default()
            },
        );
    }

    /// Replace the injected faults of an existing device
    pub fn set_behavior(&self, address: &str, behavior: DeviceBehavior) {
        if let Some(device) = self.lock().get_mut(address) {
            device.behavior = behavior;
        }
    }

    /// Signals delivered to a device so far, in order
    pub fn signals(&self, address: &str) -> Vec<SignalKind> {
        self.with_device(address, |d| d.signals.clone()).unwrap_or_default()
    }

    /// Commands run on a device so far, in order
    pub fn commands(&self, address: &str) -> Vec<Vec<String>> {
        self.with_device(address, |d| d.commands.clone()).unwrap_or_default()
    }

    /// Number of times a device was connected to
    pub fn connections(&self, address: &str) -> u32 {
        self.with_device(address, |d| d.connections).unwrap_or(0)
    }

    pub fn dir_exists(&self, address: &str, path: &str) -> bool {
        self.with_device(address, |d| d.dirs.contains(path)).unwrap_or(false)
    }

    /// Names of the files directly inside `dir`
    pub fn files_in(&self, address: &str, dir: &str) -> Vec<String> {
        self.with_device(address, |d| list(d, dir)).unwrap_or_default()
    }

    /// Place a file on a device (creating its parent directory)
    pub fn put_file(&self, address: &str, path: &str, content: &[u8]) {
        if let Some(device) = self.lock().get_mut(address) {
            if let Some((parent, _)) = path.rsplit_once('/') {
                device.dirs.insert(parent.to_string());
            }
            device.files.insert(path.to_string(), content.to_vec());
        }
    }

    /// Whether a capture process is currently running on the device
    pub fn process_running(&self, address: &str) -> bool {
        self.with_device(address, |d| d.process.as_ref().is_some_and(|p| !p.exited))
            .unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SimDevice>> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_device<T>(&self, address: &str, f: impl FnOnce(&mut SimDevice) -> T) -> Option<T> {
        self.lock().get_mut(address).map(f)
    }
}

fn list(device: &SimDevice, dir: &str) -> Vec<String> {
    let prefix = format!("{}/", dir.trim_end_matches('/'));
    device
        .files
        .keys()
        .filter_map(|path| path.strip_prefix(&prefix))
        .filter(|name| !name.contains('/'))
        .map(String::from)
        .collect()
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    async fn open(
        &self,
        address: &str,
        _credentials: &Credentials,
    ) -> TransportResult<Box<dyn RemoteConnection>> {
        let refused = self
            .with_device(address, |d| {
                d.connections += 1;
                d.behavior.refuse_connection
            })
            .unwrap_or(true);

        if refused {
            return Err(TransportError::Connect {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        Ok(Box::new(MemoryConnection {
            transport: self.clone(),
            address: address.to_string(),
        }))
    }
}

/// Channel to one simulated device
pub struct MemoryConnection {
    transport: MemoryTransport,
    address: String,
}

impl MemoryConnection {
    fn device<T>(&self, f: impl FnOnce(&mut SimDevice) -> T) -> TransportResult<T> {
        self.transport
            .with_device(&self.address, f)
            .ok_or_else(|| TransportError::Disconnected(self.address.clone()))
    }
}

#[async_trait]
impl RemoteConnection for MemoryConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn run(&self, argv: &[String]) -> TransportResult<CommandOutput> {
        let delay = self.device(|d| {
            argv.first()
                .and_then(|program| d.behavior.slow_commands.get(program))
                .copied()
        })?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.device(|d| {
            d.commands.push(argv.to_vec());
            d.exec(argv)
        })
    }

    async fn spawn(&self, argv: &[String]) -> TransportResult<Box<dyn RemoteProcess>> {
        let pid = self.device(|d| {
            d.commands.push(argv.to_vec());
            if d.behavior.fail_spawn {
                return Err(TransportError::Spawn {
                    command: argv.join(" "),
                    reason: "camera not detected".to_string(),
                });
            }

            let template = argv
                .iter()
                .position(|a| a == "-o")
                .and_then(|i| argv.get(i + 1))
                .cloned();

            d.next_pid += 1;
            d.process = Some(SimProcess {
                pid: d.next_pid,
                template,
                next_frame: 1,
                exited: false,
            });
            Ok(d.next_pid)
        })??;

        Ok(Box::new(MemoryProcess {
            transport: self.transport.clone(),
            address: self.address.clone(),
            pid,
        }))
    }

    async fn list_directory(&self, path: &str) -> TransportResult<Vec<String>> {
        self.device(|d| {
            if d.dirs.contains(path) {
                Ok(list(d, path))
            } else {
                Err(TransportError::NotFound(path.to_string()))
            }
        })?
    }

    async fn stream_copy(&self, remote: &str, local: &Path) -> TransportResult<u64> {
        let name = remote.rsplit('/').next().unwrap_or(remote);
        if self.device(|d| d.behavior.stalled_copies.contains(name))? {
            return std::future::pending().await;
        }

        let content = self.device(|d| {
            if d.behavior.failing_copies.contains(name) {
                return Err(TransportError::Disconnected(self.address.clone()));
            }
            d.files
                .get(remote)
                .cloned()
                .ok_or_else(|| TransportError::NotFound(remote.to_string()))
        })??;

        tokio::fs::write(local, &content).await?;
        Ok(content.len() as u64)
    }
}

/// Simulated capture process
pub struct MemoryProcess {
    transport: MemoryTransport,
    address: String,
    pid: u32,
}

impl MemoryProcess {
    fn exited(&self) -> bool {
        self.transport
            .with_device(&self.address, |d| {
                d.process
                    .as_ref()
                    .filter(|p| p.pid == self.pid)
                    .map_or(true, |p| p.exited)
            })
            .unwrap_or(true)
    }
}

#[async_trait]
impl RemoteProcess for MemoryProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn signal(&self, kind: SignalKind) {
        let address = self.address.clone();
        self.transport.with_device(&self.address, |d| d.deliver(&address, kind));
    }

    async fn wait(&mut self, timeout: Duration) -> TransportResult<TerminationStatus> {
        let poll = async {
            while !self.exited() {
                tokio::time::sleep(WAIT_POLL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map(|_| TerminationStatus { code: Some(0) })
            .map_err(|_| TransportError::timeout(format!("waiting for pid {}", self.pid), timeout))
    }
}
