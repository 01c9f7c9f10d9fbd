//! Session registry for a fleet of devices
//!
//! The registry owns one [`RemoteSession`] per connected device, keyed by a
//! [`DeviceId`] assigned in discovery order, and runs operations across all
//! of them concurrently with per-device fault isolation.
//!
//! Devices move through three buckets:
//!
//! - **live**: connected and taking part in the current run
//! - **excluded**: connected, but dropped from the rest of this run after a
//!   fault (still in the registry, so a later run can retry it)
//! - **failed**: never connected; recorded with its connection error

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::config::Config;
use crate::error::DeviceFault;
use crate::transport::{RemoteConnection, RemoteProcess, RemoteTransport};
use crate::utils::retry::{with_retry, RetryConfig};

// ============================================================================
// Device Identity
// ============================================================================

/// Stable per-run device identity, displayed as `device<N>`
///
/// Assigned sequentially in discovery order at connection time, whether or
/// not the connection succeeds, and never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device{}", self.0)
    }
}

// ============================================================================
// Remote Session
// ============================================================================

/// One live control channel to one device
pub struct RemoteSession {
    id: DeviceId,
    connection: Box<dyn RemoteConnection>,
    process: Option<Box<dyn RemoteProcess>>,
}

impl RemoteSession {
    pub fn new(id: DeviceId, connection: Box<dyn RemoteConnection>) -> Self {
        Self {
            id,
            connection,
            process: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn address(&self) -> &str {
        self.connection.address()
    }

    pub fn connection(&self) -> &dyn RemoteConnection {
        self.connection.as_ref()
    }

    /// The active background capture process, if any
    pub fn process(&self) -> Option<&dyn RemoteProcess> {
        self.process.as_deref()
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    /// Attach a freshly spawned background process
    ///
    /// A session holds at most one; attaching a second one hands it back.
    pub fn attach_process(
        &mut self,
        process: Box<dyn RemoteProcess>,
    ) -> Result<(), Box<dyn RemoteProcess>> {
        if self.process.is_some() {
            return Err(process);
        }
        self.process = Some(process);
        Ok(())
    }

    /// Detach the background process so it can be awaited
    pub fn take_process(&mut self) -> Option<Box<dyn RemoteProcess>> {
        self.process.take()
    }
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("process", &self.process.as_ref().and_then(|p| p.pid()))
            .finish()
    }
}

// ============================================================================
// Fan-out
// ============================================================================

/// What a fan-out does when one device fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Stop at the first failure; devices still in flight are reported as
    /// [`DeviceFault::Cancelled`]
    AbortOnFirstError,

    /// Run every device to completion and collect all failures
    #[default]
    ContinueCollectingErrors,
}

/// Settings for one [`SessionRegistry::for_each`] call
#[derive(Debug, Clone, Copy)]
pub struct FanOut {
    /// Name of the lifecycle step, used in faults and logs
    pub phase: &'static str,
    pub policy: FaultPolicy,
    /// Deadline per device; a device exceeding it gets [`DeviceFault::PhaseTimeout`]
    pub timeout: Option<Duration>,
}

impl FanOut {
    /// Collect every device's result
    pub fn best_effort(phase: &'static str, timeout: Duration) -> Self {
        Self {
            phase,
            policy: FaultPolicy::ContinueCollectingErrors,
            timeout: Some(timeout),
        }
    }

    /// Stop at the first failing device
    pub fn critical(phase: &'static str, timeout: Duration) -> Self {
        Self {
            phase,
            policy: FaultPolicy::AbortOnFirstError,
            timeout: Some(timeout),
        }
    }

    pub fn with_policy(mut self, policy: FaultPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Per-device outcome of a fan-out, ordered by device
pub type FanOutResults<T> = BTreeMap<DeviceId, Result<T, DeviceFault>>;

// ============================================================================
// Session Registry
// ============================================================================

/// A device whose connection attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFailure {
    pub address: String,
    pub fault: DeviceFault,
}

/// Registry of the remote sessions of one fleet run
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<DeviceId, RemoteSession>,
    failures: BTreeMap<DeviceId, ConnectionFailure>,
    excluded: BTreeMap<DeviceId, DeviceFault>,
    next_id: usize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session to every address concurrently
    ///
    /// Identities are assigned in address order. A device that cannot be
    /// reached is recorded as a connection failure and left out of every
    /// fan-out; the remaining devices are unaffected.
    pub async fn connect(
        transport: &dyn RemoteTransport,
        addresses: &[String],
        config: &Config,
    ) -> Self {
        let mut registry = Self::new();
        let credentials = config.credentials();
        let retry = RetryConfig::for_connect(&config.timeouts);
        let timeout = config.connect_timeout();

        let attempts = addresses.iter().map(|address| {
            let credentials = &credentials;
            let retry = &retry;
            async move {
                tracing::info!(address = %address, "Connecting");
                let result = with_retry(retry, || async move {
                    match tokio::time::timeout(timeout, transport.open(address, credentials)).await {
                        Ok(result) => result.map_err(DeviceFault::connection),
                        Err(_) => Err(DeviceFault::connection(format!(
                            "no response within {timeout:?}"
                        ))),
                    }
                })
                .await;
                (address.clone(), result)
            }
        });

        for (address, result) in futures::future::join_all(attempts).await {
            registry.insert(address, result);
        }

        tracing::info!(
            connected = registry.sessions.len(),
            failed = registry.failures.len(),
            "Connection phase finished"
        );

        registry
    }

    /// Record the outcome of one connection attempt under the next identity
    pub fn insert(
        &mut self,
        address: String,
        result: Result<Box<dyn RemoteConnection>, DeviceFault>,
    ) -> DeviceId {
        let id = DeviceId(self.next_id);
        self.next_id += 1;

        match result {
            Ok(connection) => {
                tracing::info!(device = %id, address = %address, "Connected");
                self.sessions.insert(id, RemoteSession::new(id, connection));
            }
            Err(fault) => {
                tracing::warn!(device = %id, address = %address, error = %fault, "Connection failed");
                self.failures.insert(id, ConnectionFailure { address, fault });
            }
        }

        id
    }

    /// Apply `operation` to every live session concurrently
    ///
    /// Phases are strictly sequential: this returns only once every device
    /// has resolved (or, under [`FaultPolicy::AbortOnFirstError`], once the
    /// first failure is seen).
    ///
    /// `operation` is called once per session and must return a boxed future
    /// borrowing only the session; clone anything else it needs into the
    /// future.
    pub async fn for_each<T, F>(&mut self, fan_out: FanOut, operation: F) -> FanOutResults<T>
    where
        T: Send,
        F: for<'a> Fn(&'a mut RemoteSession) -> BoxFuture<'a, Result<T, DeviceFault>>,
    {
        let FanOut {
            phase,
            policy,
            timeout,
        } = fan_out;
        let excluded = &self.excluded;

        let mut pending: Vec<DeviceId> = Vec::new();
        let mut tasks = FuturesUnordered::new();

        for (id, session) in self
            .sessions
            .iter_mut()
            .filter(|(id, _)| !excluded.contains_key(id))
        {
            let id = *id;
            pending.push(id);
            let fut = operation(session);
            tasks.push(async move {
                let result = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(DeviceFault::PhaseTimeout {
                            phase: phase.to_string(),
                            timeout_ms: limit.as_millis() as u64,
                        }),
                    },
                    None => fut.await,
                };
                (id, result)
            });
        }

        let mut results = FanOutResults::new();

        while let Some((id, result)) = tasks.next().await {
            let failed = result.is_err();
            if let Err(fault) = &result {
                tracing::warn!(device = %id, phase, error = %fault, "Device operation failed");
            }
            results.insert(id, result);

            if failed && policy == FaultPolicy::AbortOnFirstError {
                break;
            }
        }

        drop(tasks);

        for id in pending {
            results.entry(id).or_insert_with(|| {
                Err(DeviceFault::Cancelled {
                    phase: phase.to_string(),
                })
            });
        }

        results
    }

    /// Drop a device from the rest of the current run
    ///
    /// The session stays registered so a later run can use it again. The
    /// first fault recorded for a device is kept.
    pub fn exclude(&mut self, id: DeviceId, fault: DeviceFault) {
        if self.sessions.contains_key(&id) && !self.excluded.contains_key(&id) {
            tracing::warn!(device = %id, reason = %fault, "Excluding device from run");
            self.excluded.insert(id, fault);
        }
    }

    /// Make every connected device live again for a new run
    pub fn reset_exclusions(&mut self) {
        self.excluded.clear();
    }

    /// Evict a device whose unit has become permanently unresponsive
    ///
    /// Idempotent: removing an unknown or already removed device is a no-op.
    pub async fn remove(&mut self, id: DeviceId) -> bool {
        self.excluded.remove(&id);
        self.failures.remove(&id);

        match self.sessions.remove(&id) {
            Some(session) => {
                session.connection.close().await;
                tracing::info!(device = %id, "Removed device from registry");
                true
            }
            None => false,
        }
    }

    /// Close every connection; the registry is empty afterwards
    pub async fn close_all(&mut self) {
        let sessions = std::mem::take(&mut self.sessions);
        futures::future::join_all(sessions.values().map(|s| s.connection.close())).await;
        self.excluded.clear();
    }

    /// Devices taking part in the current run, in identity order
    pub fn live_ids(&self) -> Vec<DeviceId> {
        self.sessions
            .keys()
            .filter(|id| !self.excluded.contains_key(id))
            .copied()
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.sessions
            .keys()
            .filter(|id| !self.excluded.contains_key(id))
            .count()
    }

    /// No device left to drive
    pub fn is_exhausted(&self) -> bool {
        self.live_count() == 0
    }

    pub fn is_live(&self, id: DeviceId) -> bool {
        self.sessions.contains_key(&id) && !self.excluded.contains_key(&id)
    }

    pub fn session(&self, id: DeviceId) -> Option<&RemoteSession> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: DeviceId) -> Option<&mut RemoteSession> {
        self.sessions.get_mut(&id)
    }

    pub fn address(&self, id: DeviceId) -> Option<&str> {
        self.sessions
            .get(&id)
            .map(RemoteSession::address)
            .or_else(|| self.failures.get(&id).map(|f| f.address.as_str()))
    }

    pub fn connection_failures(&self) -> &BTreeMap<DeviceId, ConnectionFailure> {
        &self.failures
    }

    pub fn exclusions(&self) -> &BTreeMap<DeviceId, DeviceFault> {
        &self.excluded
    }

    /// Connected sessions (live or excluded)
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Every identity handed out so far, connected or not, in order
    pub fn all_ids(&self) -> Vec<DeviceId> {
        (0..self.next_id).map(DeviceId).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
