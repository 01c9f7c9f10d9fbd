//! Capture orchestrator
//!
//! Drives one capture run across every live session of a [`SessionRegistry`]:
//!
//! 1. **Preparing**: stop any leftover capture process, recreate the run
//!    directory, start the capture process, wait the settle interval
//! 2. **Capturing**: `k` rounds of a fire-and-forget capture broadcast
//! 3. **Finalizing**: broadcast shutdown, then wait for each process with its
//!    own timeout
//! 4. **Collecting**: list the run directory on each device and stream every
//!    file into the local output directory
//!
//! Phases are strictly sequential and devices within a phase run
//! concurrently. A per-device fault is recorded against that device and,
//! depending on the fault, drops it from the remaining phases; the run only
//! aborts when no live device is left at a phase boundary.
//!
//! Capture signals carry no acknowledgement. A device that misses a signal
//! silently produces fewer frames, which shows up only as a shorter file
//! list at collection time. The per-round broadcast latency is recorded so
//! skew between devices can be estimated.

mod state;
mod summary;

pub use state::{
    CaptureRun, CollectedFile, DeviceRecord, DeviceStatus, FaultRecord, RunState,
};
pub use summary::{BroadcastStats, DeviceSummary, RunSummary};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{validate_session_name, Config};
use crate::discovery::DiscoveryProvider;
use crate::error::{DeviceFault, RunError};
use crate::metrics;
use crate::registry::{DeviceId, FanOut, FanOutResults, FaultPolicy, SessionRegistry};
use crate::transport::{argv, RemoteTransport, SignalKind, TransportError};

/// Why a run had to stop
enum Abort {
    Exhausted { phase: &'static str },
    Strict {
        device: DeviceId,
        phase: &'static str,
        fault: DeviceFault,
    },
}

/// Outcome of collecting one device
#[derive(Debug, Default)]
struct Collected {
    remote_files: Vec<String>,
    files: Vec<CollectedFile>,
    failures: Vec<DeviceFault>,
}

/// Drives the lifecycle of one capture run
///
/// The orchestrator owns the [`CaptureRun`] and borrows the registry for the
/// run's duration. [`CaptureOrchestrator::run`] executes every phase; the
/// phase methods are public for callers that need to step through them.
pub struct CaptureOrchestrator<'r> {
    config: Arc<Config>,
    registry: &'r mut SessionRegistry,
    run: CaptureRun,
}

impl<'r> CaptureOrchestrator<'r> {
    pub fn new(
        config: Arc<Config>,
        registry: &'r mut SessionRegistry,
        session: &str,
    ) -> Result<Self, RunError> {
        validate_session_name(session)?;

        let mut run = CaptureRun::new(session, config.capture.images_per_session);

        for id in registry.all_ids() {
            if let Some(failure) = registry.connection_failures().get(&id) {
                let mut record = DeviceRecord::new(id, failure.address.clone(), DeviceStatus::Unreachable);
                record.faults.push(FaultRecord {
                    phase: "connecting".to_string(),
                    fault: failure.fault.clone(),
                });
                run.add_device(record);
            } else if let Some(address) = registry.address(id) {
                let status = if registry.is_live(id) {
                    DeviceStatus::Live
                } else {
                    DeviceStatus::Excluded
                };
                run.add_device(DeviceRecord::new(id, address, status));
            }
        }

        Ok(Self {
            config,
            registry,
            run,
        })
    }

    pub fn state(&self) -> RunState {
        self.run.state
    }

    pub fn capture_run(&self) -> &CaptureRun {
        &self.run
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_run(&self.run)
    }

    /// Execute every phase and end in `Done`, or fail with the aborted run's summary
    pub async fn run(mut self) -> Result<RunSummary, RunError> {
        self.prepare().await?;
        self.capture().await?;
        self.finalize().await?;
        self.collect().await?;

        self.run.transition(RunState::Done);
        Ok(self.summary())
    }

    /// Recreate the run directory and start the capture process on every device
    pub async fn prepare(&mut self) -> Result<(), RunError> {
        match self.prepare_devices().await {
            Ok(()) => Ok(()),
            Err(abort) => Err(self.abort(abort).await),
        }
    }

    /// Broadcast `k` capture signals, one round per trigger interval
    pub async fn capture(&mut self) -> Result<(), RunError> {
        match self.capture_rounds().await {
            Ok(()) => Ok(()),
            Err(abort) => Err(self.abort(abort).await),
        }
    }

    /// Stop every capture process and wait for it to exit
    pub async fn finalize(&mut self) -> Result<(), RunError> {
        match self.finalize_processes().await {
            Ok(()) => Ok(()),
            Err(abort) => Err(self.abort(abort).await),
        }
    }

    /// Copy every captured file into the local output directory
    pub async fn collect(&mut self) -> Result<(), RunError> {
        match self.collect_files().await {
            Ok(()) => Ok(()),
            Err(abort) => Err(self.abort(abort).await),
        }
    }

    // ------------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------------

    async fn prepare_devices(&mut self) -> Result<(), Abort> {
        self.ensure_live("preparing")?;
        self.run.transition(RunState::Preparing);
        let _timer = metrics::start_phase_timer("preparing");

        let remote_dir = self.config.remote_session_dir(&self.run.session);
        let stop_leftover = argv(["killall", "-w", "-s", "USR2", self.config.capture.executable.as_str()]);
        let remove_dir = argv(["rm", "-rf", remote_dir.as_str()]);
        let make_dir = argv(["mkdir", remote_dir.as_str()]);
        let step = self.config.command_timeout();

        let results = self
            .registry
            .for_each(
                FanOut::best_effort("preparing", self.config.prepare_timeout()),
                move |session| {
                    let stop_leftover = stop_leftover.clone();
                    let remove_dir = remove_dir.clone();
                    let make_dir = make_dir.clone();
                    Box::pin(async move {
                        let device = session.id();
                        // the remote side is handled by killall below
                        session.take_process();
                        let conn = session.connection();

                        match bounded(step, "stopping leftover capture process", conn.run(&stop_leftover)).await {
                            Ok(out) if out.success() => {
                                tracing::info!(device = %device, "Stopped leftover capture process");
                            }
                            Ok(_) => tracing::debug!(device = %device, "No leftover capture process"),
                            Err(e) => tracing::warn!(device = %device, error = %e, "killall failed"),
                        }

                        if let Err(e) = bounded(step, "removing previous run directory", conn.run(&remove_dir))
                            .await
                            .and_then(|out| out.ensure_success(&remove_dir))
                        {
                            tracing::warn!(device = %device, error = %e, "Could not remove previous run directory");
                        }

                        bounded(step, "creating run directory", conn.run(&make_dir))
                            .await
                            .and_then(|out| out.ensure_success(&make_dir))
                            .map_err(DeviceFault::preparation)?;

                        Ok::<_, DeviceFault>(())
                    })
                },
            )
            .await;
        self.absorb("preparing", results).await;
        self.ensure_live("preparing")?;

        self.spawn_capture_processes().await?;
        self.ensure_live("preparing")?;

        tracing::debug!(settle = ?self.config.settle_interval(), "Waiting for capture processes to settle");
        tokio::time::sleep(self.config.settle_interval()).await;
        Ok(())
    }

    async fn spawn_capture_processes(&mut self) -> Result<(), Abort> {
        let policy = if self.config.capture.strict {
            FaultPolicy::AbortOnFirstError
        } else {
            FaultPolicy::ContinueCollectingErrors
        };
        let config = Arc::clone(&self.config);
        let session_name = self.run.session.clone();

        let results = self
            .registry
            .for_each(
                FanOut::best_effort("spawning", self.config.command_timeout()).with_policy(policy),
                move |session| {
                    let command = config.capture_command(session.id(), &session_name);
                    Box::pin(async move {
                        let process = session
                            .connection()
                            .spawn(&command)
                            .await
                            .map_err(DeviceFault::spawn)?;
                        let pid = process.pid();

                        if let Err(rejected) = session.attach_process(process) {
                            rejected.signal(SignalKind::Kill).await;
                            return Err(DeviceFault::spawn("a capture process is already attached"));
                        }

                        tracing::info!(device = %session.id(), pid = ?pid, "Capture process started");
                        Ok::<_, DeviceFault>(pid)
                    })
                },
            )
            .await;

        let first_failure = results
            .iter()
            .find_map(|(id, result)| match result {
                Err(fault) if !matches!(fault, DeviceFault::Cancelled { .. }) => Some((*id, fault.clone())),
                _ => None,
            });

        for (id, result) in &results {
            if result.is_ok() {
                if let Some(record) = self.run.device_mut(*id) {
                    record.spawned = true;
                }
            }
        }

        if policy == FaultPolicy::AbortOnFirstError {
            if let Some((device, fault)) = first_failure {
                self.absorb("preparing", results).await;
                return Err(Abort::Strict {
                    device,
                    phase: "preparing",
                    fault,
                });
            }
        }

        self.absorb("preparing", results).await;
        Ok(())
    }

    async fn capture_rounds(&mut self) -> Result<(), Abort> {
        let rounds = self.run.target;
        let _timer = metrics::start_phase_timer("capturing");

        for round in 1..=rounds {
            self.ensure_live("capturing")?;
            self.run.transition(RunState::Capturing { round, of: rounds });

            let started = Instant::now();
            let results = self.broadcast(SignalKind::Capture).await;
            let latency = started.elapsed();

            self.run.record_broadcast(latency);
            metrics::record_broadcast(SignalKind::Capture, latency);
            tracing::info!(
                round,
                of = rounds,
                devices = results.len(),
                latency_ms = latency.as_millis() as u64,
                "Capture signal broadcast"
            );

            for (id, result) in &results {
                if matches!(result, Ok(true)) {
                    if let Some(record) = self.run.device_mut(*id) {
                        record.signals_sent += 1;
                    }
                }
            }
            self.absorb("capturing", results).await;

            tokio::time::sleep(self.config.trigger_interval()).await;
        }

        Ok(())
    }

    async fn finalize_processes(&mut self) -> Result<(), Abort> {
        self.ensure_live("finalizing")?;
        self.run.transition(RunState::Finalizing);
        let _timer = metrics::start_phase_timer("finalizing");

        let started = Instant::now();
        let signalled = self.broadcast(SignalKind::Shutdown).await;
        metrics::record_broadcast(SignalKind::Shutdown, started.elapsed());
        self.absorb("finalizing", signalled).await;

        let results = self.wait_for_exit(self.config.termination_timeout()).await;
        self.absorb("finalizing", results).await;

        Ok(())
    }

    async fn collect_files(&mut self) -> Result<(), Abort> {
        self.ensure_live("collecting")?;
        self.run.transition(RunState::Collecting);
        let _timer = metrics::start_phase_timer("collecting");

        let remote_dir = self.config.remote_session_dir(&self.run.session);
        let local_dir = self.config.local_session_dir(&self.run.session);

        if let Err(e) = tokio::fs::create_dir_all(&local_dir).await {
            tracing::error!(path = %local_dir.display(), error = %e, "Could not create local output directory");
        }

        let transfer = self.config.transfer_timeout();

        let results = self
            .registry
            .for_each(
                FanOut::best_effort("collecting", self.config.collection_timeout()),
                move |session| {
                    let remote_dir = remote_dir.clone();
                    let local_dir = local_dir.clone();
                    Box::pin(async move {
                        let device = session.id();
                        let conn = session.connection();

                        let names = conn
                            .list_directory(&remote_dir)
                            .await
                            .map_err(|e| DeviceFault::collection(remote_dir.clone(), e))?;

                        let mut collected = Collected::default();
                        for name in names {
                            let remote = format!("{remote_dir}/{name}");
                            let local: PathBuf = local_dir.join(format!("{device}_{name}"));

                            let copy = conn.stream_copy(&remote, &local);
                            match bounded(transfer, format!("copying {remote}"), copy).await {
                                Ok(bytes) => {
                                    tracing::debug!(device = %device, file = %name, bytes, "Collected file");
                                    collected.files.push(CollectedFile {
                                        remote: name.clone(),
                                        local,
                                        bytes,
                                    });
                                }
                                Err(e) => {
                                    tracing::warn!(device = %device, file = %name, error = %e, "File transfer failed");
                                    collected.failures.push(DeviceFault::collection(name.clone(), e));
                                }
                            }
                            collected.remote_files.push(name);
                        }

                        Ok::<_, DeviceFault>(collected)
                    })
                },
            )
            .await;

        let mut outcomes = FanOutResults::new();
        for (id, result) in results {
            match result {
                Ok(collected) => {
                    for file in &collected.files {
                        metrics::record_file_collected(file.bytes);
                    }
                    let failures = collected.failures.len();
                    metrics::record_device_faults("collecting", failures);
                    for fault in collected.failures {
                        self.run.record_fault(id, "collecting", fault);
                    }
                    if let Some(record) = self.run.device_mut(id) {
                        tracing::info!(
                            device = %id,
                            files = collected.files.len(),
                            failed = failures,
                            "Collection finished"
                        );
                        record.remote_files = collected.remote_files;
                        record.collected = collected.files;
                    }
                    outcomes.insert(id, Ok(()));
                }
                Err(fault) => {
                    outcomes.insert(id, Err(fault));
                }
            }
        }
        self.absorb("collecting", outcomes).await;

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Signal every live capture process once; `Ok(false)` when a device has none
    async fn broadcast(&mut self, kind: SignalKind) -> FanOutResults<bool> {
        self.registry
            .for_each(
                FanOut::best_effort(kind.as_str(), self.config.command_timeout()),
                move |session| {
                    Box::pin(async move {
                        match session.process() {
                            Some(process) => {
                                process.signal(kind).await;
                                Ok(true)
                            }
                            None => Ok(false),
                        }
                    })
                },
            )
            .await
    }

    /// Detach and await every capture process; a process that outlives
    /// `timeout` is killed and its device marked incomplete
    async fn wait_for_exit(&mut self, timeout: Duration) -> FanOutResults<Option<i32>> {
        let timeout_ms = timeout.as_millis() as u64;
        let phase_limit = timeout + self.config.command_timeout();

        self.registry
            .for_each(FanOut::best_effort("finalizing", phase_limit), move |session| {
                Box::pin(async move {
                    let device = session.id();
                    let Some(mut process) = session.take_process() else {
                        return Ok(None);
                    };

                    match process.wait(timeout).await {
                        Ok(status) => {
                            tracing::info!(device = %device, code = ?status.code, "Capture process exited");
                            Ok(status.code)
                        }
                        Err(TransportError::Timeout { .. }) => {
                            tracing::warn!(device = %device, "Capture process did not exit, killing it");
                            process.signal(SignalKind::Kill).await;
                            Err(DeviceFault::TerminationTimeout { timeout_ms })
                        }
                        Err(e) => {
                            tracing::warn!(device = %device, error = %e, "Lost track of capture process");
                            Ok(None)
                        }
                    }
                })
            })
            .await
    }

    /// Record every failed device of a fan-out and exclude it when the fault demands
    async fn absorb<T>(&mut self, phase: &str, results: FanOutResults<T>) {
        let mut faults = 0;

        for (id, result) in results {
            let Err(fault) = result else {
                continue;
            };
            faults += 1;

            if fault.excludes_device() {
                self.exclude(id, phase, fault).await;
            } else {
                self.run.record_fault(id, phase, fault);
            }
        }

        metrics::record_device_faults(phase, faults);
        metrics::update_live_devices(self.registry.live_count());
    }

    /// Drop a device from the rest of the run, stopping its capture process if it has one
    async fn exclude(&mut self, id: DeviceId, phase: &str, fault: DeviceFault) {
        if let Some(process) = self.registry.session_mut(id).and_then(|s| s.take_process()) {
            process.signal(SignalKind::Shutdown).await;
        }
        self.registry.exclude(id, fault.clone());
        self.run.record_fault(id, phase, fault);
    }

    fn ensure_live(&self, phase: &'static str) -> Result<(), Abort> {
        if self.registry.is_exhausted() {
            tracing::error!(session = %self.run.session, phase, "No live devices left");
            return Err(Abort::Exhausted { phase });
        }
        Ok(())
    }

    /// Move the run to `Aborted`, stopping any capture process still running
    async fn abort(&mut self, abort: Abort) -> RunError {
        let results = self.broadcast(SignalKind::Shutdown).await;
        if results.values().any(|r| matches!(r, Ok(true))) {
            let results = self.wait_for_exit(self.config.termination_timeout()).await;
            self.absorb("aborting", results).await;
        }

        self.run.transition(RunState::Aborted);
        let summary = Box::new(self.summary());

        match abort {
            Abort::Exhausted { phase } => RunError::FleetExhausted {
                phase: phase.to_string(),
                summary,
            },
            Abort::Strict {
                device,
                phase,
                fault,
            } => RunError::StrictAbort {
                device,
                phase: phase.to_string(),
                fault,
                summary,
            },
        }
    }
}

/// Run one remote step under its own deadline
async fn bounded<T>(
    limit: Duration,
    operation: impl Into<String>,
    step: impl std::future::Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, step)
        .await
        .unwrap_or_else(|_| Err(TransportError::timeout(operation, limit)))
}

/// Discover, connect, run one capture session and close every connection
///
/// Discovery finding nothing is not a discovery failure: the run aborts with
/// [`RunError::FleetExhausted`] before touching any device.
pub async fn run_fleet(
    config: Arc<Config>,
    discovery: &dyn DiscoveryProvider,
    transport: &dyn RemoteTransport,
    session: &str,
) -> Result<RunSummary, RunError> {
    validate_session_name(session)?;

    let addresses = discovery.discover().await?;
    tracing::info!(devices = addresses.len(), session, "Starting capture run");

    let mut registry = SessionRegistry::connect(transport, &addresses, &config).await;
    metrics::update_live_devices(registry.live_count());

    let result = match CaptureOrchestrator::new(config, &mut registry, session) {
        Ok(orchestrator) => orchestrator.run().await,
        Err(e) => Err(e),
    };

    registry.close_all().await;
    metrics::update_live_devices(0);

    result
}
