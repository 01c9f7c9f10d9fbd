//! Fault isolation integration tests
//!
//! One misbehaving device must never cost the rest of the fleet its images:
//! 1. Unreachable devices are recorded and skipped
//! 2. Preparation failures exclude the device from every later broadcast
//! 3. A hung capture process marks its device incomplete, nothing more
//! 4. A failed transfer skips one file only
//! 5. A fleet with nobody left aborts without side effects
//! 6. A failed scan aborts before any device is contacted

use std::time::Duration;

use pifleet::config::DiscoveryConfig;
use pifleet::discovery::{DiscoveryError, NmapDiscovery, StaticDiscovery};
use pifleet::error::{DeviceFault, RunError};
use pifleet::orchestrator::{run_fleet, CaptureOrchestrator, DeviceStatus, RunState};
use pifleet::registry::DeviceId;
use pifleet::transport::{DeviceBehavior, SignalKind};
use tempfile::TempDir;

use super::fixtures::{connect, fast_config, fleet, local_files, shared, REMOTE_DIR, SESSION};

// ============================================================================
// Connection Failures
// ============================================================================

#[tokio::test]
async fn test_unreachable_device_is_skipped() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 2);
    let (transport, addresses) = fleet(3, &[(1, DeviceBehavior::unreachable())]);
    let discovery = StaticDiscovery::new(addresses.clone());

    let summary = run_fleet(shared(config), &discovery, &transport, SESSION)
        .await
        .unwrap();

    assert!(summary.is_done());
    let unreachable = summary.device(DeviceId(1)).unwrap();
    assert_eq!(unreachable.status, DeviceStatus::Unreachable);
    assert_eq!(unreachable.address, addresses[1]);
    assert!(unreachable.errors[0].starts_with("connecting: connection failed"));

    assert!(transport.commands(&addresses[1]).is_empty());
    assert_eq!(summary.device(DeviceId(0)).unwrap().files_retrieved, 2);
    assert_eq!(summary.device(DeviceId(2)).unwrap().files_retrieved, 2);
}

#[tokio::test]
async fn test_all_unreachable_aborts_before_preparing() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 2);
    let (transport, addresses) = fleet(
        3,
        &[
            (0, DeviceBehavior::unreachable()),
            (1, DeviceBehavior::unreachable()),
            (2, DeviceBehavior::unreachable()),
        ],
    );
    let discovery = StaticDiscovery::new(addresses.clone());

    let err = run_fleet(shared(config), &discovery, &transport, SESSION)
        .await
        .unwrap_err();

    let summary = err.summary().unwrap();
    assert!(matches!(err, RunError::FleetExhausted { .. }));
    assert_eq!(summary.state, RunState::Aborted);
    assert!(!summary.history.contains(&RunState::Preparing));
    assert_eq!(summary.devices.len(), 3);

    for address in &addresses {
        assert!(transport.commands(address).is_empty());
        assert!(transport.signals(address).is_empty());
        assert!(!transport.dir_exists(address, REMOTE_DIR));
    }
    assert!(!output.path().join(SESSION).exists());
}

#[tokio::test]
async fn test_failed_scan_aborts_without_contacting_devices() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 2);
    let (transport, addresses) = fleet(2, &[]);
    let scanner = NmapDiscovery::new(&DiscoveryConfig {
        nmap_path: "/nonexistent/bin/nmap".to_string(),
        use_sudo: false,
        ..Default::default()
    });

    let err = run_fleet(shared(config), &scanner, &transport, SESSION)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RunError::DiscoveryFailure(DiscoveryError::Launch { .. })
    ));
    assert!(err.summary().is_none());
    for address in &addresses {
        assert_eq!(transport.connections(address), 0);
        assert!(transport.commands(address).is_empty());
    }
    assert!(!output.path().join(SESSION).exists());
}

// ============================================================================
// Preparation Failures
// ============================================================================

#[tokio::test]
async fn test_slow_killall_keeps_device_live() {
    let output = TempDir::new().unwrap();
    let mut config = fast_config(output.path(), 3);
    config.timeouts.command_secs = 1;
    let slow = DeviceBehavior::default().with_slow_command("killall", Duration::from_millis(1500));
    let (transport, addresses) = fleet(2, &[(0, slow)]);
    let mut registry = connect(&transport, &addresses, &config).await;

    let summary = CaptureOrchestrator::new(shared(config), &mut registry, SESSION)
        .unwrap()
        .run()
        .await
        .unwrap();

    let device = summary.device(DeviceId(0)).unwrap();
    assert_eq!(device.status, DeviceStatus::Live);
    assert!(device.errors.is_empty(), "errors: {:?}", device.errors);
    assert_eq!(device.files_retrieved, 3);
    assert!(transport.dir_exists(&addresses[0], REMOTE_DIR));
}

#[tokio::test]
async fn test_hung_mkdir_is_a_preparation_failure() {
    let output = TempDir::new().unwrap();
    let mut config = fast_config(output.path(), 2);
    config.timeouts.command_secs = 1;
    let slow = DeviceBehavior::default().with_slow_command("mkdir", Duration::from_secs(30));
    let (transport, addresses) = fleet(2, &[(1, slow)]);
    let mut registry = connect(&transport, &addresses, &config).await;

    let summary = CaptureOrchestrator::new(shared(config), &mut registry, SESSION)
        .unwrap()
        .run()
        .await
        .unwrap();

    let device = summary.device(DeviceId(1)).unwrap();
    assert_eq!(device.status, DeviceStatus::Excluded);
    assert!(device.errors[0].starts_with("preparing: preparation failed"));
    assert!(transport.signals(&addresses[1]).is_empty());
    assert_eq!(summary.device(DeviceId(0)).unwrap().files_retrieved, 2);
}

#[tokio::test]
async fn test_excluded_device_receives_no_broadcasts() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 3);
    let (transport, addresses) = fleet(3, &[(0, DeviceBehavior::failing_mkdir())]);
    let mut registry = connect(&transport, &addresses, &config).await;

    let summary = CaptureOrchestrator::new(shared(config), &mut registry, SESSION)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(summary.is_done());
    assert!(transport.signals(&addresses[0]).is_empty());
    for address in &addresses[1..] {
        let captures = transport
            .signals(address)
            .into_iter()
            .filter(|s| *s == SignalKind::Capture)
            .count();
        assert_eq!(captures, 3);
    }

    let excluded = summary.device(DeviceId(0)).unwrap();
    assert_eq!(excluded.status, DeviceStatus::Excluded);
    assert!(!excluded.contributed);
    assert!(excluded.errors[0].starts_with("preparing: preparation failed"));

    // excluded for this run only
    assert_eq!(registry.len(), 3);
    registry.reset_exclusions();
    assert_eq!(registry.live_count(), 3);
}

#[tokio::test]
async fn test_single_device_failing_preparation_exhausts_fleet() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 3);
    let (transport, addresses) = fleet(1, &[(0, DeviceBehavior::failing_mkdir())]);
    let mut registry = connect(&transport, &addresses, &config).await;

    let err = CaptureOrchestrator::new(shared(config), &mut registry, SESSION)
        .unwrap()
        .run()
        .await
        .unwrap_err();

    match err {
        RunError::FleetExhausted { phase, summary } => {
            assert_eq!(phase, "preparing");
            assert_eq!(summary.state, RunState::Aborted);
            assert!(summary.history.contains(&RunState::Preparing));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(transport.signals(&addresses[0]).is_empty());
}

// ============================================================================
// Termination Timeouts
// ============================================================================

#[tokio::test]
async fn test_hung_device_does_not_block_others() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 2);
    let (transport, addresses) = fleet(3, &[(1, DeviceBehavior::hanging())]);
    let mut registry = connect(&transport, &addresses, &config).await;

    let summary = CaptureOrchestrator::new(shared(config), &mut registry, SESSION)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.state, RunState::Done);

    let hung = summary.device(DeviceId(1)).unwrap();
    assert_eq!(hung.status, DeviceStatus::Live);
    assert!(hung.incomplete);
    assert_eq!(hung.files_retrieved, 2);
    assert_eq!(hung.errors.len(), 1);
    assert!(hung.errors[0].contains("did not exit"));
    assert_eq!(
        transport.signals(&addresses[1]),
        vec![
            SignalKind::Capture,
            SignalKind::Capture,
            SignalKind::Shutdown,
            SignalKind::Kill
        ]
    );
    assert!(!transport.process_running(&addresses[1]));

    for id in [DeviceId(0), DeviceId(2)] {
        let device = summary.device(id).unwrap();
        assert!(!device.incomplete);
        assert_eq!(device.files_retrieved, 2);
    }
}

// ============================================================================
// Collection Failures
// ============================================================================

#[tokio::test]
async fn test_failed_copy_skips_only_that_file() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 3);
    let broken = DeviceBehavior::default().with_failing_copy("capture_device1_2.jpg");
    let (transport, addresses) = fleet(2, &[(1, broken)]);
    let mut registry = connect(&transport, &addresses, &config).await;

    let mut orchestrator = CaptureOrchestrator::new(shared(config), &mut registry, SESSION).unwrap();
    orchestrator.prepare().await.unwrap();
    orchestrator.capture().await.unwrap();
    orchestrator.finalize().await.unwrap();
    orchestrator.collect().await.unwrap();

    let record = &orchestrator.capture_run().devices[&DeviceId(1)];
    assert_eq!(record.remote_files.len(), 3);
    assert_eq!(record.collected.len(), 2);
    assert_eq!(
        record.faults[0].fault,
        DeviceFault::CollectionFailure {
            file: "capture_device1_2.jpg".to_string(),
            reason: format!("Connection to {} lost", addresses[1]),
        }
    );
    assert_eq!(record.status, DeviceStatus::Live);

    assert_eq!(
        local_files(&output.path().join(SESSION)),
        vec![
            "device0_capture_device0_1.jpg",
            "device0_capture_device0_2.jpg",
            "device0_capture_device0_3.jpg",
            "device1_capture_device1_1.jpg",
            "device1_capture_device1_3.jpg",
        ]
    );
}

#[tokio::test]
async fn test_stalled_copy_keeps_files_already_collected() {
    let output = TempDir::new().unwrap();
    let mut config = fast_config(output.path(), 3);
    config.timeouts.transfer_secs = 1;
    let stalled = DeviceBehavior::default().with_stalled_copy("capture_device0_3.jpg");
    let (transport, addresses) = fleet(2, &[(0, stalled)]);
    let mut registry = connect(&transport, &addresses, &config).await;

    let summary = CaptureOrchestrator::new(shared(config), &mut registry, SESSION)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(summary.is_done());
    let device = summary.device(DeviceId(0)).unwrap();
    assert_eq!(device.status, DeviceStatus::Live);
    assert_eq!(device.files_retrieved, 2);
    assert_eq!(device.errors.len(), 1);
    assert!(device.errors[0].starts_with("collecting: failed to collect capture_device0_3.jpg"));
    assert_eq!(summary.device(DeviceId(1)).unwrap().files_retrieved, 3);

    let local = local_files(&output.path().join(SESSION));
    assert!(local.contains(&"device0_capture_device0_1.jpg".to_string()));
    assert!(local.contains(&"device0_capture_device0_2.jpg".to_string()));
    assert!(!local.contains(&"device0_capture_device0_3.jpg".to_string()));
    assert_eq!(local.len(), 5);
}

#[tokio::test]
async fn test_missing_remote_directory_is_recorded() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 1);
    let (transport, addresses) = fleet(2, &[]);
    let mut registry = connect(&transport, &addresses, &config).await;

    let mut orchestrator = CaptureOrchestrator::new(shared(config), &mut registry, SESSION).unwrap();
    orchestrator.prepare().await.unwrap();
    orchestrator.capture().await.unwrap();
    orchestrator.finalize().await.unwrap();

    // the run directory disappears from device0 before collection
    let wipe = pifleet::transport::argv(["rm", "-rf", REMOTE_DIR]);
    let conn = registry_connection(&transport, &addresses[0]).await;
    conn.run(&wipe).await.unwrap();

    orchestrator.collect().await.unwrap();
    let summary = orchestrator.summary();
    assert_eq!(summary.device(DeviceId(0)).unwrap().files_retrieved, 0);
    assert!(summary.device(DeviceId(0)).unwrap().errors[0].starts_with("collecting: failed to collect"));
    assert_eq!(summary.device(DeviceId(1)).unwrap().files_retrieved, 1);
}

async fn registry_connection(
    transport: &pifleet::transport::MemoryTransport,
    address: &str,
) -> Box<dyn pifleet::transport::RemoteConnection> {
    use pifleet::transport::RemoteTransport;

    let credentials = pifleet::config::Config::default().credentials();
    transport.open(address, &credentials).await.unwrap()
}
