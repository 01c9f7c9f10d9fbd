//! Capture lifecycle integration tests
//!
//! Runs complete sessions against a well-behaved simulated fleet and checks:
//! 1. Every device receives exactly k capture signals, then one shutdown
//! 2. Files on each device are exactly the files collected locally
//! 3. Preparing wipes the previous run directory of the same session
//! 4. Empty discovery aborts without touching anything

use pifleet::config::Config;
use pifleet::discovery::StaticDiscovery;
use pifleet::error::RunError;
use pifleet::orchestrator::{run_fleet, CaptureOrchestrator, DeviceStatus, RunState};
use pifleet::registry::DeviceId;
use pifleet::transport::SignalKind;
use tempfile::TempDir;

use super::fixtures::{connect, fast_config, fleet, local_files, shared, REMOTE_DIR, SESSION};

// ============================================================================
// Complete Runs
// ============================================================================

#[tokio::test]
async fn test_every_device_gets_k_triggers() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 4);
    let (transport, addresses) = fleet(3, &[]);
    let mut registry = connect(&transport, &addresses, &config).await;

    let summary = CaptureOrchestrator::new(shared(config), &mut registry, SESSION)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.broadcast.rounds, 4);

    let mut expected = vec![SignalKind::Capture; 4];
    expected.push(SignalKind::Shutdown);
    for address in &addresses {
        assert_eq!(transport.signals(address), expected, "signals for {address}");
        assert!(!transport.process_running(address));
    }

    for device in &summary.devices {
        assert_eq!(device.status, DeviceStatus::Live);
        assert_eq!(device.signals_sent, 4);
        assert!(device.contributed);
        assert!(!device.incomplete);
        assert!(device.errors.is_empty());
    }
}

#[tokio::test]
async fn test_remote_files_round_trip() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 3);
    let (transport, addresses) = fleet(2, &[]);
    let mut registry = connect(&transport, &addresses, &config).await;

    let summary = CaptureOrchestrator::new(shared(config), &mut registry, SESSION)
        .unwrap()
        .run()
        .await
        .unwrap();

    let mut expected_local = Vec::new();
    for (index, address) in addresses.iter().enumerate() {
        let remote = transport.files_in(address, REMOTE_DIR);
        assert_eq!(
            remote,
            (1..=3)
                .map(|n| format!("capture_device{index}_{n}.jpg"))
                .collect::<Vec<_>>()
        );
        expected_local.extend(remote.iter().map(|name| format!("device{index}_{name}")));
    }
    expected_local.sort();

    assert_eq!(local_files(&output.path().join(SESSION)), expected_local);
    assert_eq!(summary.files_retrieved(), 6);

    let content = std::fs::read_to_string(
        output
            .path()
            .join(SESSION)
            .join("device1_capture_device1_2.jpg"),
    )
    .unwrap();
    assert_eq!(content, format!("frame 2 from {}", addresses[1]));
}

#[tokio::test]
async fn test_run_fleet_end_to_end() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 2);
    let (transport, addresses) = fleet(3, &[]);
    let discovery = StaticDiscovery::new(addresses.clone());

    let summary = run_fleet(shared(config), &discovery, &transport, SESSION)
        .await
        .unwrap();

    assert!(summary.is_done());
    assert_eq!(summary.contributing_devices(), 3);
    assert_eq!(
        summary.devices.iter().map(|d| d.id).collect::<Vec<_>>(),
        vec![DeviceId(0), DeviceId(1), DeviceId(2)]
    );
    assert_eq!(
        summary.history,
        vec![
            RunState::Idle,
            RunState::Preparing,
            RunState::Capturing { round: 1, of: 2 },
            RunState::Capturing { round: 2, of: 2 },
            RunState::Finalizing,
            RunState::Collecting,
            RunState::Done,
        ]
    );
}

// ============================================================================
// Preparing
// ============================================================================

#[tokio::test]
async fn test_repeated_session_starts_from_empty_directory() {
    let output = TempDir::new().unwrap();
    let config = shared(fast_config(output.path(), 2));
    let (transport, addresses) = fleet(1, &[]);
    let mut registry = connect(&transport, &addresses, &config).await;

    CaptureOrchestrator::new(config.clone(), &mut registry, SESSION)
        .unwrap()
        .run()
        .await
        .unwrap();

    transport.put_file(&addresses[0], &format!("{REMOTE_DIR}/stale.jpg"), b"left over");

    let mut orchestrator = CaptureOrchestrator::new(config, &mut registry, SESSION).unwrap();
    orchestrator.prepare().await.unwrap();
    assert!(transport.dir_exists(&addresses[0], REMOTE_DIR));
    assert!(transport.files_in(&addresses[0], REMOTE_DIR).is_empty());

    orchestrator.capture().await.unwrap();
    orchestrator.finalize().await.unwrap();
    orchestrator.collect().await.unwrap();

    let record = &orchestrator.capture_run().devices[&DeviceId(0)];
    assert_eq!(
        record.remote_files,
        vec!["capture_device0_1.jpg", "capture_device0_2.jpg"]
    );
}

#[tokio::test]
async fn test_settings_flow_into_capture_command() {
    let output = TempDir::new().unwrap();
    let mut config = fast_config(output.path(), 1);
    config.capture.jpeg_quality = 85;
    config.storage.file_prefix = "cam".to_string();
    let (transport, addresses) = fleet(1, &[]);
    let mut registry = connect(&transport, &addresses, &config).await;

    CaptureOrchestrator::new(shared(config), &mut registry, SESSION)
        .unwrap()
        .run()
        .await
        .unwrap();

    let commands = transport.commands(&addresses[0]);
    let spawn = commands
        .iter()
        .find(|argv| argv.first().map(String::as_str) == Some("raspistill"))
        .unwrap();
    assert!(spawn.contains(&"/tmp/shoot/cam_device0_%d.jpg".to_string()));
    assert!(spawn.contains(&"85".to_string()));
    assert_eq!(transport.files_in(&addresses[0], REMOTE_DIR), vec!["cam_device0_1.jpg"]);
}

// ============================================================================
// Empty Fleet
// ============================================================================

#[tokio::test]
async fn test_empty_discovery_aborts() {
    let output = TempDir::new().unwrap();
    let config = fast_config(output.path(), 2);
    let (transport, _) = fleet(0, &[]);
    let discovery = StaticDiscovery::new(Vec::new());

    let err = run_fleet(shared(config), &discovery, &transport, SESSION)
        .await
        .unwrap_err();

    match &err {
        RunError::FleetExhausted { phase, summary } => {
            assert_eq!(phase, "preparing");
            assert_eq!(summary.history, vec![RunState::Idle, RunState::Aborted]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!output.path().join(SESSION).exists());
}

fn load_validated(path: &std::path::Path) -> pifleet::Result<Config> {
    let config = Config::from_file(path)?;
    config.validate()?;
    Ok(config)
}

#[test]
fn test_sample_config_file_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config.toml");
    let config = load_validated(&path).unwrap();

    assert_eq!(config.timeouts.transfer_secs, 60);
    assert_eq!(config.capture.images_per_session, 9);
    assert_eq!(config.discovery.vendor_signature, "Raspberry Pi Foundation");
}
