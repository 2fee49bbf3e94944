//! Integration tests for failure handling and recovery.
//!
//! Radio loss, bonding, scan throttling and permission errors all have to
//! leave the manager in a state it can scan again from, without ever
//! holding more than one session.

use std::time::Duration;

use proximity_unlock::config::ScannerConfig;
use proximity_unlock::core::bluetooth::{
    Availability, BondEvent, FailureReason, GattEvent, GattStatus, ScanFailure, ScanSession,
};
use proximity_unlock::error::{Permission, PlatformError};

use crate::mock_platform::{Call, Harness, lock, settle};

fn failed(reason: FailureReason) -> ScanSession {
    ScanSession::Failed { reason }
}

// ── Availability ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn radio_off_fails_and_recovery_rescans() {
    let h = Harness::new();
    h.start(vec![lock(1, -75)]).await;

    h.availability.set(Availability::new(false, true));
    h.wait_for(|s| *s == failed(FailureReason::BluetoothOff)).await;

    h.availability.set(Availability::new(false, false));
    h.wait_for(|s| *s == failed(FailureReason::BluetoothAndLocationOff))
        .await;

    h.availability.set(Availability::ON);
    h.wait_for(|s| *s == ScanSession::Scanning).await;
    settle().await;
    assert_eq!(h.radio.scan_starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn start_with_radio_off_fails_immediately() {
    let h = Harness::new();
    h.availability.set(Availability::new(true, false));

    h.handle.start(vec![lock(1, -75)]).unwrap();
    h.wait_for(|s| *s == failed(FailureReason::LocationOff)).await;
    settle().await;
    assert_eq!(h.radio.scan_starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn retrying_start_with_location_off_keeps_the_scan_quota() {
    let h = Harness::new();
    h.availability.set(Availability::new(true, false));

    for _ in 0..6 {
        h.handle.start(vec![lock(1, -75)]).unwrap();
        h.wait_for(|s| *s == failed(FailureReason::LocationOff)).await;
        h.handle.stop().unwrap();
        h.wait_for(|s| *s == ScanSession::Idle).await;
    }
    settle().await;
    assert_eq!(h.radio.scan_starts(), 0);

    // The first start after recovery scans straight away.
    h.availability.set(Availability::ON);
    h.handle.start(vec![lock(1, -75)]).unwrap();
    h.wait_for(|s| *s == ScanSession::Scanning).await;
    settle().await;
    assert_eq!(h.radio.scan_starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn radio_off_mid_session_closes_the_link() {
    let h = Harness::new();
    let door = lock(1, -75);
    h.start(vec![door.clone()]).await;
    let session = h.connect("AA:BB:CC:DD:EE:01", &door, -60).await;

    h.availability.set(Availability::new(false, true));
    h.wait_for(|s| *s == failed(FailureReason::BluetoothOff)).await;
    settle().await;
    assert!(h.radio.was_closed(session));

    h.availability.set(Availability::ON);
    h.wait_for(|s| *s == ScanSession::Scanning).await;
}

// ── GATT failures ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn disconnect_rescans_and_stale_session_is_ignored() {
    let h = Harness::new();
    let door = lock(1, -75);
    h.start(vec![door.clone()]).await;
    let first = h.connect("AA:BB:CC:DD:EE:01", &door, -60).await;

    h.radio.gatt(first, GattEvent::Disconnected);
    h.wait_for(|s| *s == ScanSession::Scanning).await;
    settle().await;
    assert!(h.radio.was_closed(first));

    h.radio.gatt(first, GattEvent::Connected { bonding: false });
    settle().await;
    assert_eq!(h.state(), ScanSession::Scanning);
}

#[tokio::test(start_paused = true)]
async fn signal_read_that_cannot_start_drops_the_session() {
    let h = Harness::new();
    let door = lock(1, -75);
    h.start(vec![door.clone()]).await;
    let session = h.connect("AA:BB:CC:DD:EE:01", &door, -60).await;

    h.radio
        .fail_next_signal_read(PlatformError::Operation("link lost".into()));
    h.radio.gatt(
        session,
        GattEvent::Notification {
            characteristic: proximity_unlock::core::bluetooth::UUID_UNLOCK_NOTIFY_CHAR,
            value: vec![0xaa, 7],
        },
    );
    h.wait_for(|s| *s == ScanSession::Scanning).await;
    settle().await;

    assert!(h.radio.was_closed(session));
    assert!(h.radio.writes().is_empty());
    assert_eq!(h.radio.scan_starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn congestion_fails_then_rescans() {
    let h = Harness::new();
    let door = lock(1, -75);
    h.start(vec![door.clone()]).await;
    h.radio.advertise("AA:BB:CC:DD:EE:01", door.service_id, -60);
    h.wait_for(|s| *s == ScanSession::Connecting).await;
    let session = h.radio.last_session().unwrap();

    let mut transitions = h.handle.subscribe_transitions();
    h.radio
        .gatt(session, GattEvent::Error(GattStatus::from_code(143)));
    h.wait_for(|s| *s == ScanSession::Scanning).await;

    assert_eq!(
        transitions.recv().await.unwrap(),
        failed(FailureReason::ConnectionCongested)
    );
    assert_eq!(transitions.recv().await.unwrap(), ScanSession::Scanning);
}

#[tokio::test(start_paused = true)]
async fn auth_error_bonds_and_reconnects_on_a_new_session() {
    let h = Harness::new();
    let door = lock(1, -75);
    h.start(vec![door.clone()]).await;
    let first = h.connect("AA:BB:CC:DD:EE:01", &door, -60).await;

    h.radio.gatt(
        first,
        GattEvent::Error(GattStatus::InsufficientAuthentication),
    );
    h.wait_for(|s| *s == ScanSession::Reconnecting).await;
    settle().await;
    assert!(h.radio.was_closed(first));
    assert!(
        h.radio
            .calls()
            .iter()
            .any(|c| matches!(c, Call::CreateBond(s, _) if *s == first))
    );

    h.radio.bond(first, BondEvent::Bonded);
    h.wait_for(|s| *s == ScanSession::Connecting).await;
    let second = h.radio.last_session().unwrap();
    assert_ne!(first, second);

    // The old session can no longer move the machine.
    h.radio.gatt(first, GattEvent::Connected { bonding: false });
    settle().await;
    assert_eq!(h.state(), ScanSession::Connecting);

    h.radio.gatt(second, GattEvent::Connected { bonding: false });
    h.wait_for(|s| matches!(s, ScanSession::Connected { .. })).await;
}

#[tokio::test(start_paused = true)]
async fn second_auth_error_gives_up_and_rescans() {
    let h = Harness::new();
    let door = lock(1, -75);
    h.start(vec![door.clone()]).await;
    let first = h.connect("AA:BB:CC:DD:EE:01", &door, -60).await;

    h.radio
        .gatt(first, GattEvent::Error(GattStatus::InsufficientEncryption));
    h.wait_for(|s| *s == ScanSession::Reconnecting).await;
    h.radio.bond(first, BondEvent::Bonded);
    h.wait_for(|s| *s == ScanSession::Connecting).await;
    let second = h.radio.last_session().unwrap();

    h.radio
        .gatt(second, GattEvent::Error(GattStatus::InsufficientEncryption));
    h.wait_for(|s| *s == ScanSession::Scanning).await;
    settle().await;
    assert!(h.radio.was_closed(second));
    assert_eq!(h.radio.count(|c| matches!(c, Call::CreateBond(..))), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_permission_denied_parks_the_client() {
    let h = Harness::new();
    let door = lock(1, -75);
    h.start(vec![door.clone()]).await;
    h.radio.advertise("AA:BB:CC:DD:EE:01", door.service_id, -60);
    h.wait_for(|s| *s == ScanSession::Connecting).await;
    let session = h.radio.last_session().unwrap();

    h.radio
        .gatt(session, GattEvent::PermissionDenied(Permission::Connect));
    h.wait_for(|s| *s == failed(FailureReason::NoConnectPermission))
        .await;
    settle().await;
    assert!(h.radio.was_closed(session));
    assert_eq!(h.radio.scan_starts(), 1);
}

// ── Scanner failures ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scan_permission_denied_is_cleared_by_start() {
    let h = Harness::new();
    h.radio
        .fail_next_scan(PlatformError::PermissionDenied(Permission::Scan));

    h.handle.start(vec![lock(1, -75)]).unwrap();
    h.wait_for(|s| *s == failed(FailureReason::NoScanPermission))
        .await;

    h.handle.start(vec![lock(1, -75)]).unwrap();
    h.wait_for(|s| *s == ScanSession::Scanning).await;
    settle().await;
    assert_eq!(h.radio.scan_starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn scanning_too_frequently_cools_down() {
    let h = Harness::new();
    h.start(vec![lock(1, -75)]).await;

    h.radio.scan_failed(ScanFailure::ScanningTooFrequently);
    h.wait_for(|s| *s == failed(FailureReason::ScanningTooFrequently))
        .await;
    settle().await;
    assert_eq!(h.gate.subscriber_count(), 0);

    tokio::time::advance(Duration::from_secs(29)).await;
    settle().await;
    assert_eq!(h.state(), failed(FailureReason::ScanningTooFrequently));

    tokio::time::advance(Duration::from_secs(2)).await;
    h.wait_for(|s| *s == ScanSession::Scanning).await;
    settle().await;
    assert_eq!(h.radio.scan_starts(), 2);
    assert_eq!(h.gate.subscriber_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_scan_failure_retries() {
    let h = Harness::new();
    h.start(vec![lock(1, -75)]).await;

    h.radio.scan_failed(ScanFailure::from_code(3));
    h.wait_for(|s| *s == ScanSession::Scanning).await;
    settle().await;
    assert_eq!(h.radio.scan_starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn scan_starts_are_rate_limited() {
    let h = Harness::new();
    h.start(vec![lock(1, -75)]).await;
    for _ in 0..6 {
        h.handle.restart_if_not_busy().unwrap();
    }
    settle().await;

    // Five starts per thirty seconds; the newest request waits for the window.
    assert_eq!(h.radio.scan_starts(), 5);

    tokio::time::advance(Duration::from_secs(29)).await;
    settle().await;
    assert_eq!(h.radio.scan_starts(), 5);

    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(h.radio.scan_starts(), 6);
}

// ── Timers and shutdown ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn health_restart_rescans_while_idle_scanning() {
    let h = Harness::with_config(ScannerConfig {
        health_restart_interval_ms: Some(60_000),
        ..ScannerConfig::default()
    });
    h.start(vec![lock(1, -75)]).await;

    tokio::time::advance(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(h.radio.scan_starts(), 2);

    h.handle.stop().unwrap();
    settle().await;
    tokio::time::advance(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(h.radio.scan_starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn invalid_config_fails_every_start() {
    let h = Harness::with_config(ScannerConfig {
        scans_per_period: 0,
        ..ScannerConfig::default()
    });
    h.handle.start(vec![lock(1, -75)]).unwrap();
    h.wait_for(|s| *s == failed(FailureReason::IncorrectConfiguration))
        .await;
    settle().await;
    assert_eq!(h.radio.scan_starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_the_radio() {
    let h = Harness::new();
    let door = lock(1, -75);
    h.start(vec![door.clone()]).await;
    let session = h.connect("AA:BB:CC:DD:EE:01", &door, -60).await;

    h.handle.shutdown().unwrap();
    tokio::time::timeout(Duration::from_secs(1), h.task)
        .await
        .expect("manager did not stop")
        .unwrap();

    assert!(h.radio.was_closed(session));
    assert_eq!(h.radio.calls().last(), Some(&Call::StopScan));
    assert_eq!(h.gate.subscriber_count(), 0);
}
