use std::{sync::Arc, time::Duration};

use ftms_link::{
    mock::{MockDiscovery, MockPeripheral, MockTelemetryClient},
    AttributeValue, ConnectionState, FtmsConfig, FtmsError, FtmsSession, NotReadyReason,
    Result, ServiceInfo,
};
use tokio::time::{sleep, sleep_until, Instant};

const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

async fn discovery() -> MockDiscovery {
    let discovery = MockDiscovery::new();
    discovery
        .insert(MockDiscovery::fitness_machine(ADDRESS))
        .await;
    discovery
}

fn power_meter(info: &ServiceInfo<MockPeripheral>) -> Result<MockTelemetryClient> {
    Ok(MockTelemetryClient::from_service_info(info)?.with_capabilities(["power_output", "cadence"]))
}

#[tokio::test(start_paused = true)]
async fn slow_device_times_out() {
    let discovery = discovery().await;
    let config = FtmsConfig::new(ADDRESS, ["power_output"]);
    assert_eq!(config.connection.connect_timeout(), Duration::from_secs(10));

    let started = Instant::now();
    let error = FtmsSession::setup(config, &discovery, |info| {
        Ok(power_meter(&info)?.with_connect_latency(Duration::from_secs(15)))
    })
    .await
    .err()
    .unwrap();

    assert_eq!(error.reason, NotReadyReason::ConnectionTimeout);
    assert!(matches!(
        error.source,
        FtmsError::ConnectTimeout {
            timeout_ms: 10_000,
            ..
        }
    ));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(15));
}

#[tokio::test]
async fn unsupported_sensors_are_dropped() {
    let discovery = discovery().await;
    let config = FtmsConfig::new(ADDRESS, ["power_output", "heart_rate"]);

    let session = FtmsSession::setup(config, &discovery, |info| power_meter(&info))
        .await
        .unwrap();

    let keys: Vec<_> = session.sensors().iter().map(|s| s.key).collect();
    assert_eq!(keys, vec!["power_output"]);
    assert!(session
        .sensors()
        .iter()
        .all(|s| session.capabilities().contains(s.key)));

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stale_snapshot_is_served_after_link_loss() {
    let discovery = discovery().await;
    let config = FtmsConfig::new(ADDRESS, ["power_output", "cadence"]);
    assert_eq!(config.connection.poll_interval(), Duration::from_secs(30));

    let session = FtmsSession::setup(config, &discovery, |info| power_meter(&info))
        .await
        .unwrap();
    let client = Arc::clone(session.client());
    let start = Instant::now();

    assert!(
        client
            .emit_telemetry([("power_output", 120_i64), ("cadence", 85)])
            .await
    );

    sleep(Duration::from_millis(500)).await;
    assert!(session.is_connected());

    sleep_until(start + Duration::from_secs(1)).await;
    client.drop_link().await;

    sleep_until(start + Duration::from_millis(1_500)).await;
    assert!(!session.is_connected());
    assert_eq!(session.connection_state(), ConnectionState::Reconnecting);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(
        snapshot.get("power_output"),
        Some(&AttributeValue::Integer(120))
    );
    assert_eq!(snapshot.get("cadence"), Some(&AttributeValue::Integer(85)));

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn repeated_disconnects_trigger_one_reconnect() {
    let discovery = discovery().await;
    let config = FtmsConfig::new(ADDRESS, ["power_output"]);
    assert_eq!(config.connection.reconnect_delay(), Duration::from_secs(5));

    let session = FtmsSession::setup(config, &discovery, |info| power_meter(&info))
        .await
        .unwrap();
    let client = Arc::clone(session.client());
    let start = Instant::now();
    assert_eq!(client.connect_count(), 1);

    sleep_until(start + Duration::from_secs(1)).await;
    client.drop_link().await;
    sleep_until(start + Duration::from_millis(1_200)).await;
    client.drop_link().await;

    sleep_until(start + Duration::from_millis(5_900)).await;
    assert_eq!(client.connect_count(), 1);
    assert!(session.reconnect_pending().await);

    sleep_until(start + Duration::from_millis(6_100)).await;
    assert_eq!(client.connect_count(), 2);
    assert!(!session.reconnect_pending().await);
    assert!(session.is_connected());

    sleep_until(start + Duration::from_secs(20)).await;
    assert_eq!(client.connect_count(), 2);

    session.shutdown().await.unwrap();
}
