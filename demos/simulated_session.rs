use std::{sync::Arc, time::Duration};
use tokio::time::{interval, Instant};
use tracing::{error, info};

use ftms_link::{
    mock::{MockDiscovery, MockTelemetryClient},
    AttributeValue, EnumValue, FtmsConfig, FtmsSession, MachineType, TrainingStatus,
};

const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Simulated FTMS session");

    let discovery = MockDiscovery::new();
    discovery
        .insert(MockDiscovery::fitness_machine(ADDRESS))
        .await;

    let mut config = FtmsConfig::new(
        ADDRESS,
        ["power_output", "cadence", "speed_instant", "heart_rate", "training_status"],
    );
    config.connection.poll_interval_ms = 3_000;
    config.connection.reconnect_delay_ms = 2_000;

    let session = match FtmsSession::setup(config, &discovery, |info| {
        Ok(MockTelemetryClient::from_service_info(&info)?
            .with_machine_type(MachineType::IndoorBike)
            .with_capabilities(["power_output", "cadence", "speed_instant", "training_status"]))
    })
    .await
    {
        Ok(session) => session,
        Err(e) => {
            error!("Setup failed ({}): {}", e.reason, e);
            return Err(e.into());
        }
    };

    info!(
        "Connected to {} ({}), unique id {}",
        session.address(),
        session
            .machine_type()
            .map_or_else(|| "unknown".to_string(), |m| m.to_string()),
        session.unique_id()
    );

    let client = Arc::clone(session.client());
    let mut readings = session.subscribe_readings();
    let printer = tokio::spawn(async move {
        while readings.changed().await.is_ok() {
            let current = readings.borrow_and_update().clone();
            println!("┌──────────────────────────────┐");
            for reading in current.iter() {
                println!("│ {:<28} │", reading.to_string());
            }
            println!("└──────────────────────────────┘");
        }
    });

    let start = Instant::now();
    let mut ticker = interval(Duration::from_secs(1));
    for tick in 0_i32..12 {
        ticker.tick().await;

        if tick == 5 {
            info!("Simulating a dropped link");
            client.drop_link().await;
            continue;
        }

        let status = if tick < 2 {
            TrainingStatus::WarmingUp
        } else {
            TrainingStatus::ManualMode
        };
        client
            .emit_telemetry([
                ("power_output", AttributeValue::Integer(i64::from(100 + tick * 10))),
                ("cadence", AttributeValue::Integer(i64::from(80 + tick))),
                ("speed_instant", AttributeValue::Float(25.0 + 0.5 * f64::from(tick))),
                ("training_status", EnumValue::TrainingStatus(status).into()),
            ])
            .await;

        info!(
            "t={:>2}s connected={} state={}",
            start.elapsed().as_secs(),
            session.is_connected(),
            session.connection_state()
        );
    }

    session.shutdown().await?;
    printer.abort();
    info!("Done");
    Ok(())
}
