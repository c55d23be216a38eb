use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use remoteline::config::AppConfig;
use remoteline::control::{probe_all, ControlError, DeviceSession};
use remoteline::mqtt::MqttConnector;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = AppConfig::load_or_init().await?;
    info!(
        device = %config.device.device_id,
        brokers = config.brokers.len(),
        "Configuration loaded from {}",
        AppConfig::config_path().display()
    );

    let connector = Arc::new(MqttConnector::default());

    let results = probe_all(connector.as_ref(), &config.brokers, config.probe_timeout()).await;
    for result in &results {
        match &result.reason {
            None => info!("  [ok]   {} ({})", result.label, result.url),
            Some(reason) => warn!("  [fail] {} ({}): {}", result.label, result.url, reason),
        }
    }
    let broker = results
        .iter()
        .find(|result| result.ok)
        .ok_or_else(|| eyre!("None of the {} configured brokers is reachable", results.len()))?;
    info!("Using broker '{}'", broker.label);

    let session = DeviceSession::open(
        &config.device.device_id,
        &broker.url,
        connector,
        config.session_options(),
    )?;

    let _changes = session.on_change(|snapshot| {
        info!(
            connection = %snapshot.connection,
            reported = ?snapshot.reported_line,
            desired = ?snapshot.desired_line,
            in_flight = snapshot.command_in_flight,
            online = ?snapshot.device_online,
            "Session state changed"
        );
    });

    session.connect().await?;

    if let Some(line) = config.device.request_line {
        match session.request_line(line).await {
            Ok(()) => {
                info!("Requested {} line, waiting for the device", line);
                match session
                    .wait_for_reported(line, config.convergence_timeout())
                    .await
                {
                    Ok(()) => info!("Device now runs on the {} line", line),
                    Err(e) => warn!("Device did not confirm the {} line: {}", line, e),
                }
            }
            Err(ControlError::NoOp(line)) => info!("Device already runs on the {} line", line),
            Err(e) if e.is_command_error() => warn!("Line change rejected: {}", e),
            Err(e) => error!("Line change failed: {}", e),
        }
    }

    info!("Watching device, press Ctrl-C to exit");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

    session.close();
    info!("Session closed");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
