use anyhow::Context;
use cloud_meter_bridge::helpers::SignalQuality;
use cloud_meter_bridge::{BridgeConfig, BridgeEvent, MeterBridge};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    println!("Starting cloud meter bridge");
    let config = BridgeConfig::load().context("failed to load bridge configuration")?;

    let (handle, mut events) = MeterBridge::start(config).context("failed to start bridge")?;
    info!(accounts = ?handle.account_ids(), "Bridge running");

    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");
    event_logger.abort();

    Ok(())
}

fn log_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::DeviceDiscovered { account_id, device } => {
            info!(
                account = %account_id,
                serial = %device.serial_number,
                model = device.model.as_deref().unwrap_or("unknown"),
                "Discovered meter"
            );
        }
        BridgeEvent::DeviceRemoved { account_id, serial } => {
            warn!(account = %account_id, serial = %serial, "Meter removed");
        }
        BridgeEvent::ReadingUpdated {
            account_id,
            serial,
            reading,
            stale,
            available,
        } => {
            info!(
                account = %account_id,
                serial = %serial,
                energy_kwh = reading.active_energy_total,
                voltage = reading.voltage,
                current = reading.current,
                signal = %SignalQuality::classify(reading.wifi_signal_strength),
                stale,
                available,
                "Reading"
            );
        }
        BridgeEvent::AccountStatusChanged { account_id, status } => {
            warn!(account = %account_id, ?status, "Account status changed");
        }
    }
}
