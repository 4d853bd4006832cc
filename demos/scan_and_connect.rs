use reabilita::{DeviceController, Result, SessionConfig};
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🔎 Reabilita Scan and Connect Example");

    let config = SessionConfig::default();
    let scan_window = config.scan_settle() + config.scan_duration();
    let controller = DeviceController::with_bluetooth(config).await?;

    // Give the adapter a moment to report its power state
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("Adapter: {}", controller.adapter_power_state());

    if let Err(e) = controller.start_scan().await {
        error!("❌ Cannot scan: {}", e);
        return Err(e);
    }

    info!("Scanning for {} ms...", scan_window.as_millis());
    while controller.is_scanning().await {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let found = controller.discovery_results().await;
    if found.is_empty() {
        warn!("No Reabilita device found");
        controller.shutdown().await;
        return Ok(());
    }

    for (index, peripheral) in found.iter().enumerate() {
        println!("  [{index}] {} ({})", peripheral.display_name(), peripheral.id);
    }

    let target = &found[0];
    info!("🔌 Connecting to {}...", target.display_name());
    match controller.connect_to(target).await {
        Ok(_) => info!("✅ Connected"),
        Err(e) => {
            error!("❌ Failed to connect: {}", e);
            controller.shutdown().await;
            return Err(e);
        }
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("🔌 Disconnecting...");
    controller.shutdown().await;
    info!("👋 Done");
    Ok(())
}
