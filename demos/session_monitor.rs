use reabilita::{DeviceController, Notice, Result, SessionConfig};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Reabilita Session Monitor Example");

    let controller = DeviceController::with_bluetooth(SessionConfig::default()).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    controller.start_scan().await?;
    while controller.is_scanning().await {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let Some(target) = controller.discovery_results().await.into_iter().next() else {
        warn!("No Reabilita device found");
        return Ok(());
    };
    controller.connect_to(&target).await?;
    info!("✅ Connected to {}", target.display_name());

    controller.set_speed(3).await;
    controller.set_intensity(2).await;
    controller.set_repetitions(10).await;
    info!("Parameters: {:?}", controller.parameters().await);

    match controller.toggle().await {
        Ok(Some(command)) => info!("▶️  Sent {}", command),
        Ok(None) => warn!("Command not sent, link is down"),
        Err(e) => {
            error!("❌ Failed to start: {}", e);
            controller.shutdown().await;
            return Err(e);
        }
    }

    let mut running = controller.subscribe_running();
    let mut notices = controller.notices();
    info!("Watching the session, press Ctrl+C to stop");

    loop {
        tokio::select! {
            changed = running.changed() => {
                if changed.is_err() {
                    break;
                }
                let is_running = *running.borrow_and_update();
                println!("🏃 Running: {}", if is_running { "yes" } else { "no" });
                if !is_running {
                    info!("Session finished");
                    break;
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice @ Notice::Disconnected { .. }) => {
                    warn!("⚠️  {}", notice);
                    break;
                }
                Ok(notice) => warn!("⚠️  {}", notice),
                Err(RecvError::Lagged(skipped)) => warn!("{} notices skipped", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("⏹️  Stopping the device");
                if controller.is_running() {
                    if let Err(e) = controller.toggle().await {
                        error!("❌ Failed to stop: {}", e);
                    }
                }
                break;
            }
        }
    }

    info!("🔌 Disconnecting...");
    controller.shutdown().await;
    Ok(())
}
