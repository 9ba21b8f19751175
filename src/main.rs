use sipwatch::config::Config;
use sipwatch::domain::shared::EventMetadata;
use sipwatch::infrastructure::protocols::sip::NetworkTransport;
use sipwatch::SipManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration file is the only argument
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting sipwatch {}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {:?}", config.account);

    let transport = Arc::new(NetworkTransport::new());
    let manager = SipManager::new(config.account.clone(), config.timers.clone(), transport);

    let mut status = manager.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(event) => {
                    let metadata = EventMetadata::for_event(&event);
                    match serde_json::to_string(&event) {
                        Ok(json) => info!(event_id = %metadata.event_id, "Status: {}", json),
                        Err(e) => warn!("Failed to serialize status event: {}", e),
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} status events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut calls = manager.subscribe_calls();
    tokio::spawn(async move {
        loop {
            match calls.recv().await {
                Ok(call) => info!(
                    "Incoming call from {} ({}) at {}",
                    call.display_name, call.normalized_number, call.timestamp
                ),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} incoming calls", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    manager.start().await;
    manager.spawn_health_check(config.timers.health_check_interval());

    info!("Watching for incoming calls, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    manager.stop().await;
    Ok(())
}
