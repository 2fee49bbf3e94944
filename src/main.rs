use anyhow::Result;
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use proximity_unlock::config::AppConfig;
use proximity_unlock::logging;
use proximity_unlock::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = AppConfig::resolve_path(std::env::args().nth(1));
    let config = AppConfig::load_config(&config_path).await?;
    logging::init(config.log_filter());
    info!("Using config {:?}", config_path);
    if !config_path.exists() {
        // Leave an editable copy of the defaults behind.
        if let Err(e) = config.save_config(&config_path).await {
            warn!("Could not write default config: {}", e);
        }
    }

    let app_state = AppState::new(config).await?;
    let devices = app_state.initial_devices().await;
    if devices.is_empty() {
        warn!("No devices registered, nothing to scan for");
    }

    let mut transitions = app_state.scanner.subscribe_transitions();
    let reporter = tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                Ok(state) => info!("Scanner state: {}", state),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} state updates", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    app_state.scanner.start(devices)?;
    info!("Proximity unlock running, press Ctrl-C to exit");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutting down...");
    app_state.shutdown().await?;
    reporter.abort();
    Ok(())
}
