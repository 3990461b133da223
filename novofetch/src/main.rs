use std::sync::Arc;

use novofetch::api::{self, AppState};
use novofetch::logging;
use novofetch::settings::Settings;
use novofetch::transfer::{LndTool, TransferManager, TransferTool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let settings_path =
        std::env::var("NOVOFETCH_SETTINGS").unwrap_or_else(|_| "user_settings.json".to_string());
    let settings = Settings::load(&settings_path);

    // Initialize logging; keep the appender guard alive for the app lifetime
    let _guard = logging::init_logging(&settings.log_dir)?;

    if let Err(e) = settings.validate_lnd_path() {
        tracing::warn!("{}; transfers will fail to start until this is fixed", e);
    }

    std::fs::create_dir_all(&settings.download_root)?;

    let tool: Arc<dyn TransferTool> = Arc::new(LndTool::from_settings(&settings));
    let manager = Arc::new(TransferManager::new(tool.clone(), &settings));

    let state = AppState {
        manager: manager.clone(),
        tool,
    };
    let router = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&settings.api_bind).await?;
    tracing::info!(addr = %settings.api_bind, "novofetch listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    Ok(())
}

/// Wait for ctrl-c, then cancel whatever is still running so no transfer
/// process outlives the server.
async fn shutdown_signal(manager: Arc<TransferManager>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown requested, cancelling running tasks");
    manager.shutdown();
}
