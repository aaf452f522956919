//! Voice bridge entry point.

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_bridge_config::Settings;
use voice_bridge_server::{bridge, create_router, AppState, BridgeDeps};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::var_os("VOICE_BRIDGE_CONFIG").map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;
    tracing::info!("Starting voice bridge v{}", env!("CARGO_PKG_VERSION"));

    let deps = BridgeDeps::from_settings(&settings)?;
    let bind: std::net::IpAddr = settings.serve.bind.parse()?;
    let addr = SocketAddr::from((bind, settings.serve.port));
    let state = AppState::new(settings, deps);

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, path = %state.settings.serve.path, "Listening for gateway connections");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Hang up whatever is still live before the process exits.
    bridge::stop_all(&state).await;
    tracing::info!("Bridge shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "voice_bridge=info,audit=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
