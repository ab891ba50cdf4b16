use anyhow::{Context, Result};
use credvault::api::{build_integrations_state, create_integrations_router};
use credvault::config::VaultConfig;
use credvault::credentials::Codec;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credvault=info".into()),
        )
        .init();

    info!("credvault starting...");

    let config_path = std::env::var("CREDVAULT_CONFIG").ok();
    let config = VaultConfig::load(config_path.as_deref())?;

    let encryption_key = std::env::var("CREDVAULT_ENCRYPTION_KEY")
        .context("CREDVAULT_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;
    let codec = Codec::new(&encryption_key).context("Invalid CREDVAULT_ENCRYPTION_KEY")?;

    if !config.auth.enabled {
        warn!("Identity checks disabled, every request acts as the default user");
    }

    info!(
        bind_addr = %config.server.bind_addr,
        callback_base_url = %config.server.callback_base_url,
        credentials_db = %config.storage.credentials_db,
        session_backend = ?config.storage.session_backend,
        "Configuration loaded"
    );

    let state = build_integrations_state(&config, codec)
        .context("Failed to initialize credential services")?;

    let configured: Vec<&str> = credvault::providers::Provider::ALL
        .iter()
        .filter(|p| state.providers.is_configured(**p))
        .map(|p| p.as_str())
        .collect();
    info!(providers = ?configured, "Providers configured");

    let router = create_integrations_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "credvault listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!("credvault stopped");

    Ok(())
}
