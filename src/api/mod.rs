// HTTP API

pub mod integrations;

pub use integrations::{create_integrations_router, IntegrationsAppState};

use crate::config::VaultConfig;
use crate::credentials::{Codec, CredentialManager, CredentialStore};
use crate::error::Result;
use crate::oauth::{open_session_store, HandshakeCoordinator, HttpRevoker, RefreshDispatcher};
use crate::providers::ProviderRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Wires stores, coordinator and manager from configuration.
pub fn build_integrations_state(config: &VaultConfig, codec: Codec) -> Result<IntegrationsAppState> {
    let providers = Arc::new(ProviderRegistry::from_settings(&config.providers));
    let store = Arc::new(CredentialStore::new(&config.storage.credentials_db, codec)?);
    let sessions = open_session_store(&config.storage)?;
    let timeout = Duration::from_secs(config.refresh.timeout_seconds);

    let coordinator = HandshakeCoordinator::new(
        Arc::clone(&providers),
        sessions,
        Arc::clone(&store),
        &config.server.callback_base_url,
        config.handshake.session_ttl_seconds,
        timeout,
    )?;

    let manager = CredentialManager::new(
        Arc::clone(&store),
        Arc::new(RefreshDispatcher::new(Arc::clone(&providers), timeout)?),
        Arc::new(HttpRevoker::new(Arc::clone(&providers), timeout)?),
    )
    .with_stale_token_fallback(config.refresh.stale_token_fallback);

    Ok(IntegrationsAppState {
        coordinator: Arc::new(coordinator),
        manager: Arc::new(manager),
        providers,
        auth: config.auth.clone(),
        server: config.server.clone(),
    })
}
