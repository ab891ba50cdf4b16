//! Authorization-code handshake, refresh and revocation against providers.
//!
//! Implements the browser-mediated flow:
//! 1. User clicks "Connect" in the app
//! 2. GET /integrations/:provider → session saved, redirect to provider
//! 3. User authorizes on the provider's site
//! 4. Provider redirects back to GET /integrations/:provider?code=..&state=..
//! 5. Session taken, state checked, code exchanged, credential stored
//! 6. User lands back on the page that started the flow

mod exchange;
mod handshake;
mod pkce;
mod refresh;
mod revoke;
mod session;

pub use exchange::exchange_code;
pub use handshake::{append_query, describe_provider_error, CallbackParams, HandshakeCoordinator};
pub use pkce::{generate_state, s256_challenge, PkcePair};
pub use refresh::{RefreshDispatcher, TokenRefresher, DEFAULT_REFRESHED_LIFETIME_SECONDS};
pub use revoke::{HttpRevoker, TokenRevoker};
pub use session::{
    open_session_store, HandshakeSession, MemorySessionStore, SessionStore, SqliteSessionStore,
};
