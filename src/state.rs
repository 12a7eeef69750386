//! Shared application state passed to all subsystems.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::auth::{CredentialStore, RateLimiter};
use crate::config::Config;
use crate::registry::TunnelRegistry;

/// Central application state shared by listeners, sessions, and routers.
pub struct AppState {
    pub config: Arc<Config>,
    /// Static hospital credential set, read-only at runtime.
    pub credentials: CredentialStore,
    /// Live tunnels by hospital code.
    pub registry: TunnelRegistry,
    /// Registration brute-force limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// Flips once at shutdown; observed by sessions and request tasks.
    pub shutdown: watch::Receiver<bool>,
    pub started_at: DateTime<Utc>,
}
