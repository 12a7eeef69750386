//! Application lifecycle: initialization, listener orchestration, and
//! orderly shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use chrono::Utc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::auth::{CredentialStore, RateLimiter};
use crate::config::{Config, HospitalEntry};
use crate::registry::TunnelRegistry;
use crate::state::AppState;
use crate::{admin, http, tls};

/// Bound on the drain of in-flight requests at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the full application lifecycle after config has been parsed.
pub async fn run(mut config: Config, hospitals: Vec<HospitalEntry>) -> anyhow::Result<()> {
    config.domain = config.domain.to_lowercase();
    config.validate()?;
    init_tracing(&config);

    let credentials = CredentialStore::load(&hospitals, &config.domain)?;
    if credentials.is_empty() {
        warn!("no hospitals configured; every registration will be rejected");
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        domain = %config.domain,
        hospitals = credentials.len(),
        "medlink-relay starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let rate_limiter = Arc::new(RateLimiter::new());
    let state = Arc::new(AppState {
        config: Arc::new(config),
        credentials,
        registry: TunnelRegistry::new(),
        rate_limiter: Arc::clone(&rate_limiter),
        shutdown: shutdown_rx.clone(),
        started_at: Utc::now(),
    });

    let gc_task = RateLimiter::spawn_gc(Arc::clone(&rate_limiter), shutdown_rx.clone());

    let admin_state = Arc::clone(&state);
    let admin_shutdown = shutdown_rx.clone();
    let admin_task = tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_state, admin_shutdown).await {
            error!(error = %e, "admin endpoint failed");
        }
    });

    // Primary listener, TLS per config mode, with a graceful handle.
    let handle = Handle::new();
    let app = http::router(Arc::clone(&state))
        .into_make_service_with_connect_info::<SocketAddr>();
    let listen_addr = state.config.listen_addr;

    let mut acme_driver = None;
    let mut redirect_task = None;
    let server_task = if state.config.tls_enabled {
        let (rustls_config, driver) =
            tls::make_tls_config(&state.config, &state.credentials).await?;
        acme_driver = driver;

        let redirect_handle = handle.clone();
        let redirect_addr = state.config.http_addr;
        let domain = state.config.domain.clone();
        redirect_task = Some(tokio::spawn(async move {
            if let Err(e) = tls::serve_redirect(redirect_addr, domain, redirect_handle).await {
                error!(error = %e, "redirect listener failed");
            }
        }));

        info!(addr = %listen_addr, "public listener (TLS)");
        let server_handle = handle.clone();
        tokio::spawn(async move {
            axum_server::bind_rustls(listen_addr, rustls_config)
                .handle(server_handle)
                .serve(app)
                .await
        })
    } else {
        info!(addr = %listen_addr, "public listener (plaintext, external TLS terminator)");
        let server_handle = handle.clone();
        tokio::spawn(async move {
            axum_server::bind(listen_addr)
                .handle(server_handle)
                .serve(app)
                .await
        })
    };

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(true);

    // Goodbye to connected edges; sessions observe the watch channel and
    // drain their own pending requests.
    for tunnel in state.registry.snapshot() {
        tunnel.begin_close("relay shutting down");
    }
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));

    if tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), server_task)
        .await
        .is_err()
    {
        warn!("public listener did not stop within the grace window");
    }
    if let Some(task) = redirect_task {
        task.abort();
    }
    if let Some(driver) = acme_driver {
        driver.abort();
    }
    gc_task.abort();
    let _ = tokio::time::timeout(Duration::from_secs(1), admin_task).await;

    info!("medlink-relay stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
