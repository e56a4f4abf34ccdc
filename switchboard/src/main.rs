//! Gateway entry point.
//!
//! Startup sequence: tracing, CLI, configuration (abort on any violation),
//! backend registry, session and token housekeeping, then the HTTP server.
//! Shutdown is the reverse: stop accepting requests, cancel the shared
//! token, and wait for supervisors to tear their children down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use switchboard::auth::AuthState;
use switchboard::backend::Registry;
use switchboard::cli::Cli;
use switchboard::gateway::{BackendRouter, Gateway};
use switchboard::http::{AppState, build_router};
use switchboard::rate_limit::PerIpRateLimiter;
use switchboard::session::SessionManager;
use switchboard_core::config;

/// How long to wait for supervisors to finish tearing down children.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "configuration invalid, refusing to start");
            eprintln!("switchboard: {e}");
            std::process::exit(1);
        }
    };

    let bind_addr = config.bind_addr();
    let shutdown = CancellationToken::new();

    // Backends.
    let registry = Registry::new(config.backends.clone(), shutdown.clone());
    let supervisor_handles = registry.start();
    info!(
        backends = config.backends.len(),
        "backend supervisors started"
    );

    // Auth, sessions, rate limiting.
    let auth = AuthState::new(&config.auth, config.issuer.clone());
    auth.tokens.spawn_sweeper(shutdown.clone());

    let sessions = SessionManager::new(config.session_idle_timeout());
    sessions.spawn_sweeper(shutdown.clone());

    let rate = PerIpRateLimiter::new(&config.rate_limit);
    rate.spawn_cleanup_task(shutdown.clone());

    let gateway = Arc::new(Gateway::new(
        registry.clone() as Arc<dyn BackendRouter>,
        config.call_timeout(),
    ));

    let state = AppState {
        gateway,
        registry,
        sessions,
        auth,
        rate,
    };
    let router = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind");
            eprintln!("switchboard: failed to bind {bind_addr}: {e}");
            std::process::exit(1);
        }
    };
    info!(addr = %bind_addr, "gateway listening");

    let serve_shutdown = shutdown.clone();
    let result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
            }
            _ = serve_shutdown.cancelled() => {}
        }
    })
    .await;

    if let Err(e) = result {
        error!(error = %e, "server error");
    }

    // Cancel everything and give supervisors time to stop children.
    shutdown.cancel();
    let teardown = async {
        for handle in supervisor_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_WAIT, teardown).await.is_err() {
        error!("backend teardown timed out");
    }
    info!("shutdown complete");
}

/// Tracing to stderr. Filter precedence: `--verbose`, then
/// `SWITCHBOARD_LOG`, then `RUST_LOG`, then `info`.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else if let Ok(spec) = std::env::var(config::ENV_LOG) {
        EnvFilter::new(spec)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
