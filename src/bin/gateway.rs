//! Gateway binary: config from environment, metrics recorder, WebSocket
//! server, and graceful state flush on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tom::gateway::{GatewayState, build_router};
use tom::rl::PolicyRouter;
use tom::{GatewayConfig, metrics};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::from_env();
    config.validate()?;

    let metrics_handle = metrics::install()?;
    let policy = PolicyRouter::from_config(&config.rl)?;

    let nonce_ttl = Duration::from_secs(config.auth.nonce_ttl_seconds);
    let grace = Duration::from_secs(config.session.grace_seconds);
    let listen = config.listen.addr.clone();
    let base_path = config.listen.base_path.clone();

    let state = GatewayState::new(config, policy, Some(metrics_handle));

    let background = CancellationToken::new();
    let sweeper = Arc::clone(&state.nonces).spawn_sweeper(nonce_ttl, background.clone());
    let purger = Arc::clone(&state.registry).spawn_purger(grace, background.clone());

    let policy_handle = Arc::clone(&state.policy);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("gateway listening on ws://{listen}/{base_path}/stream/{{call_id}}");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    server.await?;

    // Flush RL state before exit so no reward evidence is lost.
    background.cancel();
    let _ = tokio::join!(sweeper, purger);
    if let Err(e) = policy_handle
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .flush()
    {
        error!("failed to flush policy state: {e}");
    }

    info!("gateway shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("cannot install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("SIGINT received"),
        () = terminate => info!("SIGTERM received"),
    }
}
