//! MCP gateway: multiplexes RPC calls across a fleet of long-lived child
//! processes speaking line-delimited JSON-RPC on stdio.

pub mod config;
pub mod http;
pub mod registry;
pub mod rpc;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::auth::rate_limit::{self, RateLimiter};
use crate::auth::{AuthSettings, Authenticator};
use crate::error::{RestexecError, Result};
use config::GatewaySettings;
use http::GatewayState;
use registry::ToolRegistry;
use session::SessionManager;

/// Bind and serve the gateway until the cancellation token fires.
///
/// All configured sessions are spawned before the listener binds; child
/// processes are terminated as the session tasks observe the token during
/// shutdown.
pub async fn run(
    settings: GatewaySettings,
    auth: AuthSettings,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let registry = Arc::new(ToolRegistry::new());
    let manager = Arc::new(SessionManager::start(
        &settings,
        registry.clone(),
        cancel.child_token(),
    ));
    let authenticator = Arc::new(Authenticator::new(&auth)?);
    let rate_limiter = Arc::new(RateLimiter::new(auth.rate_limit.clone()));

    tokio::spawn(rate_limit::run_sweeper(
        rate_limiter.clone(),
        cancel.child_token(),
    ));

    let state = GatewayState {
        manager: manager.clone(),
        registry,
        authenticator,
        rate_limiter,
        auth_settings: Arc::new(auth),
        started_at: Instant::now(),
    };
    let app = http::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RestexecError::Internal(format!("failed to bind {addr}: {e}")))?;

    tracing::info!(%addr, servers = manager.statuses().len(), "MCP gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await
    .map_err(|e| RestexecError::Internal(format!("gateway error: {e}")))?;

    manager.shutdown();
    tracing::info!("MCP gateway stopped");
    Ok(())
}
