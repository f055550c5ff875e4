//! HTTP surface for the execution service.
//!
//! Route table: `PUT /workspace`, `POST /lint`, `POST /execute`, and the
//! always-public `GET /health`. Everything except `/health` passes through
//! the guard middleware: rate-limit block check first, then bearer
//! verification, then the handler. The guard stamps a request-start instant
//! so error responses carry timing too.

pub mod health;
pub mod http;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use tokio_util::sync::CancellationToken;

use crate::auth::rate_limit::{self, RateLimiter};
use crate::auth::{Authenticator, client_ip};
use crate::config::ServiceConfig;
use crate::counter::ActiveProcessCounter;
use crate::error::{RestexecError, Result};
use crate::executor::Executor;
use crate::linter::Linter;
use crate::workspace::WorkspaceStore;

/// Body cap: a 10 MiB artifact plus JSON envelope overhead.
const MAX_BODY_BYTES: usize = 12 * 1024 * 1024;

/// Instant the guard middleware saw the request; handlers and the error
/// responder derive `executionTime` from it.
#[derive(Clone, Copy)]
pub struct RequestStart(pub Instant);

/// Shared state for all execution-service routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub workspace: WorkspaceStore,
    pub executor: Arc<Executor>,
    pub linter: Arc<Linter>,
    pub counter: ActiveProcessCounter,
    pub authenticator: Arc<Authenticator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub async fn from_config(config: ServiceConfig) -> Result<Self> {
        let config = Arc::new(config);
        let workspace = WorkspaceStore::new(config.workspace_dir.clone()).await?;
        let counter = ActiveProcessCounter::new();
        let executor = Arc::new(Executor::new(
            config.clone(),
            workspace.clone(),
            counter.clone(),
        ));
        let linter = Arc::new(Linter::new(
            config.clone(),
            workspace.clone(),
            counter.clone(),
        ));
        let authenticator = Arc::new(Authenticator::new(&config.auth)?);
        let rate_limiter = Arc::new(RateLimiter::new(config.auth.rate_limit.clone()));
        Ok(Self {
            config,
            workspace,
            executor,
            linter,
            counter,
            authenticator,
            rate_limiter,
            started_at: Instant::now(),
        })
    }
}

/// Guard middleware: client-IP resolution, rate-limit block check, bearer
/// verification. Failures are terminal here and never reach a handler.
async fn guard(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let t0 = Instant::now();

    let direct_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or_else(|| std::net::IpAddr::from([127, 0, 0, 1]));
    let forwarded_for = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let client_ip = client_ip::resolve_client_ip(
        direct_ip,
        forwarded_for,
        state.config.auth.rate_limit.trust_proxy,
        &state.config.auth.trusted_proxies,
    );

    if let Err(err) = state.rate_limiter.check(client_ip).await {
        tracing::warn!(client_ip = %client_ip, "request rejected by rate limiter");
        return http::error_response(&err, Some(elapsed_ms(t0)));
    }

    let authorization = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Err(err) = state.authenticator.verify(authorization) {
        state.rate_limiter.record_failure(client_ip).await;
        tracing::warn!(client_ip = %client_ip, "authentication failed");
        return http::error_response(&err, Some(elapsed_ms(t0)));
    }

    let mut request = request;
    request.extensions_mut().insert(RequestStart(t0));
    next.run(request).await
}

pub(crate) fn elapsed_ms(t0: Instant) -> u64 {
    t0.elapsed().as_millis() as u64
}

/// Assemble the execution-service router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/workspace", put(http::save_workspace))
        .route("/lint", post(http::lint))
        .route("/execute", post(http::execute))
        .layer(middleware::from_fn_with_state(state.clone(), guard))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    Router::new()
        .route("/health", get(health::health))
        .merge(protected)
        .with_state(state)
}

/// Bind and serve until the cancellation token fires.
///
/// Spawns the rate-limit sweeper alongside the listener; in-flight requests
/// get a graceful window on shutdown before the process exits.
pub async fn run(config: ServiceConfig, cancel: CancellationToken) -> Result<()> {
    let port = config.port;
    let state = AppState::from_config(config).await?;

    tokio::spawn(rate_limit::run_sweeper(
        state.rate_limiter.clone(),
        cancel.child_token(),
    ));

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RestexecError::Internal(format!("failed to bind {addr}: {e}")))?;

    tracing::info!(%addr, "execution service listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await
    .map_err(|e| RestexecError::Internal(format!("server error: {e}")))?;

    tracing::info!("execution service stopped");
    Ok(())
}
