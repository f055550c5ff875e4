//! HTTP surface for the MCP gateway.
//!
//! Routes: `POST /mcp/call`, `GET /mcp/tools`, and the always-public
//! `GET /health`. Call input gets defense-in-depth validation — nesting
//! depth, payload size, forbidden keys — before it is allowed anywhere near
//! a child process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::Value;

use crate::auth::rate_limit::RateLimiter;
use crate::auth::{AuthSettings, Authenticator, client_ip};
use crate::error::{RestexecError, Result};
use crate::gateway::registry::ToolRegistry;
use crate::gateway::session::{SessionManager, SessionStatus};

/// Body cap for gateway requests.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Maximum JSON nesting depth accepted in tool input.
const MAX_INPUT_DEPTH: usize = 10;

/// Object keys rejected anywhere in tool input.
const FORBIDDEN_INPUT_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Shared state for gateway routes.
#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<SessionManager>,
    pub registry: Arc<ToolRegistry>,
    pub authenticator: Arc<Authenticator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth_settings: Arc<AuthSettings>,
    pub started_at: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CallRequest {
    server: String,
    tool_name: String,
    #[serde(default = "empty_object")]
    input: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Map an error to the gateway's envelope: `{success: false, error: {code,
/// message, details?}}`.
pub fn error_response(err: &RestexecError) -> Response {
    if err.is_client_error() {
        tracing::warn!(error = %err, code = err.code(), "gateway request failed");
    } else {
        tracing::error!(error = %err, code = err.code(), "gateway request failed");
    }

    let mut error_body = serde_json::json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let Some(details) = err.details() {
        error_body["details"] = details;
    }
    let mut response = (
        err.status(),
        Json(serde_json::json!({"success": false, "error": error_body})),
    )
        .into_response();
    if let RestexecError::RateLimited { retry_after_secs } = err {
        if let Ok(value) = retry_after_secs.to_string().parse() {
            response.headers_mut().insert("Retry-After", value);
        }
    }
    response
}

/// Guard middleware: rate-limit block check, then bearer verification.
async fn guard(State(state): State<GatewayState>, request: Request<Body>, next: Next) -> Response {
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
        state.auth_settings.rate_limit.trust_proxy,
        &state.auth_settings.trusted_proxies,
    );

    if let Err(err) = state.rate_limiter.check(client_ip).await {
        return error_response(&err);
    }

    let authorization = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Err(err) = state.authenticator.verify(authorization) {
        state.rate_limiter.record_failure(client_ip).await;
        return error_response(&err);
    }

    next.run(request).await
}

/// `POST /mcp/call`
async fn call_tool(State(state): State<GatewayState>, body: Bytes) -> Response {
    match handle_call(&state, &body).await {
        Ok(result) => (
            StatusCode::OK,
            Json(serde_json::json!({"success": true, "result": result})),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_call(state: &GatewayState, body: &Bytes) -> Result<Value> {
    let request: CallRequest = serde_json::from_slice(body).map_err(|e| {
        RestexecError::Validation {
            field: "body".to_string(),
            message: format!("request body is not valid JSON for this route: {e}"),
        }
    })?;
    validate_call_request(&request)?;
    state
        .manager
        .call(&request.server, &request.tool_name, request.input)
        .await
}

/// `GET /mcp/tools`
async fn list_tools(State(state): State<GatewayState>) -> Response {
    let tools = state.registry.all().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "tools": tools})),
    )
        .into_response()
}

/// `GET /health` — public, reports per-server session states.
async fn health(State(state): State<GatewayState>) -> Response {
    let statuses = state.manager.statuses();
    let degraded = statuses
        .values()
        .any(|status| *status != SessionStatus::Available);
    let servers: serde_json::Map<String, Value> = statuses
        .into_iter()
        .map(|(name, status)| (name, Value::String(health_state_str(status).to_string())))
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": if degraded { "degraded" } else { "ok" },
            "uptime": state.started_at.elapsed().as_secs(),
            "servers": servers,
        })),
    )
        .into_response()
}

/// Session state as surfaced by `/health`; a still-starting session is
/// simply not available yet.
fn health_state_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Available => "available",
        SessionStatus::Starting | SessionStatus::Unavailable => "unavailable",
        SessionStatus::Crashed => "crashed",
    }
}

fn validate_call_request(request: &CallRequest) -> Result<()> {
    let validation = |field: &str, message: &str| RestexecError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    };

    if request.server.is_empty() || request.server.len() > 50 {
        return Err(validation("server", "must be 1-50 characters"));
    }
    if request.tool_name.is_empty() || request.tool_name.len() > 128 {
        return Err(validation("toolName", "must be 1-128 characters"));
    }
    if !request.input.is_object() {
        return Err(validation("input", "must be a JSON object"));
    }
    if json_depth(&request.input) > MAX_INPUT_DEPTH {
        return Err(validation(
            "input",
            "exceeds the maximum nesting depth of 10",
        ));
    }
    if let Some(key) = find_forbidden_key(&request.input) {
        return Err(RestexecError::Validation {
            field: "input".to_string(),
            message: format!("key '{key}' is not permitted"),
        });
    }
    Ok(())
}

fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        _ => 1,
    }
}

fn find_forbidden_key(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if FORBIDDEN_INPUT_KEYS.contains(&key.as_str()) {
                    return Some(key.as_str());
                }
                if let Some(found) = find_forbidden_key(child) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(find_forbidden_key),
        _ => None,
    }
}

/// Assemble the gateway router.
pub fn router(state: GatewayState) -> axum::Router {
    let protected = axum::Router::new()
        .route("/mcp/call", post(call_tool))
        .route("/mcp/tools", get(list_tools))
        .layer(middleware::from_fn_with_state(state.clone(), guard))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    axum::Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}
