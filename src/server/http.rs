//! Route handlers and response envelopes for the execution service.
//!
//! Every body has the discriminated shape `{success: true, result, ...}` or
//! `{success: false, error: {type, message, details?}, ...}`; errors carry
//! `executionTime` too when a request-start instant is available.

use std::collections::HashMap;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use super::{AppState, RequestStart, elapsed_ms};
use crate::error::{RestexecError, Result};
use crate::validate::{extract_fenced_code, validate_code, validate_code_id, validate_env,
    validate_timeout};
use crate::workspace::SavedArtifact;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SaveRequest {
    code_id: String,
    code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LintRequest {
    code_id: String,
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ExecuteRequest {
    code_id: String,
    timeout: Option<u64>,
    env: Option<HashMap<String, String>>,
}

#[derive(Serialize)]
struct ErrorInfo {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    success: bool,
    error: ErrorInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution_time: Option<u64>,
}

fn success_response<T: Serialize>(result: T, execution_time: u64) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "result": result,
            "executionTime": execution_time,
        })),
    )
        .into_response()
}

/// Map an error to its HTTP response, logging it with client/server
/// attribution. Rate-limit rejections carry a `Retry-After` header.
pub fn error_response(err: &RestexecError, execution_time: Option<u64>) -> Response {
    if err.is_client_error() {
        tracing::warn!(error = %err, kind = err.error_type(), "request failed");
    } else {
        tracing::error!(error = %err, kind = err.error_type(), "request failed");
    }

    let body = ErrorEnvelope {
        success: false,
        error: ErrorInfo {
            kind: err.error_type(),
            message: err.to_string(),
            details: err.details(),
        },
        execution_time,
    };
    let mut response = (err.status(), Json(body)).into_response();
    if let RestexecError::RateLimited { retry_after_secs } = err {
        if let Ok(value) = retry_after_secs.to_string().parse() {
            response.headers_mut().insert("Retry-After", value);
        }
    }
    response
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| RestexecError::Validation {
        field: "body".to_string(),
        message: format!("request body is not valid JSON for this route: {e}"),
    })
}

/// `PUT /workspace` — save (or overwrite) a code artifact.
pub async fn save_workspace(
    State(state): State<AppState>,
    Extension(RequestStart(t0)): Extension<RequestStart>,
    body: Bytes,
) -> Response {
    let outcome = handle_save(&state, &body).await;
    match outcome {
        Ok(saved) => success_response(saved, elapsed_ms(t0)),
        Err(err) => error_response(&err, Some(elapsed_ms(t0))),
    }
}

async fn handle_save(state: &AppState, body: &Bytes) -> Result<SavedArtifact> {
    let request: SaveRequest = parse_body(body)?;
    validate_code_id(&request.code_id)?;
    let code = extract_fenced_code(&request.code);
    validate_code(code)?;
    state.workspace.save(&request.code_id, code).await
}

/// `POST /lint` — lint a saved artifact.
pub async fn lint(
    State(state): State<AppState>,
    Extension(RequestStart(t0)): Extension<RequestStart>,
    body: Bytes,
) -> Response {
    let outcome = handle_lint(&state, &body).await;
    match outcome {
        Ok(report) => success_response(report, elapsed_ms(t0)),
        Err(err) => error_response(&err, Some(elapsed_ms(t0))),
    }
}

async fn handle_lint(state: &AppState, body: &Bytes) -> Result<crate::linter::LintReport> {
    let request: LintRequest = parse_body(body)?;
    validate_code_id(&request.code_id)?;
    if let Some(timeout) = request.timeout {
        validate_timeout(timeout, state.config.max_timeout_ms)?;
    }
    state.linter.lint(&request.code_id, request.timeout).await
}

/// `POST /execute` — run a saved artifact.
pub async fn execute(
    State(state): State<AppState>,
    Extension(RequestStart(t0)): Extension<RequestStart>,
    body: Bytes,
) -> Response {
    match handle_execute(&state, &body).await {
        Ok(outcome) => success_response(outcome.result, outcome.elapsed.as_millis() as u64),
        Err(err) => error_response(&err, Some(elapsed_ms(t0))),
    }
}

async fn handle_execute(
    state: &AppState,
    body: &Bytes,
) -> Result<crate::executor::ExecutionOutcome> {
    let request: ExecuteRequest = parse_body(body)?;
    validate_code_id(&request.code_id)?;
    if let Some(timeout) = request.timeout {
        validate_timeout(timeout, state.config.max_timeout_ms)?;
    }
    let env = request.env.unwrap_or_default();
    validate_env(&env)?;
    state
        .executor
        .execute(&request.code_id, request.timeout, &env)
        .await
}
