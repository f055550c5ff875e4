//! Error types for restexec operations.

use axum::http::StatusCode;
use thiserror::Error;

/// Main error type shared by the execution service and the MCP gateway.
#[derive(Error, Debug)]
pub enum RestexecError {
    /// A request field violated a validation rule
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Missing, malformed, or invalid credential
    #[error("{0}")]
    Unauthorized(String),

    /// Client IP is inside a rate-limit block
    #[error("too many failed authentication attempts, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// No artifact stored under the given code id
    #[error("no code found for id '{0}'")]
    FileNotFound(String),

    /// No MCP session configured under the given server name
    #[error("no MCP server named '{0}'")]
    ServerNotFound(String),

    /// Tool unknown to the named server
    #[error("server '{server}' has no tool '{tool}'")]
    ToolNotFound { server: String, tool: String },

    /// Supervisor deadline fired; the child was killed before this was returned
    #[error("execution '{id}' timed out after {timeout_ms}ms")]
    Timeout { id: String, timeout_ms: u64 },

    /// MCP call deadline fired
    #[error("call to '{server}' timed out after {timeout_ms}ms")]
    CallTimeout { server: String, timeout_ms: u64 },

    /// MCP session exists but is not currently serving calls
    #[error("server '{0}' is not running")]
    ServerNotRunning(String),

    /// MCP session is terminal-crashed
    #[error("server '{0}' has crashed")]
    ServerCrashed(String),

    /// A child stream exceeded the output cap; no partial output is kept
    #[error("execution '{id}' exceeded the {cap_bytes}-byte output limit on {stream}")]
    BufferOverflow {
        id: String,
        stream: &'static str,
        cap_bytes: usize,
    },

    /// The child interpreter could not be started
    #[error("failed to start interpreter: {0}")]
    SpawnFailure(String),

    /// Child exited non-zero, was killed by a signal, or produced unparseable
    /// lint output
    #[error("{message}")]
    Execution {
        message: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },

    /// MCP tool returned error content
    #[error("tool '{tool}' on '{server}' failed: {message}")]
    ToolExecution {
        server: String,
        tool: String,
        message: String,
    },

    /// Invalid configuration for a named field — startup-time only
    #[error("invalid config for '{0}': {1}")]
    InvalidConfig(String, String),

    /// Duplicate MCP server name found in config
    #[error("duplicate server name: {0}")]
    DuplicateServer(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl RestexecError {
    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::FileNotFound(_) | Self::ServerNotFound(_) | Self::ToolNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Self::CallTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ServerNotRunning(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServerCrashed(_) => StatusCode::BAD_GATEWAY,
            Self::BufferOverflow { .. }
            | Self::SpawnFailure(_)
            | Self::Execution { .. }
            | Self::ToolExecution { .. }
            | Self::InvalidConfig(..)
            | Self::DuplicateServer(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Discriminant used in the execution service's error envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::Unauthorized(_) => "UnauthorizedError",
            Self::RateLimited { .. } => "RateLimitError",
            Self::FileNotFound(_) => "FileNotFoundError",
            Self::ServerNotFound(_) => "ServerNotFoundError",
            Self::ToolNotFound { .. } => "ToolNotFoundError",
            Self::Timeout { .. } | Self::CallTimeout { .. } => "TimeoutError",
            Self::ServerNotRunning(_) => "ServerNotRunningError",
            Self::ServerCrashed(_) => "ServerCrashedError",
            Self::BufferOverflow { .. } | Self::SpawnFailure(_) | Self::Execution { .. } => {
                "ExecutionError"
            }
            Self::ToolExecution { .. } => "ToolExecutionError",
            Self::InvalidConfig(..) | Self::DuplicateServer(_) | Self::Internal(_) => {
                "InternalError"
            }
        }
    }

    /// Stable code used in the gateway's error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::ServerNotFound(_) => "SERVER_NOT_FOUND",
            Self::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            Self::Timeout { .. } | Self::CallTimeout { .. } => "TIMEOUT",
            Self::ServerNotRunning(_) => "SERVER_NOT_RUNNING",
            Self::ServerCrashed(_) => "SERVER_CRASHED",
            Self::BufferOverflow { .. } | Self::SpawnFailure(_) | Self::Execution { .. } => {
                "EXECUTION_ERROR"
            }
            Self::ToolExecution { .. } => "TOOL_EXECUTION_ERROR",
            Self::InvalidConfig(..) | Self::DuplicateServer(_) | Self::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Whether the failure is attributable to the client (logged at warn)
    /// rather than to the service or a child process (logged at error).
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Structured details attached to the error envelope, when the variant
    /// carries any beyond its message.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Validation { field, .. } => Some(serde_json::json!({ "field": field })),
            Self::RateLimited { retry_after_secs } => {
                Some(serde_json::json!({ "retryAfterSecs": retry_after_secs }))
            }
            Self::Execution {
                exit_code,
                signal,
                stderr,
                ..
            } => Some(serde_json::json!({
                "exitCode": exit_code,
                "signal": signal,
                "stderr": stderr,
            })),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RestexecError {
    fn from(e: std::io::Error) -> Self {
        RestexecError::Internal(e.to_string())
    }
}

/// Result type alias for restexec operations
pub type Result<T> = std::result::Result<T, RestexecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display_and_status() {
        let err = RestexecError::Validation {
            field: "codeId".to_string(),
            message: "must match [A-Za-z0-9_-]+".to_string(),
        };
        assert_eq!(err.to_string(), "invalid codeId: must match [A-Za-z0-9_-]+");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type(), "ValidationError");
    }

    #[test]
    fn test_timeout_maps_to_408_on_exec_and_504_on_gateway() {
        let exec = RestexecError::Timeout {
            id: "hello".to_string(),
            timeout_ms: 200,
        };
        assert_eq!(exec.status(), StatusCode::REQUEST_TIMEOUT);

        let call = RestexecError::CallTimeout {
            server: "gh".to_string(),
            timeout_ms: 30_000,
        };
        assert_eq!(call.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(call.code(), "TIMEOUT");
    }

    #[test]
    fn test_server_not_found_code() {
        let err = RestexecError::ServerNotFound("x".to_string());
        assert_eq!(err.code(), "SERVER_NOT_FOUND");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_overflow_is_an_execution_error() {
        let err = RestexecError::BufferOverflow {
            id: "big".to_string(),
            stream: "stdout",
            cap_bytes: 10 * 1024 * 1024,
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error_type(), "ExecutionError");
    }

    #[test]
    fn test_client_vs_server_attribution() {
        assert!(RestexecError::FileNotFound("a".into()).is_client_error());
        assert!(RestexecError::Unauthorized("no credential".into()).is_client_error());
        assert!(!RestexecError::SpawnFailure("enoent".into()).is_client_error());
    }

    #[test]
    fn test_messages_never_leak_paths() {
        let err = RestexecError::FileNotFound("hello".to_string());
        assert!(err.details().is_none());
        assert!(!err.to_string().contains('/'));
    }
}
