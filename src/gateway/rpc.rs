//! JSON-RPC 2.0 framing for MCP sessions.
//!
//! The gateway speaks line-delimited JSON-RPC over child stdio and emits
//! only four methods: `initialize`, `tools/list`, `tools/call`, and `ping`
//! (plus the `notifications/initialized` notification). Frames are plain
//! serde structs; the session layer owns ids and routing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Outgoing request frame.
#[derive(Debug, Serialize)]
pub struct RequestFrame {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestFrame {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// Outgoing notification frame (no id, no response expected).
#[derive(Debug, Serialize)]
pub struct NotificationFrame {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl NotificationFrame {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params: None,
        }
    }
}

/// Error object inside a response frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Any frame read from the child's stdout.
///
/// A frame with a `method` is server-initiated (request or notification); a
/// frame with an `id` and `result`/`error` answers one of ours.
#[derive(Debug, Deserialize)]
pub struct IncomingFrame {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl IncomingFrame {
    /// The response id as an integer, when this frame answers a request.
    pub fn response_id(&self) -> Option<i64> {
        if self.method.is_some() {
            return None;
        }
        self.id.as_ref().and_then(Value::as_i64)
    }
}

/// What a completed request resolved to.
#[derive(Debug)]
pub enum RpcReply {
    Result(Value),
    Error(RpcError),
}

/// The `initialize` request parameters.
pub fn initialize_params(client_name: &str, client_version: &str) -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": client_version,
        },
    })
}

/// Extract the first text-content item from a `tools/call` result, or an
/// explicit description of the first non-text variant. Nothing is dropped
/// silently.
pub fn first_text_content(result: &Value) -> Option<String> {
    let items = result.get("content")?.as_array()?;
    for item in items {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    return Some(text.to_string());
                }
            }
            Some(other) => return Some(format!("[{other} content]")),
            None => continue,
        }
    }
    None
}

/// Whether a `tools/call` result is flagged as an error by the server.
pub fn is_error_result(result: &Value) -> bool {
    result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_wire_shape() {
        let frame = RequestFrame::new(7, "tools/list", None);
        let wire = serde_json::to_string(&frame).unwrap();
        assert_eq!(wire, r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#);
    }

    #[test]
    fn test_request_frame_with_params() {
        let frame = RequestFrame::new(
            1,
            "tools/call",
            Some(serde_json::json!({"name": "echo", "arguments": {}})),
        );
        let wire = serde_json::to_string(&frame).unwrap();
        assert!(wire.starts_with(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","#));
        assert!(wire.contains(r#""name":"echo""#));
    }

    #[test]
    fn test_notification_has_no_id() {
        let frame = NotificationFrame::new("notifications/initialized");
        let wire = serde_json::to_string(&frame).unwrap();
        assert!(!wire.contains("\"id\""));
    }

    #[test]
    fn test_incoming_response_routing_id() {
        let frame: IncomingFrame =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#).unwrap();
        assert_eq!(frame.response_id(), Some(3));
        assert!(frame.result.is_some());
    }

    #[test]
    fn test_incoming_server_request_is_not_a_response() {
        let frame: IncomingFrame =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#).unwrap();
        assert_eq!(frame.response_id(), None);
    }

    #[test]
    fn test_incoming_error_frame() {
        let frame: IncomingFrame = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"Unknown tool: y"}}"#,
        )
        .unwrap();
        assert_eq!(frame.response_id(), Some(4));
        assert_eq!(frame.error.unwrap().code, -32601);
    }

    #[test]
    fn test_first_text_content_picks_text() {
        let result = serde_json::json!({
            "content": [{"type": "text", "text": "hello"}],
            "isError": true,
        });
        assert_eq!(first_text_content(&result), Some("hello".to_string()));
        assert!(is_error_result(&result));
    }

    #[test]
    fn test_first_text_content_reports_non_text_variants() {
        let result = serde_json::json!({
            "content": [{"type": "image", "data": "...", "mimeType": "image/png"}],
        });
        assert_eq!(first_text_content(&result), Some("[image content]".to_string()));
        assert!(!is_error_result(&result));
    }

    #[test]
    fn test_first_text_content_empty() {
        let result = serde_json::json!({"content": []});
        assert_eq!(first_text_content(&result), None);
    }
}
