//! In-memory cache of tool descriptors, keyed by server.
//!
//! Populated once per session right after the handshake, invalidated when
//! the session terminates. The call path uses it only to resolve per-tool
//! timeouts; existence of a tool is the child's call to make.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

/// Fallback per-call timeout when neither tool nor server declares one.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// One cached tool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub server: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    /// Per-call timeout in milliseconds, when the server declares one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Append-once, per-session table of `{server → [tool]}`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Vec<ToolDescriptor>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a session's tool list, replacing anything cached for it.
    pub async fn publish(&self, server: &str, tools: Vec<ToolDescriptor>) {
        tracing::info!(server = %server, tool_count = tools.len(), "tools published");
        self.tools.write().await.insert(server.to_string(), tools);
    }

    /// Drop the cache for a terminated session.
    pub async fn invalidate(&self, server: &str) {
        self.tools.write().await.remove(server);
    }

    /// All cached tools across servers, ordered by server then tool name.
    pub async fn all(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().await;
        let mut flattened: Vec<ToolDescriptor> =
            tools.values().flat_map(|list| list.iter().cloned()).collect();
        flattened.sort_by(|a, b| (a.server.as_str(), a.name.as_str()).cmp(&(b.server.as_str(), b.name.as_str())));
        flattened
    }

    /// Look up one tool.
    pub async fn lookup(&self, server: &str, tool: &str) -> Option<ToolDescriptor> {
        self.tools
            .read()
            .await
            .get(server)?
            .iter()
            .find(|t| t.name == tool)
            .cloned()
    }

    /// Resolve the timeout budget for one call.
    pub async fn timeout_for(&self, server: &str, tool: &str) -> Duration {
        match self.lookup(server, tool).await {
            Some(descriptor) => descriptor
                .timeout
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TOOL_TIMEOUT),
            None => DEFAULT_TOOL_TIMEOUT,
        }
    }
}
