//! Linting of stored artifacts through the interpreter's lint subcommand.
//!
//! Shares the supervisor spawn framework with the executor. Exit codes 0
//! (clean) and 1 (findings) both mean the lint ran; the structured JSON on
//! stdout is the report either way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;
use crate::counter::ActiveProcessCounter;
use crate::error::{RestexecError, Result};
use crate::supervisor::{self, RunSpec};
use crate::workspace::WorkspaceStore;

/// Structured lint report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LintReport {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub diagnostics: Vec<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
    #[serde(default)]
    pub checked_files: Vec<String>,
}

fn default_version() -> u32 {
    1
}

impl Default for LintReport {
    fn default() -> Self {
        Self {
            version: 1,
            diagnostics: Vec::new(),
            errors: Vec::new(),
            checked_files: Vec::new(),
        }
    }
}

/// Lints stored artifacts in interpreter subprocesses.
pub struct Linter {
    config: Arc<ServiceConfig>,
    workspace: WorkspaceStore,
    counter: ActiveProcessCounter,
}

impl Linter {
    pub fn new(
        config: Arc<ServiceConfig>,
        workspace: WorkspaceStore,
        counter: ActiveProcessCounter,
    ) -> Self {
        Self {
            config,
            workspace,
            counter,
        }
    }

    /// Lint the artifact stored under `code_id`.
    pub async fn lint(&self, code_id: &str, timeout_ms: Option<u64>) -> Result<LintReport> {
        if !self.workspace.exists(code_id).await {
            return Err(RestexecError::FileNotFound(code_id.to_string()));
        }

        let timeout_ms = timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let spec = RunSpec {
            id: code_id.to_string(),
            command: self.config.deno_bin.clone(),
            args: self.build_args(code_id),
            cwd: None,
            env: system_env(),
            timeout: Duration::from_millis(timeout_ms),
            stream_cap_bytes: self.config.stream_cap_bytes,
            kill_grace: self.config.kill_grace,
        };

        tracing::info!(
            code_id = %code_id,
            timeout_ms,
            active = self.counter.current(),
            "linting artifact"
        );
        let output = supervisor::run(spec, &self.counter).await?;

        match output.exit_code {
            Some(0) | Some(1) => parse_lint_output(&output.stdout),
            _ => Err(RestexecError::Execution {
                message: match output.signal {
                    Some(signal) => format!("lint terminated by signal {signal}"),
                    None => format!(
                        "lint failed with exit code {}",
                        output.exit_code.unwrap_or(-1)
                    ),
                },
                exit_code: output.exit_code,
                signal: output.signal,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    pub(crate) fn build_args(&self, code_id: &str) -> Vec<String> {
        vec![
            "lint".to_string(),
            "--json".to_string(),
            self.workspace.path_for(code_id).to_string_lossy().into_owned(),
        ]
    }
}

/// Lint children get only the system env: interpreter location and cache.
fn system_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Ok(path) = std::env::var("PATH") {
        env.insert("PATH".to_string(), path);
    }
    if let Ok(cache_dir) = std::env::var("DENO_DIR") {
        env.insert("DENO_DIR".to_string(), cache_dir);
    }
    env
}

/// Parse the lint subcommand's stdout.
///
/// Empty stdout normalizes to an empty report; malformed JSON is a fault of
/// the lint run, not a finding.
pub fn parse_lint_output(stdout: &str) -> Result<LintReport> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(LintReport::default());
    }
    serde_json::from_str(trimmed).map_err(|e| RestexecError::Execution {
        message: format!("lint output was not valid JSON: {e}"),
        exit_code: None,
        signal: None,
        stderr: String::new(),
    })
}
