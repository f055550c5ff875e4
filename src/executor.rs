//! Execution of stored artifacts through the sandboxed interpreter.
//!
//! Builds the child argv from central config — read/write/network
//! allowlists, the import map, never subprocess access — composes the child
//! environment under the system-keys-win rule, runs the supervisor, and
//! parses the child's stdout into the response value.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServiceConfig;
use crate::counter::ActiveProcessCounter;
use crate::error::{RestexecError, Result};
use crate::supervisor::{self, RunSpec};
use crate::validate::{FORBIDDEN_ENV_KEYS, RESERVED_ENV_PREFIX};
use crate::workspace::WorkspaceStore;

/// Parsed outcome of a completed execution.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// Parsed JSON from stdout, a raw-string wrapper, or null for no output.
    pub result: serde_json::Value,
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub elapsed: Duration,
}

/// Runs stored artifacts in permissioned interpreter subprocesses.
pub struct Executor {
    config: Arc<ServiceConfig>,
    workspace: WorkspaceStore,
    counter: ActiveProcessCounter,
}

impl Executor {
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

    /// Execute the artifact stored under `code_id`.
    ///
    /// `timeout_ms` is already validated against the configured maximum;
    /// absent means the configured default. `env` is already validated.
    pub async fn execute(
        &self,
        code_id: &str,
        timeout_ms: Option<u64>,
        env: &HashMap<String, String>,
    ) -> Result<ExecutionOutcome> {
        if !self.workspace.exists(code_id).await {
            return Err(RestexecError::FileNotFound(code_id.to_string()));
        }

        let timeout_ms = timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let spec = RunSpec {
            id: code_id.to_string(),
            command: self.config.deno_bin.clone(),
            args: self.build_args(code_id, env),
            cwd: None,
            env: compose_child_env(env),
            timeout: Duration::from_millis(timeout_ms),
            stream_cap_bytes: self.config.stream_cap_bytes,
            kill_grace: self.config.kill_grace,
        };

        tracing::info!(
            code_id = %code_id,
            timeout_ms,
            active = self.counter.current(),
            "executing artifact"
        );
        let output = supervisor::run(spec, &self.counter).await?;

        if output.exit_code != Some(0) || output.signal.is_some() {
            let message = match output.signal {
                Some(signal) => format!("execution terminated by signal {signal}"),
                None => format!(
                    "execution failed with exit code {}",
                    output.exit_code.unwrap_or(-1)
                ),
            };
            return Err(RestexecError::Execution {
                message,
                exit_code: output.exit_code,
                signal: output.signal,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(ExecutionOutcome {
            result: parse_execution_output(&output.stdout),
            exit_code: output.exit_code.unwrap_or(0),
            signal: output.signal,
            elapsed: output.elapsed,
        })
    }

    /// Build the interpreter argv for one execution.
    ///
    /// Subprocess access is never granted; the env flag appears only when
    /// the request carried env at all, scoped to the user keys plus the
    /// system keys the runtime needs.
    pub(crate) fn build_args(&self, code_id: &str, env: &HashMap<String, String>) -> Vec<String> {
        let workspace = self.config.workspace_dir.to_string_lossy().into_owned();
        let tools = self.config.tools_dir.to_string_lossy().into_owned();

        let mut args = vec![
            "run".to_string(),
            "--quiet".to_string(),
            "--no-prompt".to_string(),
            format!("--allow-read={workspace},{tools}"),
        ];
        if !self.config.allow_write.is_empty() {
            args.push(format!("--allow-write={}", self.config.allow_write.join(",")));
        }
        if !self.config.allow_net.is_empty() {
            args.push(format!("--allow-net={}", self.config.allow_net.join(",")));
        }
        if !env.is_empty() {
            args.push(format!("--allow-env={}", allowed_env_keys(env).join(",")));
        }
        args.push(format!(
            "--import-map={}",
            self.workspace.import_map_path().to_string_lossy()
        ));
        args.push(self.workspace.path_for(code_id).to_string_lossy().into_owned());
        args
    }
}

/// The env keys the child is allowed to read: user keys plus system keys.
fn allowed_env_keys(user_env: &HashMap<String, String>) -> Vec<String> {
    let mut keys: Vec<String> = user_env
        .keys()
        .filter(|k| !is_filtered_key(k))
        .cloned()
        .collect();
    keys.sort();
    keys.push("PATH".to_string());
    keys.push("DENO_DIR".to_string());
    keys
}

fn is_filtered_key(key: &str) -> bool {
    FORBIDDEN_ENV_KEYS.contains(&key) || key.starts_with(RESERVED_ENV_PREFIX)
}

/// Compose the child's full environment.
///
/// Start empty, merge the user map with forbidden and reserved-prefix keys
/// removed, then overwrite `PATH` and `DENO_DIR` from the parent process.
/// System values winning over user input is a security invariant, so the
/// filter runs here even though validation already rejected these keys.
pub fn compose_child_env(user_env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = user_env
        .iter()
        .filter(|(k, _)| !is_filtered_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if let Ok(path) = std::env::var("PATH") {
        env.insert("PATH".to_string(), path);
    }
    if let Ok(cache_dir) = std::env::var("DENO_DIR") {
        env.insert("DENO_DIR".to_string(), cache_dir);
    }
    env
}

/// Interpret trimmed child stdout.
///
/// Empty output is a null result. JSON parses as JSON; anything else is
/// wrapped as a raw string so human-readable output survives without being
/// misclassified as a failure.
pub fn parse_execution_output(stdout: &str) -> serde_json::Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(trimmed)
        .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
}
