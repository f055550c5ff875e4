//! Gateway configuration — YAML deserialization, env interpolation, and
//! validation.
//!
//! The config document lists the MCP servers to manage. `$VAR` and `${VAR}`
//! references anywhere in the document expand from the parent environment
//! before parsing; undefined variables expand to empty, like shell
//! `${UNSET-}`. Validation fails fast with an error naming the offending
//! field, before any child is spawned.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::{RestexecError, Result};

/// Bounds and defaults for the health-check interval (ms).
pub const HEALTH_CHECK_INTERVAL_MIN_MS: u64 = 5_000;
pub const HEALTH_CHECK_INTERVAL_MAX_MS: u64 = 300_000;
pub const HEALTH_CHECK_INTERVAL_DEFAULT_MS: u64 = 30_000;

/// Per-server call timeout bounds (ms); 0 means "use the gateway default".
pub const SERVER_TIMEOUT_MAX_MS: u64 = 300_000;

/// Maximum server name length.
pub const MAX_SERVER_NAME_LEN: usize = 50;

/// Restart behavior after a session crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    OnFailure,
}

/// Raw YAML document shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    servers: Vec<RawServer>,
    health_check_interval: Option<u64>,
    restart_policy: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawServer {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    /// `KEY=VALUE` entries for the child environment.
    #[serde(default)]
    envs: Vec<String>,
    #[serde(default)]
    timeout: u64,
}

/// One validated server entry.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Per-call timeout; `None` means the server declared 0 and tools fall
    /// back to the gateway default.
    pub timeout: Option<Duration>,
}

/// Fully resolved gateway settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub servers: Vec<McpServerConfig>,
    pub health_check_interval: Duration,
    pub restart_policy: RestartPolicy,
}

impl GatewaySettings {
    /// Load and validate from a YAML file plus the ambient environment.
    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            RestexecError::InvalidConfig("CONFIG_PATH".to_string(), format!("cannot read: {e}"))
        })?;
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_yaml(&raw, &vars)
    }

    /// Parse from YAML text with an explicit variable map.
    pub fn from_yaml(raw: &str, vars: &HashMap<String, String>) -> Result<Self> {
        let expanded = expand_env_vars(raw, vars);
        let parsed: RawConfig = serde_yaml::from_str(&expanded).map_err(|e| {
            RestexecError::InvalidConfig("config".to_string(), format!("invalid YAML: {e}"))
        })?;
        Self::resolve(parsed, vars)
    }

    fn resolve(raw: RawConfig, vars: &HashMap<String, String>) -> Result<Self> {
        if raw.servers.is_empty() {
            return Err(RestexecError::InvalidConfig(
                "servers".to_string(),
                "at least one server must be configured".to_string(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut servers = Vec::with_capacity(raw.servers.len());
        for server in &raw.servers {
            if !seen.insert(server.name.as_str()) {
                return Err(RestexecError::DuplicateServer(server.name.clone()));
            }
            validate_server_name(&server.name)?;
            if server.command.trim().is_empty() {
                return Err(RestexecError::InvalidConfig(
                    format!("servers.{}.command", server.name),
                    "must not be empty".to_string(),
                ));
            }
            if server.timeout > SERVER_TIMEOUT_MAX_MS {
                return Err(RestexecError::InvalidConfig(
                    format!("servers.{}.timeout", server.name),
                    format!("must be at most {SERVER_TIMEOUT_MAX_MS} ms"),
                ));
            }
            servers.push(McpServerConfig {
                name: server.name.clone(),
                command: server.command.clone(),
                args: server.args.clone(),
                env: parse_env_entries(&server.name, &server.envs)?,
                timeout: (server.timeout > 0).then(|| Duration::from_millis(server.timeout)),
            });
        }

        // YAML value wins, then the env var, then the default.
        let interval_ms = match raw.health_check_interval {
            Some(ms) => ms,
            None => match vars.get("HEALTH_CHECK_INTERVAL") {
                Some(v) => v.trim().parse::<u64>().map_err(|_| {
                    RestexecError::InvalidConfig(
                        "HEALTH_CHECK_INTERVAL".to_string(),
                        format!("'{v}' is not a valid number"),
                    )
                })?,
                None => HEALTH_CHECK_INTERVAL_DEFAULT_MS,
            },
        };
        if !(HEALTH_CHECK_INTERVAL_MIN_MS..=HEALTH_CHECK_INTERVAL_MAX_MS).contains(&interval_ms) {
            return Err(RestexecError::InvalidConfig(
                "healthCheckInterval".to_string(),
                format!(
                    "must be between {HEALTH_CHECK_INTERVAL_MIN_MS} and {HEALTH_CHECK_INTERVAL_MAX_MS} ms"
                ),
            ));
        }

        let restart_policy = match raw
            .restart_policy
            .as_deref()
            .or_else(|| vars.get("MCP_SERVER_RESTART_POLICY").map(String::as_str))
        {
            None => RestartPolicy::Never,
            Some("never") => RestartPolicy::Never,
            Some("on-failure") => RestartPolicy::OnFailure,
            Some(other) => {
                return Err(RestexecError::InvalidConfig(
                    "restartPolicy".to_string(),
                    format!("'{other}' is not one of never, on-failure"),
                ));
            }
        };

        Ok(Self {
            servers,
            health_check_interval: Duration::from_millis(interval_ms),
            restart_policy,
        })
    }
}

/// Server names are DNS labels: lowercase alphanumerics and hyphens, no
/// leading or trailing hyphen.
fn validate_server_name(name: &str) -> Result<()> {
    let invalid = |message: &str| {
        RestexecError::InvalidConfig(format!("servers.{name}.name"), message.to_string())
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_SERVER_NAME_LEN {
        return Err(invalid("must be at most 50 characters"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("must not start or end with a hyphen"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid(
            "must contain only lowercase letters, digits and hyphens",
        ));
    }
    Ok(())
}

fn parse_env_entries(server: &str, envs: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for entry in envs {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(RestexecError::InvalidConfig(
                format!("servers.{server}.envs"),
                format!("'{entry}' must have KEY=VALUE form"),
            ));
        };
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// Expand `$VAR` and `${VAR}` references from the variable map; undefined
/// variables expand to empty.
pub fn expand_env_vars(raw: &str, vars: &HashMap<String, String>) -> String {
    // Compiled per call; config loading happens once at startup.
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("static regex");
    pattern
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            vars.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_vars() -> HashMap<String, String> {
        HashMap::new()
    }

    const MINIMAL: &str = r#"
servers:
  - name: files
    command: mcp-files
"#;

    #[test]
    fn test_minimal_config() {
        let settings = GatewaySettings::from_yaml(MINIMAL, &no_vars()).unwrap();
        assert_eq!(settings.servers.len(), 1);
        assert_eq!(settings.servers[0].name, "files");
        assert_eq!(settings.servers[0].command, "mcp-files");
        assert!(settings.servers[0].timeout.is_none());
        assert_eq!(
            settings.health_check_interval,
            Duration::from_millis(30_000)
        );
        assert_eq!(settings.restart_policy, RestartPolicy::Never);
    }

    #[test]
    fn test_full_server_entry() {
        let yaml = r#"
servers:
  - name: github
    command: /usr/local/bin/gh-mcp
    args: ["--stdio"]
    envs: ["GITHUB_TOKEN=abc", "GH_HOST=github.example.com"]
    timeout: 60000
healthCheckInterval: 10000
restartPolicy: on-failure
"#;
        let settings = GatewaySettings::from_yaml(yaml, &no_vars()).unwrap();
        let server = &settings.servers[0];
        assert_eq!(server.args, vec!["--stdio".to_string()]);
        assert_eq!(server.env.get("GITHUB_TOKEN").unwrap(), "abc");
        assert_eq!(server.timeout, Some(Duration::from_millis(60_000)));
        assert_eq!(settings.health_check_interval, Duration::from_millis(10_000));
        assert_eq!(settings.restart_policy, RestartPolicy::OnFailure);
    }

    #[test]
    fn test_env_interpolation_braced_and_bare() {
        let mut vars = HashMap::new();
        vars.insert("TOKEN".to_string(), "sek".to_string());
        vars.insert("HOST".to_string(), "example.com".to_string());
        let yaml = r#"
servers:
  - name: gh
    command: gh-mcp
    envs: ["GITHUB_TOKEN=${TOKEN}", "GH_HOST=$HOST"]
"#;
        let settings = GatewaySettings::from_yaml(yaml, &vars).unwrap();
        let env = &settings.servers[0].env;
        assert_eq!(env.get("GITHUB_TOKEN").unwrap(), "sek");
        assert_eq!(env.get("GH_HOST").unwrap(), "example.com");
    }

    #[test]
    fn test_undefined_vars_expand_to_empty() {
        let yaml = r#"
servers:
  - name: gh
    command: gh-mcp
    envs: ["GITHUB_TOKEN=${UNSET_VAR_XYZ}"]
"#;
        let settings = GatewaySettings::from_yaml(yaml, &no_vars()).unwrap();
        assert_eq!(settings.servers[0].env.get("GITHUB_TOKEN").unwrap(), "");
    }

    #[test]
    fn test_empty_servers_rejected() {
        let result = GatewaySettings::from_yaml("servers: []", &no_vars());
        assert!(matches!(
            result,
            Err(RestexecError::InvalidConfig(field, _)) if field == "servers"
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
servers:
  - name: same
    command: a
  - name: same
    command: b
"#;
        let result = GatewaySettings::from_yaml(yaml, &no_vars());
        assert!(matches!(result, Err(RestexecError::DuplicateServer(n)) if n == "same"));
    }

    #[test]
    fn test_name_shape_rejections() {
        for bad in ["UPPER", "has_underscore", "-lead", "trail-", "dot.name"] {
            let yaml = format!("servers:\n  - name: \"{bad}\"\n    command: x\n");
            assert!(
                GatewaySettings::from_yaml(&yaml, &no_vars()).is_err(),
                "should reject '{bad}'"
            );
        }
    }

    #[test]
    fn test_name_length_cap() {
        let yaml = format!("servers:\n  - name: {}\n    command: x\n", "a".repeat(51));
        assert!(GatewaySettings::from_yaml(&yaml, &no_vars()).is_err());
        let yaml = format!("servers:\n  - name: {}\n    command: x\n", "a".repeat(50));
        assert!(GatewaySettings::from_yaml(&yaml, &no_vars()).is_ok());
    }

    #[test]
    fn test_empty_command_rejected() {
        let yaml = "servers:\n  - name: x\n    command: \"\"\n";
        let result = GatewaySettings::from_yaml(yaml, &no_vars());
        assert!(matches!(
            result,
            Err(RestexecError::InvalidConfig(field, _)) if field == "servers.x.command"
        ));
    }

    #[test]
    fn test_timeout_out_of_range_rejected() {
        let yaml = "servers:\n  - name: x\n    command: c\n    timeout: 300001\n";
        let result = GatewaySettings::from_yaml(yaml, &no_vars());
        assert!(matches!(
            result,
            Err(RestexecError::InvalidConfig(field, _)) if field == "servers.x.timeout"
        ));
    }

    #[test]
    fn test_health_interval_yaml_beats_env() {
        let mut vars = no_vars();
        vars.insert("HEALTH_CHECK_INTERVAL".to_string(), "20000".to_string());
        let yaml = format!("{MINIMAL}healthCheckInterval: 40000\n");
        let settings = GatewaySettings::from_yaml(&yaml, &vars).unwrap();
        assert_eq!(settings.health_check_interval, Duration::from_millis(40_000));
    }

    #[test]
    fn test_health_interval_env_beats_default() {
        let mut vars = no_vars();
        vars.insert("HEALTH_CHECK_INTERVAL".to_string(), "20000".to_string());
        let settings = GatewaySettings::from_yaml(MINIMAL, &vars).unwrap();
        assert_eq!(settings.health_check_interval, Duration::from_millis(20_000));
    }

    #[test]
    fn test_health_interval_range_enforced() {
        let yaml = format!("{MINIMAL}healthCheckInterval: 1000\n");
        assert!(GatewaySettings::from_yaml(&yaml, &no_vars()).is_err());
        let yaml = format!("{MINIMAL}healthCheckInterval: 300001\n");
        assert!(GatewaySettings::from_yaml(&yaml, &no_vars()).is_err());
    }

    #[test]
    fn test_restart_policy_env_fallback() {
        let mut vars = no_vars();
        vars.insert(
            "MCP_SERVER_RESTART_POLICY".to_string(),
            "on-failure".to_string(),
        );
        let settings = GatewaySettings::from_yaml(MINIMAL, &vars).unwrap();
        assert_eq!(settings.restart_policy, RestartPolicy::OnFailure);
    }

    #[test]
    fn test_restart_policy_invalid_value() {
        let yaml = format!("{MINIMAL}restartPolicy: always\n");
        let result = GatewaySettings::from_yaml(&yaml, &no_vars());
        assert!(matches!(
            result,
            Err(RestexecError::InvalidConfig(field, _)) if field == "restartPolicy"
        ));
    }

    #[test]
    fn test_malformed_env_entry_rejected() {
        let yaml = "servers:\n  - name: x\n    command: c\n    envs: [\"NOEQUALS\"]\n";
        let result = GatewaySettings::from_yaml(yaml, &no_vars());
        assert!(matches!(
            result,
            Err(RestexecError::InvalidConfig(field, _)) if field == "servers.x.envs"
        ));
    }
}
