//! Execution-service configuration — environment parsing and validation.
//!
//! All Core A knobs come from the process environment; there is no config
//! file and no hot reconfiguration (restart to apply changes). Parsing fails
//! fast at startup with an error naming the offending variable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::client_ip::parse_trusted_proxies;
use crate::auth::rate_limit::RateLimitSettings;
use crate::auth::{AuthSettings, MIN_API_KEY_LEN};
use crate::error::{RestexecError, Result};

/// Default per-stream output cap for supervised children (10 MiB).
pub const DEFAULT_STREAM_CAP_BYTES: usize = 10 * 1024 * 1024;

/// Default interval between the graceful-stop and forced-kill signals.
pub const DEFAULT_KILL_GRACE_MS: u64 = 1_000;

/// Log output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Full service configuration for `restexec serve`.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub workspace_dir: PathBuf,
    pub tools_dir: PathBuf,
    /// Interpreter binary for executions and lints.
    pub deno_bin: String,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Hosts the child may reach; empty means network access is off.
    pub allow_net: Vec<String>,
    /// Paths the child may write; empty means writes are off.
    pub allow_write: Vec<String>,
    pub stream_cap_bytes: usize,
    pub kill_grace: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
    pub auth: AuthSettings,
}

impl ServiceConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load configuration from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).map(String::as_str);

        let port = parse_number(get("PORT"), "PORT", 3000u16)?;
        let workspace_dir =
            PathBuf::from(get("WORKSPACE_DIR").unwrap_or("./workspace").to_string());
        let tools_dir = PathBuf::from(get("TOOLS_DIR").unwrap_or("./tools").to_string());
        let deno_bin = get("DENO_BIN").unwrap_or("deno").to_string();

        let default_timeout_ms = parse_number(get("DEFAULT_TIMEOUT"), "DEFAULT_TIMEOUT", 30_000)?;
        let max_timeout_ms = parse_number(get("MAX_TIMEOUT"), "MAX_TIMEOUT", 300_000)?;

        let allow_net = parse_list(get("ALLOW_NET"));
        let allow_write = parse_list(get("ALLOW_WRITE"));

        let log_level = match get("LOG_LEVEL").unwrap_or("info") {
            level @ ("debug" | "info" | "warn" | "error") => level.to_string(),
            other => {
                return Err(RestexecError::InvalidConfig(
                    "LOG_LEVEL".to_string(),
                    format!("'{other}' is not one of debug, info, warn, error"),
                ));
            }
        };
        let log_format = match get("LOG_FORMAT").unwrap_or("text") {
            "json" => LogFormat::Json,
            "text" => LogFormat::Text,
            other => {
                return Err(RestexecError::InvalidConfig(
                    "LOG_FORMAT".to_string(),
                    format!("'{other}' is not one of json, text"),
                ));
            }
        };

        let auth = parse_auth_settings(vars)?;

        let config = Self {
            port,
            workspace_dir,
            tools_dir,
            deno_bin,
            default_timeout_ms,
            max_timeout_ms,
            allow_net,
            allow_write,
            stream_cap_bytes: DEFAULT_STREAM_CAP_BYTES,
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            log_level,
            log_format,
            auth,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation, failing fast before anything is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            return Err(RestexecError::InvalidConfig(
                "DEFAULT_TIMEOUT".to_string(),
                "must be positive".to_string(),
            ));
        }
        if self.max_timeout_ms < self.default_timeout_ms {
            return Err(RestexecError::InvalidConfig(
                "MAX_TIMEOUT".to_string(),
                "must be at least DEFAULT_TIMEOUT".to_string(),
            ));
        }
        if self.deno_bin.is_empty() {
            return Err(RestexecError::InvalidConfig(
                "DENO_BIN".to_string(),
                "must not be empty".to_string(),
            ));
        }
        if self.auth.enabled {
            let key_len = self.auth.api_key.as_deref().map(str::len).unwrap_or(0);
            if key_len < MIN_API_KEY_LEN {
                return Err(RestexecError::InvalidConfig(
                    "AUTH_API_KEY".to_string(),
                    format!("must be at least {MIN_API_KEY_LEN} characters when auth is enabled"),
                ));
            }
        }
        Ok(())
    }
}

/// Parse the `AUTH_*` family of variables; shared by both services.
pub fn parse_auth_settings(vars: &HashMap<String, String>) -> Result<AuthSettings> {
    let get = |key: &str| vars.get(key).map(String::as_str);

    // AUTH_ENABLED must be an explicit decision — an unset or mistyped value
    // is a startup failure, not a silent default.
    let enabled = match get("AUTH_ENABLED") {
        Some(raw) if raw.eq_ignore_ascii_case("true") => true,
        Some(raw) if raw.eq_ignore_ascii_case("false") => false,
        Some(other) => {
            return Err(RestexecError::InvalidConfig(
                "AUTH_ENABLED".to_string(),
                format!("'{other}' must be exactly 'true' or 'false'"),
            ));
        }
        None => {
            return Err(RestexecError::InvalidConfig(
                "AUTH_ENABLED".to_string(),
                "must be set explicitly to 'true' or 'false'".to_string(),
            ));
        }
    };

    let api_key = get("AUTH_API_KEY").map(str::to_string);
    let trusted_proxies = match get("AUTH_TRUSTED_PROXY_IPS") {
        Some(raw) => parse_trusted_proxies(raw)?,
        None => Vec::new(),
    };

    let rate_limit = RateLimitSettings {
        enabled: parse_bool(get("AUTH_RATE_LIMIT_ENABLED"), true),
        max_attempts: parse_number(
            get("AUTH_RATE_LIMIT_MAX_ATTEMPTS"),
            "AUTH_RATE_LIMIT_MAX_ATTEMPTS",
            5u32,
        )?,
        window: Duration::from_millis(parse_number(
            get("AUTH_RATE_LIMIT_WINDOW_MS"),
            "AUTH_RATE_LIMIT_WINDOW_MS",
            60_000,
        )?),
        trust_proxy: parse_bool(get("AUTH_RATE_LIMIT_TRUST_PROXY"), false),
        max_entries: parse_number(
            get("AUTH_RATE_LIMIT_MAX_ENTRIES"),
            "AUTH_RATE_LIMIT_MAX_ENTRIES",
            10_000usize,
        )?,
    };

    Ok(AuthSettings {
        enabled,
        api_key,
        trusted_proxies,
        rate_limit,
    })
}

/// Case-insensitive `"true"` is true; everything else (including unset) is
/// the fallback or false.
pub fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some(value) => value.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

/// Split on commas, trim entries, drop empties.
pub fn parse_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_number<T>(raw: Option<&str>, field: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
{
    match raw {
        Some(value) => value.trim().parse::<T>().map_err(|_| {
            RestexecError::InvalidConfig(
                field.to_string(),
                format!("'{value}' is not a valid number"),
            )
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("AUTH_ENABLED".to_string(), "false".to_string());
        vars
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_vars(&base_vars()).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.default_timeout_ms, 30_000);
        assert_eq!(config.max_timeout_ms, 300_000);
        assert_eq!(config.deno_bin, "deno");
        assert!(config.allow_net.is_empty());
        assert!(config.allow_write.is_empty());
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.stream_cap_bytes, 10 * 1024 * 1024);
        assert_eq!(config.kill_grace, Duration::from_millis(1_000));
    }

    #[test]
    fn test_auth_enabled_is_mandatory_and_strict() {
        let vars = HashMap::new();
        let result = ServiceConfig::from_vars(&vars);
        assert!(matches!(
            result,
            Err(RestexecError::InvalidConfig(field, _)) if field == "AUTH_ENABLED"
        ));

        let mut vars = HashMap::new();
        vars.insert("AUTH_ENABLED".to_string(), "yes".to_string());
        assert!(ServiceConfig::from_vars(&vars).is_err());

        let mut vars = HashMap::new();
        vars.insert("AUTH_ENABLED".to_string(), "TRUE".to_string());
        vars.insert("AUTH_API_KEY".to_string(), "k".repeat(32));
        assert!(ServiceConfig::from_vars(&vars).unwrap().auth.enabled);
    }

    #[test]
    fn test_auth_enabled_requires_long_key() {
        let mut vars = base_vars();
        vars.insert("AUTH_ENABLED".to_string(), "true".to_string());
        vars.insert("AUTH_API_KEY".to_string(), "too-short".to_string());
        let result = ServiceConfig::from_vars(&vars);
        assert!(matches!(
            result,
            Err(RestexecError::InvalidConfig(field, _)) if field == "AUTH_API_KEY"
        ));
    }

    #[test]
    fn test_comma_list_parsing() {
        assert_eq!(
            parse_list(Some("a.example.com, b.example.com ,,")),
            vec!["a.example.com".to_string(), "b.example.com".to_string()]
        );
        assert!(parse_list(Some("")).is_empty());
        assert!(parse_list(None).is_empty());
    }

    #[test]
    fn test_bool_parsing_case_insensitive_true() {
        assert!(parse_bool(Some("true"), false));
        assert!(parse_bool(Some("True"), false));
        assert!(parse_bool(Some("TRUE"), false));
        assert!(!parse_bool(Some("1"), true));
        assert!(!parse_bool(Some("false"), true));
        assert!(parse_bool(None, true));
    }

    #[test]
    fn test_rate_limit_settings_from_env() {
        let mut vars = base_vars();
        vars.insert("AUTH_RATE_LIMIT_MAX_ATTEMPTS".to_string(), "3".to_string());
        vars.insert("AUTH_RATE_LIMIT_WINDOW_MS".to_string(), "10000".to_string());
        vars.insert("AUTH_RATE_LIMIT_TRUST_PROXY".to_string(), "true".to_string());
        vars.insert("AUTH_RATE_LIMIT_MAX_ENTRIES".to_string(), "500".to_string());
        let config = ServiceConfig::from_vars(&vars).unwrap();
        assert_eq!(config.auth.rate_limit.max_attempts, 3);
        assert_eq!(config.auth.rate_limit.window, Duration::from_millis(10_000));
        assert!(config.auth.rate_limit.trust_proxy);
        assert_eq!(config.auth.rate_limit.max_entries, 500);
    }

    #[test]
    fn test_trusted_proxy_parsing() {
        let mut vars = base_vars();
        vars.insert(
            "AUTH_TRUSTED_PROXY_IPS".to_string(),
            "10.0.0.0/8, 127.0.0.1".to_string(),
        );
        let config = ServiceConfig::from_vars(&vars).unwrap();
        assert_eq!(config.auth.trusted_proxies.len(), 2);
    }

    #[test]
    fn test_invalid_number_names_the_field() {
        let mut vars = base_vars();
        vars.insert("MAX_TIMEOUT".to_string(), "lots".to_string());
        let result = ServiceConfig::from_vars(&vars);
        assert!(matches!(
            result,
            Err(RestexecError::InvalidConfig(field, _)) if field == "MAX_TIMEOUT"
        ));
    }

    #[test]
    fn test_max_timeout_must_cover_default() {
        let mut vars = base_vars();
        vars.insert("DEFAULT_TIMEOUT".to_string(), "60000".to_string());
        vars.insert("MAX_TIMEOUT".to_string(), "30000".to_string());
        let result = ServiceConfig::from_vars(&vars);
        assert!(matches!(
            result,
            Err(RestexecError::InvalidConfig(field, _)) if field == "MAX_TIMEOUT"
        ));
    }

    #[test]
    fn test_log_settings_validated() {
        let mut vars = base_vars();
        vars.insert("LOG_LEVEL".to_string(), "verbose".to_string());
        assert!(ServiceConfig::from_vars(&vars).is_err());

        let mut vars = base_vars();
        vars.insert("LOG_FORMAT".to_string(), "yaml".to_string());
        assert!(ServiceConfig::from_vars(&vars).is_err());

        let mut vars = base_vars();
        vars.insert("LOG_LEVEL".to_string(), "debug".to_string());
        vars.insert("LOG_FORMAT".to_string(), "json".to_string());
        let config = ServiceConfig::from_vars(&vars).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Json);
    }
}
