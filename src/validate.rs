//! Request validation for the execution service.
//!
//! Everything user-controlled passes through here before it can reach the
//! filesystem or a child process: artifact ids, timeouts, source payloads,
//! and user-supplied environment maps.

use std::collections::HashMap;

use crate::error::{RestexecError, Result};

/// Maximum artifact id length.
pub const MAX_CODE_ID_LEN: usize = 64;

/// Maximum source payload size (10 MiB).
pub const MAX_CODE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum number of user-supplied env keys.
pub const MAX_ENV_KEYS: usize = 50;

/// Maximum serialized size of the user env map (10 KiB).
pub const MAX_ENV_BYTES: usize = 10 * 1024;

/// Env keys the user may never supply; the executor owns these.
pub const FORBIDDEN_ENV_KEYS: &[&str] = &[
    "PATH", "DENO_DIR", "HOME", "USER", "PWD", "SHELL", "HOSTNAME", "TMPDIR", "TEMP", "TMP",
];

/// Prefix reserved for the interpreter runtime.
pub const RESERVED_ENV_PREFIX: &str = "DENO_";

fn validation(field: &str, message: impl Into<String>) -> RestexecError {
    RestexecError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate an artifact id: `[A-Za-z0-9_-]+`, 1–64 chars.
///
/// The character class already excludes path separators and dots, but the
/// traversal checks are kept explicit so the defense does not silently
/// disappear if the class is ever widened.
pub fn validate_code_id(code_id: &str) -> Result<()> {
    if code_id.is_empty() {
        return Err(validation("codeId", "must not be empty"));
    }
    if code_id.len() > MAX_CODE_ID_LEN {
        return Err(validation(
            "codeId",
            format!("must be at most {MAX_CODE_ID_LEN} characters"),
        ));
    }
    if code_id.contains('/') || code_id.contains('\\') || code_id.contains("..") {
        return Err(validation("codeId", "must not contain path separators"));
    }
    if !code_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(validation(
            "codeId",
            "must contain only letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

/// Validate an execution timeout in milliseconds against the configured cap.
pub fn validate_timeout(timeout_ms: u64, max_timeout_ms: u64) -> Result<()> {
    if timeout_ms == 0 || timeout_ms > max_timeout_ms {
        return Err(validation(
            "timeout",
            format!("must be between 1 and {max_timeout_ms} milliseconds"),
        ));
    }
    Ok(())
}

/// Validate a source payload for saving.
pub fn validate_code(code: &str) -> Result<()> {
    if code.is_empty() {
        return Err(validation("code", "must not be empty"));
    }
    if code.len() > MAX_CODE_BYTES {
        return Err(validation(
            "code",
            format!("must be at most {MAX_CODE_BYTES} bytes"),
        ));
    }
    Ok(())
}

/// Strip an outermost triple-backtick fence with a `ts`/`typescript` (or
/// empty) language tag, returning the interior verbatim.
///
/// Only the outermost fence is recognized; fences inside the body are
/// preserved. Unfenced input is returned unchanged, which makes the
/// operation idempotent.
pub fn extract_fenced_code(code: &str) -> &str {
    let trimmed = code.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return code;
    };
    let Some(newline) = rest.find('\n') else {
        return code;
    };
    let tag = rest[..newline].trim();
    if !matches!(tag, "" | "ts" | "typescript") {
        return code;
    }
    let body = &rest[newline + 1..];
    let Some(body) = body.strip_suffix("```") else {
        return code;
    };
    // The closing fence must sit on its own line.
    body.strip_suffix('\n').unwrap_or(body)
}

/// Validate a user-supplied environment map.
///
/// Keys must match `[A-Z][A-Z0-9_]*`, the map is bounded in cardinality and
/// serialized size, and neither forbidden keys nor interpreter-reserved
/// prefixes are allowed through.
pub fn validate_env(env: &HashMap<String, String>) -> Result<()> {
    if env.len() > MAX_ENV_KEYS {
        return Err(validation(
            "env",
            format!("must contain at most {MAX_ENV_KEYS} keys"),
        ));
    }

    let serialized = serde_json::to_string(env)
        .map_err(|e| RestexecError::Internal(format!("env serialization failed: {e}")))?;
    if serialized.len() > MAX_ENV_BYTES {
        return Err(validation(
            "env",
            format!("serialized size must be at most {MAX_ENV_BYTES} bytes"),
        ));
    }

    for key in env.keys() {
        if !is_valid_env_key(key) {
            return Err(validation(
                "env",
                format!("key '{key}' must match [A-Z][A-Z0-9_]*"),
            ));
        }
        if FORBIDDEN_ENV_KEYS.contains(&key.as_str()) {
            return Err(validation("env", format!("key '{key}' is not permitted")));
        }
        if key.starts_with(RESERVED_ENV_PREFIX) {
            return Err(validation(
                "env",
                format!("key '{key}' uses a reserved interpreter prefix"),
            ));
        }
    }
    Ok(())
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_id_accepts_identifier_shapes() {
        for id in ["hello", "a", "snake_case", "kebab-case", "Mixed123"] {
            assert!(validate_code_id(id).is_ok(), "should accept '{id}'");
        }
    }

    #[test]
    fn test_code_id_rejects_traversal() {
        for id in ["../etc/passwd", "a/b", "a\\b", "..", "a..b"] {
            let result = validate_code_id(id);
            assert!(
                matches!(result, Err(RestexecError::Validation { ref field, .. }) if field == "codeId"),
                "should reject '{id}'"
            );
        }
    }

    #[test]
    fn test_code_id_rejects_empty_and_long() {
        assert!(validate_code_id("").is_err());
        assert!(validate_code_id(&"x".repeat(64)).is_ok());
        assert!(validate_code_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_code_id_rejects_other_chars() {
        for id in ["a b", "a.ts", "a$b", "héllo"] {
            assert!(validate_code_id(id).is_err(), "should reject '{id}'");
        }
    }

    #[test]
    fn test_timeout_range() {
        assert!(validate_timeout(1, 300_000).is_ok());
        assert!(validate_timeout(300_000, 300_000).is_ok());
        assert!(validate_timeout(0, 300_000).is_err());
        assert!(validate_timeout(300_001, 300_000).is_err());
    }

    #[test]
    fn test_code_bounds() {
        assert!(validate_code("x").is_ok());
        assert!(validate_code("").is_err());
    }

    #[test]
    fn test_fence_extraction_typescript_tag() {
        let wrapped = "```typescript\nconsole.log(1);\n```";
        assert_eq!(extract_fenced_code(wrapped), "console.log(1);");
    }

    #[test]
    fn test_fence_extraction_ts_tag_and_bare() {
        assert_eq!(extract_fenced_code("```ts\nlet x = 1;\n```"), "let x = 1;");
        assert_eq!(extract_fenced_code("```\nlet x = 1;\n```"), "let x = 1;");
    }

    #[test]
    fn test_fence_extraction_unknown_tag_untouched() {
        let code = "```python\nprint(1)\n```";
        assert_eq!(extract_fenced_code(code), code);
    }

    #[test]
    fn test_fence_extraction_is_idempotent() {
        let plain = "const a = 1;\nconsole.log(a);";
        assert_eq!(extract_fenced_code(plain), plain);
        let once = extract_fenced_code("```ts\nconst a = 1;\n```");
        assert_eq!(extract_fenced_code(once), once);
    }

    #[test]
    fn test_fence_extraction_preserves_nested_fence() {
        let wrapped = "```ts\nconst doc = `\\`\\`\\`ts`;\n```md\ninner\n```";
        // Outermost fence only: the first line and the final ``` are removed,
        // everything between stays verbatim.
        let inner = extract_fenced_code(wrapped);
        assert!(inner.contains("```md"));
    }

    #[test]
    fn test_env_accepts_conventional_keys() {
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "secret".to_string());
        env.insert("RETRIES_2".to_string(), "3".to_string());
        assert!(validate_env(&env).is_ok());
    }

    #[test]
    fn test_env_rejects_bad_key_shapes() {
        for key in ["path", "1KEY", "_KEY", "key", "KEY-NAME"] {
            let mut env = HashMap::new();
            env.insert(key.to_string(), "v".to_string());
            assert!(validate_env(&env).is_err(), "should reject '{key}'");
        }
    }

    #[test]
    fn test_env_rejects_forbidden_keys() {
        for key in FORBIDDEN_ENV_KEYS {
            if !key.chars().next().unwrap().is_ascii_uppercase() {
                continue;
            }
            let mut env = HashMap::new();
            env.insert(key.to_string(), "v".to_string());
            let result = validate_env(&env);
            assert!(result.is_err(), "should reject forbidden key '{key}'");
        }
    }

    #[test]
    fn test_env_rejects_reserved_prefix() {
        let mut env = HashMap::new();
        env.insert("DENO_NO_UPDATE_CHECK".to_string(), "1".to_string());
        assert!(validate_env(&env).is_err());
    }

    #[test]
    fn test_env_rejects_too_many_keys() {
        let mut env = HashMap::new();
        for i in 0..=MAX_ENV_KEYS {
            env.insert(format!("KEY_{i}"), "v".to_string());
        }
        assert!(validate_env(&env).is_err());
    }

    #[test]
    fn test_env_rejects_oversized_payload() {
        let mut env = HashMap::new();
        env.insert("BIG".to_string(), "x".repeat(MAX_ENV_BYTES));
        assert!(validate_env(&env).is_err());
    }
}
