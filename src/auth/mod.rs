//! Request authentication for both HTTP surfaces.
//!
//! Bearer-token verification with a constant-time comparison, backed by the
//! per-IP sliding-window failure limiter in [`rate_limit`] and the
//! trusted-proxy client-IP resolution in [`client_ip`]. `/health` never
//! passes through here.

pub mod client_ip;
pub mod rate_limit;

use ipnet::IpNet;
use subtle::ConstantTimeEq;

use crate::error::{RestexecError, Result};
use rate_limit::RateLimitSettings;

/// Minimum accepted API key length when authentication is enabled.
pub const MIN_API_KEY_LEN: usize = 32;

/// Authentication settings resolved at startup.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub trusted_proxies: Vec<IpNet>,
    pub rate_limit: RateLimitSettings,
}

/// Verifies `Authorization: Bearer <key>` headers.
pub struct Authenticator {
    enabled: bool,
    api_key: Vec<u8>,
}

impl Authenticator {
    /// Build from settings. The key-length requirement is enforced by config
    /// validation before this is reached; it is re-checked here so the type
    /// cannot be constructed around it.
    pub fn new(settings: &AuthSettings) -> Result<Self> {
        if !settings.enabled {
            return Ok(Self {
                enabled: false,
                api_key: Vec::new(),
            });
        }
        let key = settings.api_key.as_deref().unwrap_or_default();
        if key.len() < MIN_API_KEY_LEN {
            return Err(RestexecError::InvalidConfig(
                "AUTH_API_KEY".to_string(),
                format!("must be at least {MIN_API_KEY_LEN} characters when auth is enabled"),
            ));
        }
        Ok(Self {
            enabled: true,
            api_key: key.as_bytes().to_vec(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Verify the raw `Authorization` header value.
    ///
    /// The token comparison runs in constant time over the full key length;
    /// only the length itself can shortcut, never the position of the first
    /// differing byte.
    pub fn verify(&self, authorization: Option<&str>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let Some(header) = authorization else {
            return Err(RestexecError::Unauthorized(
                "missing Authorization header".to_string(),
            ));
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return Err(RestexecError::Unauthorized(
                "Authorization header must use the Bearer scheme".to_string(),
            ));
        };
        if self.api_key.ct_eq(token.as_bytes()).into() {
            Ok(())
        } else {
            Err(RestexecError::Unauthorized("invalid API key".to_string()))
        }
    }
}
