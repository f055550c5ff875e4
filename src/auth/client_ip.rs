//! Client-IP resolution with trusted-proxy support.
//!
//! Rate limiting keys on the client IP, so the resolution rules are part of
//! the security boundary: the forwarded-for header is only believed when the
//! direct peer address lies inside an operator-configured trusted range.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{RestexecError, Result};

/// Parse a comma-separated list of trusted proxy ranges.
///
/// Each entry is a CIDR (`10.0.0.0/8`, `fd00::/8`) or a bare IP, which is
/// treated as a /32 (v4) or /128 (v6) range. Empty entries are dropped.
pub fn parse_trusted_proxies(raw: &str) -> Result<Vec<IpNet>> {
    let mut nets = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let net = entry
            .parse::<IpNet>()
            .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
            .map_err(|_| {
                RestexecError::InvalidConfig(
                    "AUTH_TRUSTED_PROXY_IPS".to_string(),
                    format!("'{entry}' is not a valid IP or CIDR range"),
                )
            })?;
        nets.push(net);
    }
    Ok(nets)
}

/// Whether `ip` lies inside any trusted range.
pub fn is_trusted_proxy(ip: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&ip))
}

/// Resolve the client IP for a request.
///
/// With proxy trust off the direct socket address wins unconditionally. With
/// it on, and the direct peer inside a trusted range, the first
/// comma-separated token of the forwarded-for header is used when it parses
/// as an IP; otherwise the direct address is kept and a warning is logged.
pub fn resolve_client_ip(
    direct: IpAddr,
    forwarded_for: Option<&str>,
    trust_proxy: bool,
    trusted: &[IpNet],
) -> IpAddr {
    if !trust_proxy || !is_trusted_proxy(direct, trusted) {
        return direct;
    }

    let Some(header) = forwarded_for else {
        return direct;
    };

    let first = header.split(',').next().unwrap_or("").trim();
    match first.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => {
            tracing::warn!(
                direct = %direct,
                forwarded_for = %header,
                "forwarded-for header is not a valid IP, falling back to socket address"
            );
            direct
        }
    }
}
