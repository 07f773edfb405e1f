//! Webhook target URL vetting (SSRF prevention).
//!
//! A candidate URL is rejected when it matches the built-in deny patterns
//! (loopback, RFC1918, link-local, IPv6 ULA/link-local, cloud metadata
//! endpoints) or any operator-configured glob. No subscription may reach
//! `active` with a denied URL.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Hostnames that resolve to cloud metadata services.
const METADATA_HOSTS: &[&str] = &[
    "169.254.169.254",
    "metadata.google.internal",
    "metadata.goog",
    "metadata.azure.com",
];

/// Why a URL was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Scheme is not http or https.
    Scheme(String),
    /// Host missing or unparseable.
    Malformed,
    /// Built-in deny: loopback, private, link-local, ULA, metadata.
    PrivateAddress(String),
    /// Operator-configured glob matched.
    OperatorPattern(String),
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::Scheme(s) => write!(f, "scheme '{s}' is not allowed"),
            DenyReason::Malformed => write!(f, "URL is malformed"),
            DenyReason::PrivateAddress(host) => {
                write!(f, "host '{host}' is a private or reserved address")
            }
            DenyReason::OperatorPattern(p) => write!(f, "URL matches deny pattern '{p}'"),
        }
    }
}

/// Check a URL against the built-in rules plus `operator_patterns` globs.
pub fn check_url(url: &str, operator_patterns: &[String]) -> Result<(), DenyReason> {
    let lower = url.to_ascii_lowercase();
    let rest = if let Some(rest) = lower.strip_prefix("https://") {
        rest
    } else if let Some(rest) = lower.strip_prefix("http://") {
        rest
    } else {
        let scheme = lower.split(':').next().unwrap_or("").to_string();
        return Err(DenyReason::Scheme(scheme));
    };

    let host = extract_host(rest).ok_or(DenyReason::Malformed)?;

    if METADATA_HOSTS.contains(&host.as_str()) {
        return Err(DenyReason::PrivateAddress(host));
    }
    if host == "localhost" || host.ends_with(".localhost") {
        return Err(DenyReason::PrivateAddress(host));
    }
    if let Ok(ip) = host.parse::<IpAddr>()
        && is_denied_ip(ip)
    {
        return Err(DenyReason::PrivateAddress(host));
    }

    for pattern in operator_patterns {
        if glob_match(&pattern.to_ascii_lowercase(), &lower) {
            return Err(DenyReason::OperatorPattern(pattern.clone()));
        }
    }
    Ok(())
}

/// Host portion of `authority/path`, stripping userinfo, port, brackets.
fn extract_host(rest: &str) -> Option<String> {
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        return None;
    }
    // Bracketed IPv6 literal
    if let Some(stripped) = authority.strip_prefix('[') {
        let end = stripped.find(']')?;
        return Some(stripped[..end].to_string());
    }
    Some(authority.split(':').next()?.to_string())
}

fn is_denied_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_denied_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_denied_v4(mapped);
            }
            is_denied_v6(v6)
        }
    }
}

fn is_denied_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()            // 127.0.0.0/8
        || ip.is_private()      // 10/8, 172.16/12, 192.168/16
        || ip.is_link_local()   // 169.254/16
        || ip.is_unspecified()
        || ip.is_broadcast()
}

fn is_denied_v6(ip: Ipv6Addr) -> bool {
    // ULA fc00::/7, link-local fe80::/10, loopback, unspecified
    ip.is_loopback()
        || ip.is_unspecified()
        || (ip.segments()[0] & 0xfe00) == 0xfc00
        || (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Minimal glob: `*` matches any run of characters, everything else is
/// literal.
fn glob_match(pattern: &str, input: &str) -> bool {
    fn inner(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], s) || (!s.is_empty() && inner(p, &s[1..]))
            }
            (Some(pc), Some(sc)) if pc == sc => inner(&p[1..], &s[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), input.as_bytes())
}
