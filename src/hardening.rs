//! Validators shared by every configuration type.
//!
//! These run at construction time so that misconfiguration fails fast rather
//! than surfacing on the first request.

use reqwest::Url;

use crate::error::{AaaError, Result};

/// Algorithms that are never accepted, whatever an allow-list says.
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

const SPIFFE_SCHEME: &str = "spiffe://";

/// Validate that `url` is an absolute HTTPS URL with a host.
///
/// Loopback hosts (`localhost`, `*.localhost`, `127.0.0.1`, `::1`) may use
/// plain HTTP so that local development and tests can run an issuer without
/// certificates.
pub fn validate_https_url(url: &str, field: &str) -> Result<Url> {
    if url.trim().is_empty() {
        return Err(AaaError::Config(format!("{field}: url is required")));
    }

    let parsed = Url::parse(url)
        .map_err(|e| AaaError::Config(format!("{field}: invalid url {url:?}: {e}")))?;

    let host = match parsed.host_str() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => return Err(AaaError::Config(format!("{field}: url {url:?} must include a host"))),
    };

    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" if is_loopback_host(&host) => Ok(parsed),
        other => Err(AaaError::Config(format!(
            "{field}: url {url:?} must use HTTPS scheme, got {other:?}"
        ))),
    }
}

fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    matches!(host, "localhost" | "127.0.0.1" | "::1") || host.ends_with(".localhost")
}

/// Validate a signing algorithm against an explicit allow-list.
///
/// `none` and the HMAC family are rejected even if a caller lists them.
pub fn validate_algorithm(alg: &str, allowed: &[&str]) -> Result<()> {
    if FORBIDDEN_ALGORITHMS.contains(&alg) {
        return Err(AaaError::Config(format!(
            "algorithm {alg:?} is not allowed for security reasons"
        )));
    }
    if !allowed.contains(&alg) {
        return Err(AaaError::Config(format!(
            "algorithm {alg:?} is not allowed; must be one of {}",
            allowed.join(", ")
        )));
    }
    Ok(())
}

/// Validate that `id` is a SPIFFE ID with a non-empty trust domain.
pub fn validate_spiffe_id(id: &str) -> Result<()> {
    let remainder = id.strip_prefix(SPIFFE_SCHEME).ok_or_else(|| {
        AaaError::Config(format!("SPIFFE ID {id:?} must begin with \"{SPIFFE_SCHEME}\""))
    })?;
    if remainder.is_empty() || remainder.starts_with('/') {
        return Err(AaaError::Config(format!(
            "SPIFFE ID {id:?} must include a non-empty trust domain"
        )));
    }
    Ok(())
}
