//! CORS policy
//!
//! Browser clients call the metered action endpoints directly. Allowed:
//!
//! - loopback origins (`localhost`, `127.0.0.1`, `[::1]`) on any port
//! - origins listed in `LEADFLOW_ALLOWED_ORIGINS`, matched exactly
//!
//! Webhook and admin routes are server-to-server and need no CORS, but
//! sharing one layer keeps preflights consistent.

use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use tower_http::cors::{AllowOrigin, CorsLayer};
use url::{Host, Url};

/// Allowed request headers
pub const ALLOWED_HEADERS: [HeaderName; 2] = [CONTENT_TYPE, AUTHORIZATION];

/// Allowed methods
pub const ALLOWED_METHODS: [Method; 3] = [Method::GET, Method::POST, Method::OPTIONS];

/// Preflight cache lifetime (1 hour)
pub const DEFAULT_MAX_AGE_SECS: u64 = 3600;

/// Build the CORS layer for the given extra origins
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let extra: Arc<Vec<String>> = Arc::new(
        allowed_origins
            .iter()
            .filter_map(|o| normalize_origin(o))
            .collect(),
    );

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            is_allowed_origin(origin, &extra)
        }))
        .allow_methods(ALLOWED_METHODS)
        .allow_headers(ALLOWED_HEADERS)
        .max_age(Duration::from_secs(DEFAULT_MAX_AGE_SECS))
}

/// Whether `origin` may call the API
pub fn is_allowed_origin(origin: &HeaderValue, extra: &[String]) -> bool {
    if is_localhost_origin(origin) {
        return true;
    }
    origin
        .to_str()
        .ok()
        .and_then(normalize_origin)
        .is_some_and(|o| extra.contains(&o))
}

/// Loopback origin over http(s) with a non-zero port, if any
pub fn is_localhost_origin(origin: &HeaderValue) -> bool {
    let Some(url) = origin.to_str().ok().and_then(|s| Url::parse(s).ok()) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    if url.port() == Some(0) {
        return false;
    }
    match url.host() {
        Some(Host::Domain(domain)) => domain == "localhost",
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// `scheme://host[:port]`, lowercased; `None` if not an http(s) origin
fn normalize_origin(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}
