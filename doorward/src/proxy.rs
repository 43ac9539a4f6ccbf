//! Backend selection and proxy dispatch.
//!
//! Routing is an ordered linear scan over the configured backends: the first
//! entry whose prefix is a literal prefix of the request path wins. There is
//! deliberately no longest-prefix preference; declaration order is the only
//! tie-break.
//!
//! Dispatch forwards the request with the gateway's own cookies stripped and
//! forwarded-for metadata attached. A transport-level failure never reaches
//! the client raw: the caller re-enters the internal web app with a diagnostic
//! message, guarded by [`ProxyAttempt`] so recovery fires at most once per
//! request.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header, request::Parts};
use axum::response::Response;
use bytes::Bytes;
use std::net::SocketAddr;

use crate::config::{Backend, WwwConfig};
use crate::cookies;
use crate::errors::Error;

/// Ordered backend list; first prefix match wins.
#[derive(Debug, Clone, Default)]
pub struct BackendRouter {
    backends: Vec<Backend>,
}

impl BackendRouter {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Select the first backend whose prefix matches the path.
    pub fn select(&self, path: &str) -> Option<&Backend> {
        self.backends.iter().find(|backend| path.starts_with(&backend.url))
    }
}

/// Diagnostic carried into the internal web app when a backend is unreachable.
#[derive(Debug, Clone)]
pub struct ProxyFailure {
    pub code: &'static str,
}

impl ProxyFailure {
    pub fn message(&self) -> String {
        format!("Something went wrong (diagnostics code: {})", self.code)
    }
}

/// Tracks one request's traversal of the proxy path:
/// `Proxying -> Failed -> InternalApp`.
///
/// The transition into `Failed` happens at most once; duplicate transport
/// error events for the same request are swallowed instead of re-entering the
/// internal app a second time.
#[derive(Debug, Default)]
pub struct ProxyAttempt {
    failed: bool,
}

impl ProxyAttempt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transport failure. Returns the diagnostic on the first call
    /// only.
    pub fn fail(&mut self, code: &'static str) -> Option<ProxyFailure> {
        if self.failed {
            return None;
        }
        self.failed = true;
        Some(ProxyFailure { code })
    }
}

/// Why a dispatch did not produce an upstream response.
#[derive(Debug)]
pub enum DispatchError {
    /// The backend was unreachable; recover into the internal web app.
    Transport(&'static str),
    /// The request could not be constructed or forwarded for a local reason.
    Internal(Error),
}

/// Headers that belong to a single connection and must not be forwarded.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive"
}

fn transport_code(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        "ETIMEDOUT"
    } else if error.is_connect() {
        "ECONNREFUSED"
    } else if error.is_body() || error.is_decode() || error.is_request() {
        "ECONNRESET"
    } else {
        "EPROTO"
    }
}

/// Forward a buffered request to the selected backend.
///
/// The gateway's session and CSRF cookies are stripped from the forwarded
/// cookie header; the rest of it is passed through verbatim.
pub async fn dispatch(
    client: &reqwest::Client,
    www: &WwwConfig,
    backend: &Backend,
    parts: &Parts,
    body: Bytes,
    client_addr: Option<SocketAddr>,
) -> Result<Response, DispatchError> {
    let mut url = backend.target.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let mut headers = HeaderMap::new();
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH || name == header::COOKIE {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(raw) = parts.headers.get(header::COOKIE).and_then(|value| value.to_str().ok()) {
        let filtered = cookies::filter(raw, &[www.cookie_name.as_str(), www.csrf_cookie_name.as_str()]);
        if !filtered.trim().is_empty() {
            if let Ok(value) = HeaderValue::from_str(&filtered) {
                headers.insert(header::COOKIE, value);
            }
        }
    }

    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if let Some(host) = parts.headers.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }
    if let Some(addr) = client_addr {
        let ip = addr.ip().to_string();
        let forwarded = match parts.headers.get("x-forwarded-for").and_then(|value| value.to_str().ok()) {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert("x-forwarded-for", value);
        }
    }

    let upstream = client
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_builder() {
                DispatchError::Internal(Error::Internal {
                    operation: format!("build proxied request: {e}"),
                })
            } else {
                tracing::warn!("Proxy dispatch to {} failed: {e}", backend.target);
                DispatchError::Transport(transport_code(&e))
            }
        })?;

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        response_headers.append(name.clone(), value.clone());
    }

    // Buffering the body means a reset mid-transfer can still be recovered
    // into a rendered page: nothing has been written to the client yet.
    let body = upstream.bytes().await.map_err(|e| {
        tracing::warn!("Proxy response from {} failed: {e}", backend.target);
        DispatchError::Transport(transport_code(&e))
    })?;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}
