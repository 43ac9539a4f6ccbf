//! Per-request access gate.
//!
//! Every inbound request passes through [`access_gate`], which runs a fixed
//! sequence: CSRF bootstrap, session resolution (with defensive cookie
//! eviction), then the routing decision: internal web app or backend proxy.
//! The resolved identity and the request's CSRF token travel to the web app
//! through request extensions; cookie side effects are appended to whatever
//! response the request ends up producing.
//!
//! [`verify_csrf`] sits between the gate and the web app routes, so only
//! state-changing submissions handled by the internal app are checked;
//! proxied request bodies belong to the backends.

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

use crate::auth::password;
use crate::errors::Error;
use crate::proxy::{self, ProxyAttempt};
use crate::store::Identity;
use crate::{AppState, config::Backend, cookies, webapp};

/// The request's anti-forgery token: the cookie-borne value, or the one just
/// minted for a browser that had none.
#[derive(Debug, Clone)]
pub struct CsrfToken(pub String);

/// The resolved, enabled identity behind the request's session.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub Identity);

/// Raw session cookie value, present whenever the browser sent one (valid or
/// not). Lets the logout handler destroy sessions the gate already rejected.
#[derive(Debug, Clone)]
pub struct SessionCookie(pub String);

/// Marker: the request held a valid session but matched no configured backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendNotFound;

pub async fn access_gate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let cookie_header = req
        .headers()
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let cookies = cookies::parse(cookie_header);

    let www = &state.config.www;
    let mut set_cookies: Vec<String> = Vec::new();

    // CSRF bootstrap: issued once per browser, independent of the session
    let csrf_token = match cookies.get(&www.csrf_cookie_name) {
        Some(token) => token.clone(),
        None => {
            let token = password::generate_csrf_token();
            set_cookies.push(cookies::set_cookie(&www.csrf_cookie_name, &token));
            token
        }
    };
    req.extensions_mut().insert(CsrfToken(csrf_token));

    // Session resolution; a cookie that fails to resolve is evicted from the
    // browser in the same response
    let mut identity: Option<Identity> = None;
    if let Some(session_id) = cookies.get(&www.cookie_name) {
        req.extensions_mut().insert(SessionCookie(session_id.clone()));
        match state.sessions.resolve(session_id, &state.store).await {
            Some(user) => identity = Some(user),
            None => set_cookies.push(cookies::clear_cookie(&www.cookie_name)),
        }
    }
    if let Some(user) = &identity {
        req.extensions_mut().insert(AuthedUser(user.clone()));
    }

    // Routing decision: anonymous requests and reserved paths go to the
    // internal app; everything else is eligible for proxying
    let path = req.uri().path().to_string();
    let mut response = if identity.is_none() || path.starts_with(&www.internal_prefix) {
        next.run(req).await
    } else {
        match state.backends.select(&path) {
            None => {
                req.extensions_mut().insert(BackendNotFound);
                next.run(req).await
            }
            Some(backend) => {
                let backend = backend.clone();
                proxy_with_recovery(&state, backend, req).await
            }
        }
    };

    for cookie in set_cookies {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }

    response
}

/// Dispatch to a backend; on transport failure, recover into the internal app
/// with a diagnostic page instead of surfacing the raw error.
async fn proxy_with_recovery(state: &AppState, backend: Backend, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return Error::BadRequest {
                message: format!("failed to read request body: {e}"),
            }
            .into_response();
        }
    };

    let client_addr = parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0);

    let mut attempt = ProxyAttempt::new();
    match proxy::dispatch(&state.http, &state.config.www, &backend, &parts, body, client_addr).await {
        Ok(response) => response,
        Err(proxy::DispatchError::Internal(error)) => error.into_response(),
        Err(proxy::DispatchError::Transport(code)) => match attempt.fail(code) {
            Some(failure) => {
                let user = parts.extensions.get::<AuthedUser>().map(|authed| authed.0.clone());
                webapp::error_message(state, user.as_ref(), StatusCode::INTERNAL_SERVER_ERROR, &failure.message())
            }
            // The request already recovered once; later error events are dropped.
            None => StatusCode::BAD_GATEWAY.into_response(),
        },
    }
}

/// Verify the anti-forgery token on state-changing submissions.
///
/// The hidden `csrf_token` form field must equal the cookie-borne token
/// byte-for-byte; a mismatch is a terminal 403 regardless of authentication
/// state.
pub async fn verify_csrf(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.method() != Method::POST {
        return next.run(req).await;
    }

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, state.config.www.max_post_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return Error::BadRequest {
                message: format!("failed to read request body: {e}"),
            }
            .into_response();
        }
    };

    let submitted = url::form_urlencoded::parse(&bytes)
        .find(|(key, _)| key == "csrf_token")
        .map(|(_, value)| value.into_owned());
    let expected = parts.extensions.get::<CsrfToken>().map(|token| token.0.clone());

    let valid = matches!((&submitted, &expected), (Some(sent), Some(want)) if sent == want);
    if !valid {
        let user = parts.extensions.get::<AuthedUser>().map(|authed| authed.0.clone());
        return webapp::error_message(
            &state,
            user.as_ref(),
            StatusCode::FORBIDDEN,
            "Invalid CSRF token, please refresh page and try again",
        );
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}
