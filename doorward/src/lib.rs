//! # doorward: Session-Gated Routing & Proxy Dispatch
//!
//! `doorward` sits in front of one or more backend HTTP services and decides,
//! for every incoming request, whether the caller is an authenticated session
//! holder entitled to reach those backends, or must instead be served the
//! built-in gatekeeping application (login, logout, user administration).
//!
//! ## Request Flow
//!
//! Every request passes through the access gate middleware
//! ([`gate::access_gate`]). Cookies are parsed, a CSRF token is issued to
//! browsers that lack one, and the session cookie (if any) is resolved against
//! the credential store through the [`auth::sessions::SessionRegistry`]. A
//! session whose identity has disappeared or been disabled is evicted on the
//! spot and the stale cookie cleared from the browser. Requests without a
//! usable session, and requests under the reserved internal prefix, are
//! handled by the internal web app ([`webapp`]); everything else is matched
//! against the ordered backend list ([`proxy::BackendRouter`], first prefix
//! match wins) and forwarded with the gateway's own cookies stripped. An
//! unreachable backend is recovered by re-entering the web app with a
//! diagnostic page instead of failing the client connection.
//!
//! State-changing submissions to the internal app additionally pass
//! [`gate::verify_csrf`], which compares the hidden form token against the
//! cookie-borne one and rejects mismatches with a rendered 403.
//!
//! ## Persistence
//!
//! User records live in a single JSON file ([`store::UserStore`]), loaded at
//! startup (the process refuses to start without it) and rewritten
//! atomically as a whole on every administrative change. Sessions are
//! in-process only; a restart clears them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use doorward::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = doorward::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     doorward::telemetry::init_telemetry();
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await
//! }
//! ```

pub mod auth;
pub mod config;
pub mod cookies;
pub mod errors;
pub mod gate;
pub mod proxy;
pub mod store;
pub mod telemetry;
pub mod webapp;

use anyhow::Context;
use axum::Router;
use axum::http::{HeaderValue, header};
use axum::middleware::from_fn_with_state;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};

use crate::auth::sessions::SessionRegistry;
use crate::proxy::BackendRouter;
use crate::store::UserStore;

pub use config::Config;

/// Application state shared across all request handlers.
///
/// Constructed once at startup and cloned into every handler; there is no
/// global mutable state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<UserStore>,
    pub sessions: Arc<SessionRegistry>,
    pub backends: Arc<BackendRouter>,
    pub templates: Arc<minijinja::Environment<'static>>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, store: UserStore) -> anyhow::Result<Self> {
        let templates = webapp::environment().context("failed to build page templates")?;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.proxy.timeout)
            .build()
            .context("failed to build proxy HTTP client")?;

        Ok(Self {
            backends: Arc::new(BackendRouter::new(config.backends.clone())),
            config: Arc::new(config),
            store: Arc::new(store),
            sessions: Arc::new(SessionRegistry::new()),
            templates: Arc::new(templates),
            http,
        })
    }
}

/// Build the application router.
///
/// Web app routes sit innermost, wrapped by the CSRF check, the no-cache
/// response headers (internal pages must never be cached), the access gate
/// (which short-circuits proxy-eligible requests before any of the inner
/// layers run) and the tracing layer outermost.
pub fn build_router(state: AppState) -> Router {
    webapp::router(&state.config.www.internal_prefix)
        .layer(from_fn_with_state(state.clone(), gate::verify_csrf))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(SetResponseHeaderLayer::overriding(header::PRAGMA, HeaderValue::from_static("no-cache")))
        .layer(from_fn_with_state(state.clone(), gate::access_gate))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Main application struct that owns all resources and lifecycle.
///
/// 1. **Create**: [`Application::new`] loads the user database (refusing to
///    start when it is unreadable or unparseable) and assembles the router.
/// 2. **Serve**: [`Application::serve`] binds the TCP listener and runs until
///    the shutdown future resolves.
pub struct Application {
    state: AppState,
    router: Router,
}

impl Application {
    /// Create a new application instance with all resources initialized.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        tracing::debug!("Starting gateway with configuration: {:#?}", config);

        let store = UserStore::load(&config.users.db).await?;
        let state = AppState::new(config, store)?;
        let router = build_router(state.clone());

        Ok(Self { state, router })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Start serving the application with graceful shutdown.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.state.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Gateway listening on http://{}, {} backend(s) configured",
            bind_addr,
            self.state.backends.backends().len()
        );

        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Backend;
    use crate::store::UserData;
    use axum::http::{StatusCode, header};
    use axum_test::{TestResponse, TestServer};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct TestApp {
        server: TestServer,
        state: AppState,
        _dir: TempDir,
    }

    async fn test_app(backends: Vec<Backend>) -> TestApp {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("users.json");
        tokio::fs::write(&db, "{}").await.unwrap();

        let config = Config {
            users: crate::config::UsersConfig { db },
            backends,
            ..Default::default()
        };

        let app = Application::new(config).await.unwrap();
        let server = TestServer::new(app.router.clone()).unwrap();
        TestApp {
            server,
            state: app.state,
            _dir: dir,
        }
    }

    fn backend_to(prefix: &str, target: &str) -> Backend {
        Backend {
            url: prefix.to_string(),
            target: target.parse().unwrap(),
        }
    }

    async fn seed_user(state: &AppState, username: &str, password: &str, tags: &[&str], enabled: bool) {
        state
            .store
            .create(
                username,
                UserData {
                    enabled,
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    password: password.to_string(),
                },
            )
            .await
            .unwrap();
    }

    /// Cookie header for a fresh session plus a known CSRF token.
    fn authed_cookies(state: &AppState, username: &str, csrf: &str) -> HeaderValue {
        let session_id = state.sessions.create(username);
        let www = &state.config.www;
        HeaderValue::from_str(&format!(
            "{}={}; {}={}",
            www.cookie_name, session_id, www.csrf_cookie_name, csrf
        ))
        .unwrap()
    }

    fn set_cookies(response: &TestResponse) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|value| value.to_str().unwrap().to_string())
            .collect()
    }

    fn minted_cookie(response: &TestResponse, name: &str) -> Option<String> {
        set_cookies(response)
            .into_iter()
            .find(|cookie| cookie.starts_with(&format!("{name}=")))
            .and_then(|cookie| {
                cookie
                    .split(';')
                    .next()
                    .and_then(|pair| pair.split_once('='))
                    .map(|(_, value)| value.to_string())
            })
    }

    #[tokio::test]
    async fn test_anonymous_home_mints_csrf_cookie() {
        let app = test_app(vec![]).await;

        let response = app.server.get("/").await;
        response.assert_status(StatusCode::OK);
        assert!(response.text().contains("Sign in"));
        assert!(minted_cookie(&response, "doorward-csrf").is_some());
        // internal pages are never cached
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(response.headers().get(header::PRAGMA).unwrap(), "no-cache");
    }

    #[tokio::test]
    async fn test_existing_csrf_cookie_is_not_reminted() {
        let app = test_app(vec![]).await;

        let response = app
            .server
            .get("/")
            .add_header(header::COOKIE, HeaderValue::from_static("doorward-csrf=tok"))
            .await;
        response.assert_status(StatusCode::OK);
        assert!(minted_cookie(&response, "doorward-csrf").is_none());
    }

    #[tokio::test]
    async fn test_login_flow_end_to_end() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app/hello"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello from backend"))
            .mount(&mock)
            .await;

        let app = test_app(vec![backend_to("/app", &mock.uri())]).await;
        seed_user(&app.state, "alice", "secret", &[], true).await;

        // First visit mints the CSRF token
        let home = app.server.get("/").await;
        let csrf = minted_cookie(&home, "doorward-csrf").unwrap();

        // Log in with the token echoed in the form body
        let login = app
            .server
            .post("/webauth-login")
            .add_header(
                header::COOKIE,
                HeaderValue::from_str(&format!("doorward-csrf={csrf}")).unwrap(),
            )
            .form(&[
                ("username", "alice"),
                ("password", "secret"),
                ("csrf_token", csrf.as_str()),
            ])
            .await;
        login.assert_status(StatusCode::SEE_OTHER);
        let session = minted_cookie(&login, "doorward").unwrap();
        assert_ne!(session, "deleted");

        // The session now reaches the backend
        let proxied = app
            .server
            .get("/app/hello")
            .add_header(
                header::COOKIE,
                HeaderValue::from_str(&format!("doorward={session}")).unwrap(),
            )
            .await;
        proxied.assert_status(StatusCode::OK);
        assert_eq!(proxied.text(), "hello from backend");
        // proxied responses are not stamped with the internal no-cache headers
        assert!(proxied.headers().get(header::CACHE_CONTROL).is_none());
    }

    #[tokio::test]
    async fn test_login_rejects_wrong_password() {
        let app = test_app(vec![]).await;
        seed_user(&app.state, "alice", "secret", &[], true).await;

        let home = app.server.get("/").await;
        let csrf = minted_cookie(&home, "doorward-csrf").unwrap();

        let login = app
            .server
            .post("/webauth-login")
            .add_header(
                header::COOKIE,
                HeaderValue::from_str(&format!("doorward-csrf={csrf}")).unwrap(),
            )
            .form(&[
                ("username", "alice"),
                ("password", "wrong"),
                ("csrf_token", csrf.as_str()),
            ])
            .await;

        login.assert_status(StatusCode::OK);
        assert!(login.text().contains("Unknown or disabled user"));
        assert!(minted_cookie(&login, "doorward").is_none());
    }

    #[tokio::test]
    async fn test_csrf_mismatch_is_rejected_regardless_of_auth_state() {
        let app = test_app(vec![]).await;
        seed_user(&app.state, "alice", "secret", &["admin"], true).await;

        // Anonymous, token missing from the body entirely
        let missing = app
            .server
            .post("/webauth-login")
            .add_header(header::COOKIE, HeaderValue::from_static("doorward-csrf=tok"))
            .form(&[("username", "alice"), ("password", "secret")])
            .await;
        missing.assert_status(StatusCode::FORBIDDEN);
        assert!(missing.text().contains("Invalid CSRF token"));

        // Authenticated, token does not equal the cookie value
        let cookies = authed_cookies(&app.state, "alice", "tok");
        let mismatch = app
            .server
            .post("/webauth-users/new")
            .add_header(header::COOKIE, cookies)
            .form(&[
                ("username", "bob"),
                ("password", "pw"),
                ("password2", "pw"),
                ("csrf_token", "other"),
            ])
            .await;
        mismatch.assert_status(StatusCode::FORBIDDEN);
        assert!(mismatch.text().contains("Invalid CSRF token"));
        assert!(app.state.store.get("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_anonymous_request_to_backend_path_is_denied() {
        let app = test_app(vec![backend_to("/app", "http://127.0.0.1:1")]).await;

        let response = app.server.get("/app/data").await;
        response.assert_status(StatusCode::FORBIDDEN);
        assert!(response.text().contains("Access denied"));
    }

    #[tokio::test]
    async fn test_authenticated_unmatched_path_renders_notfound() {
        let app = test_app(vec![backend_to("/app", "http://127.0.0.1:1")]).await;
        seed_user(&app.state, "alice", "secret", &[], true).await;

        let cookies = authed_cookies(&app.state, "alice", "tok");
        let response = app.server.get("/nowhere").add_header(header::COOKIE, cookies).await;
        response.assert_status(StatusCode::NOT_FOUND);
        assert!(response.text().contains("404"));
    }

    #[tokio::test]
    async fn test_invalid_session_cookie_is_cleared() {
        let app = test_app(vec![]).await;

        let response = app
            .server
            .get("/")
            .add_header(header::COOKIE, HeaderValue::from_static("doorward=bogus"))
            .await;
        response.assert_status(StatusCode::OK);
        assert_eq!(minted_cookie(&response, "doorward").unwrap(), "deleted");
    }

    #[tokio::test]
    async fn test_disabled_user_loses_existing_session() {
        let app = test_app(vec![backend_to("/app", "http://127.0.0.1:1")]).await;
        seed_user(&app.state, "alice", "secret", &[], true).await;
        let cookies = authed_cookies(&app.state, "alice", "tok");

        let alice = app.state.store.get("alice").await.unwrap();
        app.state
            .store
            .update(
                "alice",
                UserData {
                    enabled: false,
                    tags: alice.tags,
                    password: alice.password,
                },
            )
            .await
            .unwrap();

        // Formerly proxy-eligible request is now anonymous: denial page, cookie evicted
        let response = app.server.get("/app/data").add_header(header::COOKIE, cookies).await;
        response.assert_status(StatusCode::FORBIDDEN);
        assert_eq!(minted_cookie(&response, "doorward").unwrap(), "deleted");
        assert_eq!(app.state.sessions.count(), 0);
    }

    #[tokio::test]
    async fn test_logout_destroys_session_and_clears_cookie() {
        let app = test_app(vec![]).await;
        seed_user(&app.state, "alice", "secret", &[], true).await;
        let cookies = authed_cookies(&app.state, "alice", "tok");

        let response = app
            .server
            .get("/webauth-logout")
            .add_header(header::COOKIE, cookies)
            .await;
        response.assert_status(StatusCode::SEE_OTHER);
        assert_eq!(minted_cookie(&response, "doorward").unwrap(), "deleted");
        assert_eq!(app.state.sessions.count(), 0);
    }

    #[tokio::test]
    async fn test_user_admin_requires_admin_tag() {
        let app = test_app(vec![]).await;
        seed_user(&app.state, "plain", "secret", &[], true).await;
        seed_user(&app.state, "root", "secret", &["admin"], true).await;

        // Anonymous: redirected home
        let anonymous = app.server.get("/webauth-users").await;
        anonymous.assert_status(StatusCode::SEE_OTHER);

        // Authenticated but not admin: redirected home
        let plain = app
            .server
            .get("/webauth-users")
            .add_header(header::COOKIE, authed_cookies(&app.state, "plain", "tok"))
            .await;
        plain.assert_status(StatusCode::SEE_OTHER);

        // Admin: the user table
        let admin = app
            .server
            .get("/webauth-users")
            .add_header(header::COOKIE, authed_cookies(&app.state, "root", "tok"))
            .await;
        admin.assert_status(StatusCode::OK);
        assert!(admin.text().contains("plain"));
        assert!(admin.text().contains("root"));
    }

    #[tokio::test]
    async fn test_admin_creates_user() {
        let app = test_app(vec![]).await;
        seed_user(&app.state, "root", "secret", &["admin"], true).await;
        let cookies = authed_cookies(&app.state, "root", "tok");

        let response = app
            .server
            .post("/webauth-users/new")
            .add_header(header::COOKIE, cookies.clone())
            .form(&[
                ("username", "bob"),
                ("tags", "ops, dev"),
                ("password", "hunter2"),
                ("password2", "hunter2"),
                ("enabled", "on"),
                ("csrf_token", "tok"),
            ])
            .await;
        response.assert_status(StatusCode::SEE_OTHER);

        let bob = app.state.store.get("bob").await.unwrap();
        assert_eq!(bob.tags, vec!["dev", "ops"]);
        assert!(app.state.store.authenticate("bob", "hunter2").await.unwrap().is_some());

        // Duplicate username re-renders the form with a field error
        let duplicate = app
            .server
            .post("/webauth-users/new")
            .add_header(header::COOKIE, cookies)
            .form(&[
                ("username", "bob"),
                ("password", "x"),
                ("password2", "x"),
                ("csrf_token", "tok"),
            ])
            .await;
        duplicate.assert_status(StatusCode::OK);
        assert!(duplicate.text().contains("This username already exists"));
    }

    #[tokio::test]
    async fn test_admin_cannot_delete_disable_or_demote_self() {
        let app = test_app(vec![]).await;
        seed_user(&app.state, "root", "secret", &["admin"], true).await;
        let cookies = authed_cookies(&app.state, "root", "tok");

        let delete = app
            .server
            .post("/webauth-users/delete")
            .add_header(header::COOKIE, cookies.clone())
            .form(&[("username", "root"), ("csrf_token", "tok")])
            .await;
        delete.assert_status(StatusCode::OK);
        assert!(delete.text().contains("Can not delete self"));
        assert!(app.state.store.get("root").await.is_some());

        // enabled checkbox absent = disabling
        let disable = app
            .server
            .post("/webauth-users/edit")
            .add_header(header::COOKIE, cookies.clone())
            .form(&[("username", "root"), ("tags", "admin"), ("csrf_token", "tok")])
            .await;
        disable.assert_status(StatusCode::OK);
        assert!(disable.text().contains("Can not disable self"));
        assert!(app.state.store.get("root").await.unwrap().enabled);

        let demote = app
            .server
            .post("/webauth-users/edit")
            .add_header(header::COOKIE, cookies)
            .form(&[
                ("username", "root"),
                ("tags", "ops"),
                ("enabled", "on"),
                ("csrf_token", "tok"),
            ])
            .await;
        demote.assert_status(StatusCode::OK);
        // quotes in the message are HTML-escaped in the rendered page
        assert!(demote.text().contains("Can not remove"));
        assert!(app.state.store.get("root").await.unwrap().is_admin());
    }

    #[tokio::test]
    async fn test_proxy_failure_renders_diagnostic_page() {
        // A port nothing listens on: connections are refused
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let app = test_app(vec![backend_to("/app", &format!("http://127.0.0.1:{port}"))]).await;
        seed_user(&app.state, "alice", "secret", &[], true).await;
        let cookies = authed_cookies(&app.state, "alice", "tok");

        let response = app.server.get("/app/data").add_header(header::COOKIE, cookies).await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.text();
        assert!(body.contains("Something went wrong (diagnostics code: ECONNREFUSED)"));
        // a rendered page, not a raw connection error
        assert!(body.contains("<html"));
    }

    #[tokio::test]
    async fn test_profile_password_change() {
        let app = test_app(vec![]).await;
        seed_user(&app.state, "alice", "secret", &[], true).await;
        let cookies = authed_cookies(&app.state, "alice", "tok");

        let response = app
            .server
            .post("/webauth-users/profile")
            .add_header(header::COOKIE, cookies)
            .form(&[
                ("username", "alice"),
                ("password", "new-secret"),
                ("password2", "new-secret"),
                ("csrf_token", "tok"),
            ])
            .await;
        response.assert_status(StatusCode::SEE_OTHER);

        assert!(app.state.store.authenticate("alice", "secret").await.unwrap().is_none());
        assert!(app.state.store.authenticate("alice", "new-secret").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_profile_rejects_password_mismatch() {
        let app = test_app(vec![]).await;
        seed_user(&app.state, "alice", "secret", &[], true).await;
        let cookies = authed_cookies(&app.state, "alice", "tok");

        let response = app
            .server
            .post("/webauth-users/profile")
            .add_header(header::COOKIE, cookies)
            .form(&[
                ("username", "alice"),
                ("password", "one"),
                ("password2", "two"),
                ("csrf_token", "tok"),
            ])
            .await;
        response.assert_status(StatusCode::OK);
        assert!(response.text().contains("Passwords do not match"));
        assert!(app.state.store.authenticate("alice", "secret").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_startup_fails_without_user_database() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            users: crate::config::UsersConfig {
                db: dir.path().join("absent.json"),
            },
            ..Default::default()
        };

        assert!(Application::new(config).await.is_err());
    }
}
