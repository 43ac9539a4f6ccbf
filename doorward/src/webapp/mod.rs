//! The internal gatekeeping web application.
//!
//! Contract with the gate: given a request plus the resolved identity and the
//! request's CSRF token in extensions, produce a response. Pages are rendered
//! with minijinja from a shared layout; the menu adapts to the identity
//! (anonymous browsers get a login link, `admin`-tagged users get the user
//! administration pages).

pub mod forms;
pub mod handlers;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use minijinja::{Environment, UndefinedBehavior, Value, context};
use serde::Serialize;

use crate::AppState;
use crate::errors::Result;
use crate::store::Identity;

/// Build the template environment once at startup.
pub fn environment() -> std::result::Result<Environment<'static>, minijinja::Error> {
    let mut env = Environment::new();
    // Forms and field errors are only present on re-renders; chains like
    // `form.username` must resolve to empty rather than erroring.
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env.add_template("layout.html", include_str!("templates/layout.html"))?;
    env.add_template("index.html", include_str!("templates/index.html"))?;
    env.add_template("login.html", include_str!("templates/login.html"))?;
    env.add_template("users.html", include_str!("templates/users.html"))?;
    env.add_template("users-new.html", include_str!("templates/users-new.html"))?;
    env.add_template("users-edit.html", include_str!("templates/users-edit.html"))?;
    env.add_template("users-profile.html", include_str!("templates/users-profile.html"))?;
    env.add_template("notfound.html", include_str!("templates/notfound.html"))?;
    env.add_template("error.html", include_str!("templates/error.html"))?;
    env.add_template("errormessage.html", include_str!("templates/errormessage.html"))?;
    Ok(env)
}

/// Internal app routes under the reserved prefix, plus the home page.
///
/// The fallback owns the two terminal pages: 404 when the gate marked the
/// request as matching no backend, 403 otherwise.
pub fn router(prefix: &str) -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::home))
        .route(&format!("{prefix}login"), get(handlers::login_page).post(handlers::login_submit))
        .route(&format!("{prefix}logout"), get(handlers::logout))
        .route(&format!("{prefix}users"), get(handlers::users_list))
        .route(
            &format!("{prefix}users/new"),
            get(handlers::user_new_page).post(handlers::user_new_submit),
        )
        .route(
            &format!("{prefix}users/edit"),
            get(handlers::user_edit_page).post(handlers::user_edit_submit),
        )
        .route(&format!("{prefix}users/delete"), post(handlers::user_delete))
        .route(
            &format!("{prefix}users/profile"),
            get(handlers::profile_page).post(handlers::profile_submit),
        )
        .fallback(handlers::fallback)
}

#[derive(Debug, Serialize)]
struct MenuItem {
    key: &'static str,
    title: &'static str,
    url: String,
    active: bool,
}

fn menu(user: Option<&Identity>, prefix: &str, active: &str) -> Vec<MenuItem> {
    let mut items = vec![MenuItem {
        key: "home",
        title: "Home",
        url: "/".to_string(),
        active: active == "home",
    }];

    match user {
        None => items.push(MenuItem {
            key: "login",
            title: "Log in",
            url: format!("{prefix}login"),
            active: active == "login",
        }),
        Some(user) => {
            if user.is_admin() {
                items.push(MenuItem {
                    key: "users",
                    title: "Users",
                    url: format!("{prefix}users"),
                    active: active == "users",
                });
            }
            items.push(MenuItem {
                key: "profile",
                title: "Profile",
                url: format!("{prefix}users/profile"),
                active: active == "profile",
            });
            items.push(MenuItem {
                key: "logout",
                title: "Log out",
                url: format!("{prefix}logout"),
                active: active == "logout",
            });
        }
    }

    items
}

/// Base context shared by every page: identity, menu, CSRF token, prefix.
pub(crate) fn page_context(state: &AppState, user: Option<&Identity>, csrf_token: Option<&str>, active: &str) -> Value {
    let prefix = &state.config.www.internal_prefix;
    context! {
        user => user,
        csrf_token => csrf_token,
        prefix => prefix,
        menu => menu(user, prefix, active),
    }
}

pub(crate) fn render(state: &AppState, status: StatusCode, template: &str, ctx: Value) -> Result<Response> {
    let template = state.templates.get_template(template)?;
    let html = template.render(ctx)?;
    Ok((status, Html(html)).into_response())
}

/// Render the generic failure page (CSRF rejection, proxy diagnostics).
///
/// Infallible: template trouble degrades to the plain error response.
pub fn error_message(state: &AppState, user: Option<&Identity>, status: StatusCode, message: &str) -> Response {
    let base = page_context(state, user, None, "");
    let ctx = context! {
        code => status.as_u16(),
        message => message,
        ..base
    };
    match render(state, status, "errormessage.html", ctx) {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}
