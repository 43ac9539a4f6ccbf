//! Page handlers for the internal web app.
//!
//! Admin-only pages silently redirect anonymous and non-admin requests home,
//! mirroring the menu (which never offers them the link in the first place).
//! Lookup failures render the 404 page; form trouble re-renders the form with
//! field-level errors. Neither is an `Error`.

use axum::Extension;
use axum::Form;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use minijinja::{Value, context};

use crate::AppState;
use crate::cookies;
use crate::errors::{Error, Result};
use crate::gate::{AuthedUser, BackendNotFound, CsrfToken, SessionCookie};
use crate::store::{Identity, UserData};
use crate::webapp::{forms, page_context, render};

fn identity(user: &Option<Extension<AuthedUser>>) -> Option<&Identity> {
    user.as_ref().map(|Extension(AuthedUser(identity))| identity)
}

fn require_admin(user: &Option<Extension<AuthedUser>>) -> Option<&Identity> {
    identity(user).filter(|user| user.is_admin())
}

fn home_redirect() -> Response {
    Redirect::to("/").into_response()
}

fn users_url(state: &AppState) -> String {
    format!("{}users", state.config.www.internal_prefix)
}

/// Submitted values fed back into a re-rendered user form.
fn user_form_ctx(form: &forms::UserForm) -> Value {
    context! {
        username => form.username.trim(),
        tags => form.tags.as_deref().unwrap_or(""),
        enabled => forms::checkbox(form.enabled.as_deref()),
    }
}

/// Stored values shown in the edit form.
fn stored_form_ctx(user: &Identity) -> Value {
    context! {
        username => &user.username,
        tags => user.tags.join(", "),
        enabled => user.enabled,
    }
}

fn not_found(state: &AppState, user: Option<&Identity>, csrf: &str) -> Result<Response> {
    let base = page_context(state, user, Some(csrf), "users");
    render(state, StatusCode::NOT_FOUND, "notfound.html", base)
}

pub async fn home(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Extension(CsrfToken(csrf)): Extension<CsrfToken>,
) -> Result<Response> {
    let base = page_context(&state, identity(&user), Some(&csrf), "home");
    render(
        &state,
        StatusCode::OK,
        "index.html",
        context! { backends => state.backends.backends(), ..base },
    )
}

pub async fn login_page(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Extension(CsrfToken(csrf)): Extension<CsrfToken>,
) -> Result<Response> {
    let base = page_context(&state, identity(&user), Some(&csrf), "login");
    render(&state, StatusCode::OK, "login.html", base)
}

fn login_failed(state: &AppState, csrf: &str, username: &str, message: &str) -> Result<Response> {
    let base = page_context(state, None, Some(csrf), "login");
    render(
        state,
        StatusCode::OK,
        "login.html",
        context! {
            error => context! { title => "Authentication failed!", message => message },
            form => context! { username => username },
            ..base
        },
    )
}

pub async fn login_submit(
    State(state): State<AppState>,
    Extension(CsrfToken(csrf)): Extension<CsrfToken>,
    Form(form): Form<forms::LoginForm>,
) -> Result<Response> {
    let username = form.username.trim().to_string();
    if username.is_empty() || username.len() > 256 || form.password.is_empty() || form.password.len() > 256 {
        return login_failed(&state, &csrf, &username, "Input validation failed");
    }

    match state.store.authenticate(&username, &form.password).await? {
        Some(user) => {
            let session_id = state.sessions.create(&user.username);
            tracing::info!("User {} logged in", user.username);
            let cookie = cookies::set_cookie(&state.config.www.cookie_name, &session_id);
            Ok(([(header::SET_COOKIE, cookie)], Redirect::to("/")).into_response())
        }
        None => login_failed(&state, &csrf, &username, "Unknown or disabled user"),
    }
}

pub async fn logout(State(state): State<AppState>, session: Option<Extension<SessionCookie>>) -> Response {
    if let Some(Extension(SessionCookie(session_id))) = session {
        state.sessions.destroy(&session_id);
    }
    let cookie = cookies::clear_cookie(&state.config.www.cookie_name);
    ([(header::SET_COOKIE, cookie)], Redirect::to("/")).into_response()
}

pub async fn users_list(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Extension(CsrfToken(csrf)): Extension<CsrfToken>,
) -> Result<Response> {
    let Some(current) = require_admin(&user) else {
        return Ok(home_redirect());
    };

    let users = state.store.list().await;
    let base = page_context(&state, Some(current), Some(&csrf), "users");
    render(&state, StatusCode::OK, "users.html", context! { users => users, ..base })
}

pub async fn user_new_page(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Extension(CsrfToken(csrf)): Extension<CsrfToken>,
) -> Result<Response> {
    let Some(current) = require_admin(&user) else {
        return Ok(home_redirect());
    };

    let base = page_context(&state, Some(current), Some(&csrf), "users");
    render(
        &state,
        StatusCode::OK,
        "users-new.html",
        context! { form => context! { enabled => true }, ..base },
    )
}

fn user_new_failed(
    state: &AppState,
    current: &Identity,
    csrf: &str,
    form: &forms::UserForm,
    message: &str,
    errors: forms::FieldErrors,
) -> Result<Response> {
    let base = page_context(state, Some(current), Some(csrf), "users");
    render(
        state,
        StatusCode::OK,
        "users-new.html",
        context! {
            error => context! { title => "Error", message => message },
            errors => errors,
            form => user_form_ctx(form),
            ..base
        },
    )
}

pub async fn user_new_submit(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Extension(CsrfToken(csrf)): Extension<CsrfToken>,
    Form(form): Form<forms::UserForm>,
) -> Result<Response> {
    let Some(current) = require_admin(&user) else {
        return Ok(home_redirect());
    };

    let parsed = match forms::validate_user_form(&form, forms::PasswordRule::Required) {
        Ok(parsed) => parsed,
        Err(errors) => return user_new_failed(&state, current, &csrf, &form, "Input validation failed", errors),
    };

    if state.store.get(&parsed.username).await.is_some() {
        let mut errors = forms::FieldErrors::new();
        errors.insert("username", "This username already exists".to_string());
        return user_new_failed(&state, current, &csrf, &form, "Selected username is already in use", errors);
    }

    let Some(password) = parsed.password else {
        return Err(Error::Internal {
            operation: "validate new user password".to_string(),
        });
    };

    state
        .store
        .create(
            &parsed.username,
            UserData {
                enabled: parsed.enabled,
                tags: parsed.tags,
                password,
            },
        )
        .await?;
    tracing::info!("User {} created by {}", parsed.username, current.username);

    Ok(Redirect::to(&users_url(&state)).into_response())
}

pub async fn user_edit_page(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Extension(CsrfToken(csrf)): Extension<CsrfToken>,
    Query(query): Query<forms::EditQuery>,
) -> Result<Response> {
    let Some(current) = require_admin(&user) else {
        return Ok(home_redirect());
    };

    let username = match query.username.as_deref().map(forms::validate_username) {
        Some(Ok(username)) => username,
        _ => return Ok(Redirect::to(&users_url(&state)).into_response()),
    };

    let Some(existing) = state.store.get(&username).await else {
        return not_found(&state, Some(current), &csrf);
    };

    let base = page_context(&state, Some(current), Some(&csrf), "users");
    render(
        &state,
        StatusCode::OK,
        "users-edit.html",
        context! { form => stored_form_ctx(&existing), ..base },
    )
}

fn user_edit_failed(
    state: &AppState,
    current: &Identity,
    csrf: &str,
    form: Value,
    message: &str,
    errors: forms::FieldErrors,
) -> Result<Response> {
    let base = page_context(state, Some(current), Some(csrf), "users");
    render(
        state,
        StatusCode::OK,
        "users-edit.html",
        context! {
            error => context! { title => "Error", message => message },
            errors => errors,
            form => form,
            ..base
        },
    )
}

pub async fn user_edit_submit(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Extension(CsrfToken(csrf)): Extension<CsrfToken>,
    Form(form): Form<forms::UserForm>,
) -> Result<Response> {
    let Some(current) = require_admin(&user) else {
        return Ok(home_redirect());
    };

    let parsed = match forms::validate_user_form(&form, forms::PasswordRule::Optional) {
        Ok(parsed) => parsed,
        Err(errors) => {
            return user_edit_failed(&state, current, &csrf, user_form_ctx(&form), "Input validation failed", errors);
        }
    };

    let Some(existing) = state.store.get(&parsed.username).await else {
        return not_found(&state, Some(current), &csrf);
    };

    // Self-protection: an admin cannot lock themselves out
    if parsed.username == current.username {
        let mut errors = forms::FieldErrors::new();
        if !parsed.enabled {
            errors.insert("enabled", "Can not disable self".to_string());
        }
        if existing.is_admin() && !parsed.tags.iter().any(|tag| tag == "admin") {
            errors.insert("tags", "Can not remove \"admin\" tag from self".to_string());
        }
        if !errors.is_empty() {
            return user_edit_failed(&state, current, &csrf, user_form_ctx(&form), "Input validation failed", errors);
        }
    }

    let password = parsed.password.unwrap_or(existing.password);
    state
        .store
        .update(
            &parsed.username,
            UserData {
                enabled: parsed.enabled,
                tags: parsed.tags,
                password,
            },
        )
        .await?;

    Ok(Redirect::to(&users_url(&state)).into_response())
}

pub async fn user_delete(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Extension(CsrfToken(csrf)): Extension<CsrfToken>,
    Form(form): Form<forms::DeleteForm>,
) -> Result<Response> {
    let Some(current) = require_admin(&user) else {
        return Ok(home_redirect());
    };

    let Ok(username) = forms::validate_username(&form.username) else {
        return not_found(&state, Some(current), &csrf);
    };

    let Some(existing) = state.store.get(&username).await else {
        return not_found(&state, Some(current), &csrf);
    };

    if username == current.username {
        let mut errors = forms::FieldErrors::new();
        errors.insert("username", "Can not delete self".to_string());
        return user_edit_failed(&state, current, &csrf, stored_form_ctx(&existing), "Can not delete self", errors);
    }

    state.store.delete(&username).await?;
    tracing::info!("User {} deleted by {}", username, current.username);

    Ok(Redirect::to(&users_url(&state)).into_response())
}

pub async fn profile_page(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Extension(CsrfToken(csrf)): Extension<CsrfToken>,
) -> Result<Response> {
    let Some(current) = identity(&user) else {
        return Ok(home_redirect());
    };

    let base = page_context(&state, Some(current), Some(&csrf), "profile");
    render(
        &state,
        StatusCode::OK,
        "users-profile.html",
        context! { form => context! { username => &current.username }, ..base },
    )
}

pub async fn profile_submit(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Extension(CsrfToken(csrf)): Extension<CsrfToken>,
    Form(form): Form<forms::ProfileForm>,
) -> Result<Response> {
    let Some(current) = identity(&user) else {
        return Ok(home_redirect());
    };

    let mut errors = forms::FieldErrors::new();
    if form.username.trim() != current.username {
        errors.insert("username", "Invalid username".to_string());
    }
    let password = forms::validate_password_pair(
        form.password.as_deref().filter(|p| !p.is_empty()),
        form.password2.as_deref().filter(|p| !p.is_empty()),
        forms::PasswordRule::Optional,
        &mut errors,
    );

    if !errors.is_empty() {
        let base = page_context(&state, Some(current), Some(&csrf), "profile");
        return render(
            &state,
            StatusCode::OK,
            "users-profile.html",
            context! {
                error => context! { title => "Error", message => "Input validation failed" },
                errors => errors,
                form => context! { username => &current.username },
                ..base
            },
        );
    }

    let Some(existing) = state.store.get(&current.username).await else {
        return not_found(&state, Some(current), &csrf);
    };

    if let Some(password) = password {
        state
            .store
            .update(
                &current.username,
                UserData {
                    enabled: existing.enabled,
                    tags: existing.tags,
                    password,
                },
            )
            .await?;
        tracing::info!("User {} changed their password", current.username);
    }

    Ok(Redirect::to(&format!("{}users/profile", state.config.www.internal_prefix)).into_response())
}

/// Terminal pages for requests no route claimed: 404 when the gate found no
/// backend for a valid session, 403 otherwise.
pub async fn fallback(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    not_found: Option<Extension<BackendNotFound>>,
    csrf: Option<Extension<CsrfToken>>,
) -> Result<Response> {
    let csrf = csrf.map(|Extension(CsrfToken(token))| token);
    let base = page_context(&state, identity(&user), csrf.as_deref(), "");

    if not_found.is_some() {
        render(&state, StatusCode::NOT_FOUND, "notfound.html", base)
    } else {
        render(&state, StatusCode::FORBIDDEN, "error.html", base)
    }
}
