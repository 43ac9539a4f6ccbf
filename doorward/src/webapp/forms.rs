//! Form payloads and validation for the internal web app.
//!
//! Validation failures never become errors; they collect into a field → message
//! map that the handlers feed back into the form templates.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Field name → validation message, rendered next to the offending input.
pub type FieldErrors = BTreeMap<&'static str, String>;

const MAX_FIELD: usize = 256;

#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserForm {
    #[serde(default)]
    pub username: String,
    pub tags: Option<String>,
    pub password: Option<String>,
    pub password2: Option<String>,
    pub enabled: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProfileForm {
    #[serde(default)]
    pub username: String,
    pub password: Option<String>,
    pub password2: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteForm {
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct EditQuery {
    pub username: Option<String>,
}

/// Checkbox semantics: present and truthy means checked.
pub fn checkbox(value: Option<&str>) -> bool {
    matches!(value, Some("on" | "true" | "yes" | "Y" | "1"))
}

/// Comma-separated tag list: trimmed, empties dropped, sorted.
pub fn parse_tags(raw: Option<&str>) -> Vec<String> {
    let mut tags: Vec<String> = raw
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect();
    tags.sort();
    tags
}

pub fn validate_username(raw: &str) -> Result<String, String> {
    let username = raw.trim();
    if username.is_empty() {
        return Err("Username is required".to_string());
    }
    if username.len() > MAX_FIELD {
        return Err(format!("Username must be at most {MAX_FIELD} characters"));
    }
    Ok(username.to_string())
}

/// Whether the password pair may be left empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordRule {
    Required,
    Optional,
}

/// Validate a password/repeat pair. Empty inputs count as absent.
pub fn validate_password_pair(
    password: Option<&str>,
    password2: Option<&str>,
    rule: PasswordRule,
    errors: &mut FieldErrors,
) -> Option<String> {
    match (password, rule) {
        (None, PasswordRule::Required) => {
            errors.insert("password", "Password is required".to_string());
            None
        }
        (None, PasswordRule::Optional) => None,
        (Some(password), _) => {
            if password.len() > MAX_FIELD {
                errors.insert("password", format!("Password must be at most {MAX_FIELD} characters"));
                return None;
            }
            if Some(password) != password2 {
                errors.insert("password", "Passwords do not match".to_string());
                return None;
            }
            Some(password.to_string())
        }
    }
}

/// Validated form data for user create/edit submissions.
#[derive(Debug)]
pub struct ParsedUser {
    pub username: String,
    pub tags: Vec<String>,
    pub password: Option<String>,
    pub enabled: bool,
}

pub fn validate_user_form(form: &UserForm, rule: PasswordRule) -> Result<ParsedUser, FieldErrors> {
    let mut errors = FieldErrors::new();

    let username = match validate_username(&form.username) {
        Ok(username) => username,
        Err(message) => {
            errors.insert("username", message);
            String::new()
        }
    };

    if form.tags.as_deref().map(str::len).unwrap_or(0) > MAX_FIELD {
        errors.insert("tags", format!("Tags must be at most {MAX_FIELD} characters"));
    }

    let password = validate_password_pair(
        form.password.as_deref().filter(|p| !p.is_empty()),
        form.password2.as_deref().filter(|p| !p.is_empty()),
        rule,
        &mut errors,
    );

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ParsedUser {
        username,
        tags: parse_tags(form.tags.as_deref()),
        password,
        enabled: checkbox(form.enabled.as_deref()),
    })
}
