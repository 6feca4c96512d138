use axum::{
    extract::State,
    http::{header, HeaderValue},
    response::Response,
    Form,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use super::security::{
    csrf_cookie, expired_cookie, generate_csrf_token, is_valid_email, is_valid_password, session_cookie,
    sign_session, CSRF_COOKIE, SESSION_COOKIE, SESSION_TTL_SECS,
};
use super::{found, ApiError, AppState};
use crate::gateway::constant_time_eq;

#[derive(Deserialize)]
pub(super) struct SigninForm {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

pub(super) async fn signin(
    State(state): State<AppState>,
    Form(form): Form<SigninForm>,
) -> Result<Response, ApiError> {
    let (Some(email), Some(password)) = (
        form.email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty()),
        form.password.filter(|p| !p.is_empty()),
    ) else {
        return Err(ApiError::bad_request("email and password are required"));
    };
    if !is_valid_email(&email) || !is_valid_password(&password) {
        return Err(ApiError::bad_request("invalid email or password format"));
    }

    let config = &state.config;
    let email_ok = constant_time_eq(
        email.to_lowercase().as_bytes(),
        config.admin_email.to_lowercase().as_bytes(),
    );
    let password_ok = constant_time_eq(password.as_bytes(), config.admin_password.as_bytes());
    if !(email_ok && password_ok) {
        warn!("failed admin sign-in for {email}");
        return Err(ApiError::Unauthorized("invalid credentials"));
    }

    let expires_at = Utc::now().timestamp() + SESSION_TTL_SECS;
    let session = sign_session(&config.session_secret, &config.admin_email, expires_at);
    let csrf = generate_csrf_token();

    let mut response = found("/admin");
    for cookie in [
        session_cookie(&session, config.production),
        csrf_cookie(&csrf, config.production),
    ] {
        let value = HeaderValue::from_str(&cookie).map_err(|e| ApiError::Internal(format!("cookie: {e}")))?;
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    info!("admin {} signed in", config.admin_email);
    Ok(response)
}

pub(super) async fn signout() -> Result<Response, ApiError> {
    let mut response = found("/");
    for name in [SESSION_COOKIE, CSRF_COOKIE] {
        let value =
            HeaderValue::from_str(&expired_cookie(name)).map_err(|e| ApiError::Internal(format!("cookie: {e}")))?;
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    Ok(response)
}
