//! Admin sessions, CSRF protection and input checks.
//!
//! The session cookie holds `base64url(email).expiry.hex(hmac)`, signed
//! with HMAC-SHA256 over `email|expiry`. The CSRF cookie is readable by
//! scripts and must be echoed in `X-CSRF-Token` on mutating admin calls.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::error::ApiError;
use super::AppState;
use crate::gateway::constant_time_eq;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "cb-session";
pub const CSRF_COOKIE: &str = "cb-csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const SESSION_TTL_SECS: i64 = 60 * 60;

const MIN_PASSWORD_LEN: usize = 6;

// ── Tokens ───────────────────────────────────────────────

pub fn sign_session(secret: &[u8], email: &str, expires_at: i64) -> String {
    let mac = session_mac(secret, email, expires_at);
    format!(
        "{}.{expires_at}.{}",
        URL_SAFE_NO_PAD.encode(email),
        hex::encode(mac)
    )
}

/// Email of a valid, unexpired session token.
pub fn verify_session(secret: &[u8], token: &str, now: i64) -> Option<String> {
    let mut parts = token.splitn(3, '.');
    let email = URL_SAFE_NO_PAD.decode(parts.next()?).ok()?;
    let email = String::from_utf8(email).ok()?;
    let expires_at: i64 = parts.next()?.parse().ok()?;
    let signature = hex::decode(parts.next()?).ok()?;

    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(session_payload(&email, expires_at).as_bytes());
    mac.verify_slice(&signature).ok()?;

    (expires_at > now).then_some(email)
}

fn session_payload(email: &str, expires_at: i64) -> String {
    format!("{email}|{expires_at}")
}

fn session_mac(secret: &[u8], email: &str, expires_at: i64) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };
    mac.update(session_payload(email, expires_at).as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// 32 random bytes as 64 hex chars.
pub fn generate_csrf_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn is_valid_csrf_token(token: &str) -> bool {
    token.len() == 64 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

// ── Cookies ──────────────────────────────────────────────

pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

pub fn session_cookie(token: &str, secure: bool) -> String {
    format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={SESSION_TTL_SECS}{}",
        secure_flag(secure)
    )
}

pub fn csrf_cookie(token: &str, secure: bool) -> String {
    format!(
        "{CSRF_COOKIE}={token}; Path=/; SameSite=Strict; Max-Age={SESSION_TTL_SECS}{}",
        secure_flag(secure)
    )
}

pub fn expired_cookie(name: &str) -> String {
    format!("{name}=; Path=/; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT")
}

fn secure_flag(secure: bool) -> &'static str {
    if secure { "; Secure" } else { "" }
}

// ── Input checks ─────────────────────────────────────────

/// `local@domain.tld` with no whitespace.
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

pub fn is_valid_password(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_LEN
}

// ── Extractors ───────────────────────────────────────────

/// A signed-in administrator.
#[derive(Debug, Clone)]
pub struct AdminSession {
    pub email: String,
}

impl FromRequestParts<AppState> for AdminSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = cookie_value(&parts.headers, SESSION_COOKIE)
            .ok_or(ApiError::Unauthorized("not signed in"))?;
        let email = verify_session(&state.config.session_secret, token, Utc::now().timestamp())
            .ok_or(ApiError::Unauthorized("session invalid or expired"))?;
        Ok(AdminSession { email })
    }
}

/// A signed-in administrator whose request carries the CSRF token.
#[derive(Debug, Clone)]
pub struct CsrfProtected(pub AdminSession);

impl FromRequestParts<AppState> for CsrfProtected {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let session = AdminSession::from_request_parts(parts, state).await?;
        let sent = parts
            .headers
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Forbidden("missing CSRF token"))?;
        let expected = cookie_value(&parts.headers, CSRF_COOKIE).ok_or(ApiError::Forbidden("missing CSRF cookie"))?;
        if !is_valid_csrf_token(sent) || !constant_time_eq(sent.as_bytes(), expected.as_bytes()) {
            return Err(ApiError::Forbidden("invalid CSRF token"));
        }
        Ok(CsrfProtected(session))
    }
}
