//! Signed admin session tokens and the cookie that carries them.
//!
//! A token is `base64("{role}:{issued_at_ms}:{hex hmac-sha256}")`, signed over
//! `"{role}:{issued_at_ms}"`. Tokens are stateless: nothing is stored server
//! side, and rotating the signing key invalidates every session.

use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use common::security::constant_time_eq;
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const ADMIN_ROLE: &str = "admin";
pub const SESSION_COOKIE: &str = "forecaster_admin";
pub const SESSION_MAX_AGE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

fn sign(secret: &[u8], payload: &str) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn issue(role: &str, secret: &[u8]) -> Result<String, InvalidLength> {
    issue_at(role, secret, chrono::Utc::now().timestamp_millis())
}

pub fn issue_at(role: &str, secret: &[u8], issued_at_ms: i64) -> Result<String, InvalidLength> {
    let payload = format!("{role}:{issued_at_ms}");
    let signature = sign(secret, &payload)?;
    Ok(STANDARD.encode(format!("{payload}:{signature}")))
}

/// `true` only for an untampered admin token at most 7 days old.
pub fn validate(token: &str, secret: &[u8], now_ms: i64) -> bool {
    let Ok(raw) = STANDARD.decode(token.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(raw) else {
        return false;
    };
    let mut parts = decoded.split(':');
    let (Some(role), Some(issued_at), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if role != ADMIN_ROLE {
        return false;
    }
    let Ok(issued_at_ms) = issued_at.parse::<i64>() else {
        return false;
    };
    if now_ms.saturating_sub(issued_at_ms) > SESSION_MAX_AGE_MS {
        return false;
    }
    let Ok(expected) = sign(secret, &format!("{role}:{issued_at}")) else {
        return false;
    };
    constant_time_eq(signature.as_bytes(), expected.as_bytes())
}

pub fn session_cookie(token: &str, secure: bool) -> String {
    build_cookie(token, SESSION_MAX_AGE_MS / 1000, secure)
}

pub fn clear_cookie(secure: bool) -> String {
    build_cookie("", 0, secure)
}

fn build_cookie(value: &str, max_age_secs: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={value}; Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age_secs}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// First value of cookie `name` across all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then(|| v.to_string())
        })
}
