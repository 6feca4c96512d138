use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{SecondsFormat, Utc};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::types::Auth;

const NONCE_LEN: usize = 16;

/// Merchant credentials for the checkout gateway.
#[derive(Clone)]
pub struct Credentials {
    login: String,
    secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    pub fn new(login: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Fresh `auth` block: new random nonce, seed = now. Every request
    /// needs its own.
    pub fn auth(&self) -> Auth {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let seed = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.auth_with(&nonce, seed)
    }

    pub(crate) fn auth_with(&self, nonce: &[u8], seed: String) -> Auth {
        Auth {
            login: self.login.clone(),
            tran_key: tran_key(nonce, &seed, &self.secret_key),
            nonce: STANDARD.encode(nonce),
            seed,
        }
    }

    /// Signature the gateway attaches to notifications.
    pub fn notification_signature(&self, request_id: &str, status: &str, date: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(request_id.as_bytes());
        hasher.update(status.as_bytes());
        hasher.update(date.as_bytes());
        hasher.update(self.secret_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify_notification(&self, request_id: &str, status: &str, date: &str, signature: &str) -> bool {
        let expected = self.notification_signature(request_id, status, date);
        constant_time_eq(expected.as_bytes(), signature.to_ascii_lowercase().as_bytes())
    }
}

/// `Base64(SHA-256(nonce || seed || secret))`, over the raw nonce bytes.
pub fn tran_key(nonce: &[u8], seed: &str, secret_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(seed.as_bytes());
    hasher.update(secret_key.as_bytes());
    STANDARD.encode(hasher.finalize())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
