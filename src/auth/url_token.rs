//! Time-limited download tokens for public paths.
//!
//! A token is `base64url(nonce || AES-256-GCM ciphertext)` where the key is
//! the SHA-256 of the hospital's shared secret and the plaintext is a JSON
//! claim set `{exp, iat, path, jti}`. The validator decrypts, binds the
//! claimed path to the actual request path, and enforces expiry. Replay
//! prevention beyond expiry is not attempted.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

pub const NONCE_LEN: usize = 12;

/// Tolerated forward clock skew on `iat`.
const MAX_CLOCK_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("missing download token")]
    Missing,
    #[error("malformed download token")]
    Malformed,
    #[error("download token decryption failed")]
    Decrypt,
    #[error("download token expired")]
    Expired,
    #[error("download token not yet valid")]
    NotYetValid,
    #[error("download token path mismatch")]
    PathMismatch,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct DownloadClaims {
    exp: i64,
    iat: i64,
    path: String,
    jti: String,
}

fn derive_key(secret: &str) -> Aes256Gcm {
    let digest = Sha256::digest(secret.as_bytes());
    Aes256Gcm::new_from_slice(&digest).expect("SHA-256 digest is a valid AES-256 key")
}

/// Validate a download token against the hospital secret and the actual
/// request path. `now` is Unix seconds.
pub fn validate(token: &str, secret: &str, request_path: &str, now: i64) -> Result<(), TokenError> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| TokenError::Malformed)?;
    if raw.len() <= NONCE_LEN {
        return Err(TokenError::Malformed);
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let plaintext = derive_key(secret)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| TokenError::Decrypt)?;
    let claims: DownloadClaims =
        serde_json::from_slice(&plaintext).map_err(|_| TokenError::Malformed)?;

    if claims.jti.is_empty() {
        return Err(TokenError::Malformed);
    }
    if claims.path != request_path {
        return Err(TokenError::PathMismatch);
    }
    if now > claims.exp {
        return Err(TokenError::Expired);
    }
    if claims.iat > now + MAX_CLOCK_SKEW_SECS {
        return Err(TokenError::NotYetValid);
    }
    Ok(())
}
