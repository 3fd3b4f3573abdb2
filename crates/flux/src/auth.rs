//! Shared-secret challenge/response handshake primitives.
//!
//! Both the coordinator and the worker run the exact same two-way
//! challenge/auth exchange, so the mechanics live here rather than being
//! duplicated on each side of the connection.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// Number of random bytes in a challenge nonce, before hex-encoding.
pub const NONCE_BYTES: usize = 20;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed hex in challenge/auth field")]
    BadHex(#[from] hex::FromHexError),
    #[error("HMAC key of invalid length")]
    BadKey,
}

/// Generates a fresh, hex-encoded challenge nonce.
pub fn new_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Computes `HMAC-SHA1(secret, nonce)`, returned as lowercase hex, matching
/// the wire representation used by the `auth:<mac>` frame.
pub fn compute_mac(secret: &[u8], nonce: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(nonce.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies that `candidate_mac` (hex) is the correct HMAC of `nonce` under `secret`.
pub fn verify_mac(secret: &[u8], nonce: &str, candidate_mac: &str) -> Result<bool, AuthError> {
    let candidate = hex::decode(candidate_mac)?;
    let mut mac = HmacSha1::new_from_slice(secret).map_err(|_| AuthError::BadKey)?;
    mac.update(nonce.as_bytes());
    Ok(mac.verify_slice(&candidate).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trips() {
        let nonce = new_nonce();
        assert_eq!(nonce.len(), NONCE_BYTES * 2);

        let mac = compute_mac(b"sekrit", &nonce);
        assert!(verify_mac(b"sekrit", &nonce, &mac).unwrap());
    }

    #[test]
    fn mac_rejects_wrong_secret() {
        let nonce = new_nonce();
        let mac = compute_mac(b"sekrit", &nonce);
        assert!(!verify_mac(b"wrong", &nonce, &mac).unwrap());
    }

    #[test]
    fn known_answer() {
        // HMAC-SHA1("key", "The quick brown fox jumps over the lazy dog")
        let mac = compute_mac(b"key", "The quick brown fox jumps over the lazy dog");
        assert_eq!(mac, "de7c9b85b8b78aa6bc8a7a36f70a90701c9db4d9");
    }
}
