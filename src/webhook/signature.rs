//! Linear webhook signature verification.
//!
//! Linear signs the raw request body with HMAC-SHA256 and sends the lowercase
//! hex digest, without any prefix, in the `linear-signature` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "linear-signature";

/// Hex HMAC-SHA256 of `payload`. Used to sign test deliveries.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of `signature` against `payload`. Malformed hex is a
/// mismatch, never a panic.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &[u8]) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
