//! Pairing-token minting.
//!
//! Tokens are opaque printable strings: a fixed prefix followed by
//! 16 crypto-random bytes in hex. They are shared out-of-band with
//! both endpoints of a pairing.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;

pub const TOKEN_PREFIX: &str = "pl_pair_";

/// Mint a new pairing token.
///
/// Falls back to a nanosecond timestamp only if the system RNG fails.
pub fn generate_token() -> String {
    let mut b = [0u8; 16];
    if OsRng.try_fill_bytes(&mut b).is_err() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        return format!("{TOKEN_PREFIX}{nanos:x}");
    }
    format!("{TOKEN_PREFIX}{}", hex::encode(b))
}

/// Shorten a token for log output.
pub fn redact(token: &str) -> String {
    format!("{}...", &token[..16.min(token.len())])
}
