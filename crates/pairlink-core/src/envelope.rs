//! The JSON wire envelope wrapping every relay message.
//!
//! Shape on the wire:
//!
//!   { "v": 1, "type": "chat.send", "id": "…", "ts": 1712345678901, "payload": { … } }
//!
//! The relay treats `payload` as opaque for everything except `auth`.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version, carried in every envelope's `v` field.
pub const PROTOCOL_VERSION: u32 = 1;

/// Top-level wrapper for all relay protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub ts: i64,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope with a freshly minted id and the current timestamp.
    pub fn new(kind: &str, payload: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            v: PROTOCOL_VERSION,
            kind: kind.to_string(),
            id: generate_id(),
            ts: now_ms(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Deserialize the payload into a concrete type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Random 16-byte identifier formatted as 8-4-4-4-12 hex groups.
///
/// Falls back to a nanosecond timestamp only if the system RNG fails.
fn generate_id() -> String {
    let mut b = [0u8; 16];
    if OsRng.try_fill_bytes(&mut b).is_err() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        return format!("{nanos:x}");
    }
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&b[0..4]),
        hex::encode(&b[4..6]),
        hex::encode(&b[6..8]),
        hex::encode(&b[8..10]),
        hex::encode(&b[10..16]),
    )
}
