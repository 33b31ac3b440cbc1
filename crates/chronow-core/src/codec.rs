//! Payload encoding, size guarding, and content hashing.

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// A JSON-encoded payload together with its byte length.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub json: String,
    pub size: usize,
}

impl Encoded {
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.json)
    }
}

/// Encode `value` as JSON, rejecting results larger than `max_bytes`.
pub fn encode_payload(value: &serde_json::Value, max_bytes: usize) -> Result<Encoded> {
    let json = serde_json::to_string(value)?;
    let size = json.len();
    if size > max_bytes {
        return Err(CoreError::PayloadTooLarge {
            size,
            max: max_bytes,
        });
    }
    Ok(Encoded { json, size })
}

/// Hex-encoded SHA-256 of the encoded payload.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_within_limit() {
        let encoded = encode_payload(&json!({"id": "A"}), 1024).unwrap();
        assert_eq!(encoded.json, r#"{"id":"A"}"#);
        assert_eq!(encoded.size, 10);
    }

    #[test]
    fn rejects_oversize_payloads() {
        let big = json!({ "data": "x".repeat(2000) });
        let err = encode_payload(&big, 1024).unwrap_err();
        match err {
            CoreError::PayloadTooLarge { size, max } => {
                assert!(size > 1024);
                assert_eq!(max, 1024);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn hash_is_stable_and_hex() {
        let a = content_hash(b"hello");
        let b = content_hash(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, content_hash(b"hello!"));
    }
}
