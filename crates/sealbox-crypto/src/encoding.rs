//! Base64 encoding for persisted binary fields
//!
//! Every binary field of a stored record is standard padded base64.

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::error::CryptoError;

/// Encode bytes as standard base64
pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64, reporting failures as [`CryptoError::Format`]
pub fn decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| CryptoError::format(format!("invalid base64: {}", e)))
}

/// `#[serde(with = ...)]` adapter for byte vectors.
///
/// Human-readable formats (JSON records) get a base64 string; compact
/// formats such as postcard get raw bytes.
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer, T: AsRef<[u8]>>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&super::encode(bytes))
        } else {
            serializer.serialize_bytes(bytes.as_ref())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            super::decode(&text).map_err(D::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer)
        }
    }
}
