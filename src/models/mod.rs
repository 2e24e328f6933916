pub mod event;
pub mod grant;
pub mod key;
pub mod record;
pub mod reward;
pub mod user;

pub use event::*;
pub use grant::*;
pub use key::*;
pub use record::*;
pub use reward::*;
pub use user::*;

/// Serde adapter for binary payloads carried as base64 strings in JSON
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.trim()).map_err(serde::de::Error::custom)
    }
}
