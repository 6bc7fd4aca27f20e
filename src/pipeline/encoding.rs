//! Serde helper: byte payloads travel as standard base64 strings.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}
