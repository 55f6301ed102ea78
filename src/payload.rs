use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::broker::ContentType;

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Body declared as JSON.
    Json(Value),

    /// Any other body, passed through as text without parsing.
    Raw(String),
}

impl Payload {
    /// Decode `body` according to its declared content type.
    ///
    /// Only JSON bodies can fail to decode. Other bodies are converted to text, replacing invalid
    /// UTF-8 sequences.
    pub fn decode(content_type: &ContentType, body: &[u8]) -> Result<Self, serde_json::Error> {
        if content_type.is_json() {
            serde_json::from_slice(body).map(Payload::Json)
        } else {
            Ok(Payload::Raw(String::from_utf8_lossy(body).into_owned()))
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            Payload::Json(_) => None,
            Payload::Raw(text) => Some(text),
        }
    }

    /// Deserialize the payload into `T`. Raw payloads deserialize as a JSON string.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Payload::Json(value) => T::deserialize(value),
            Payload::Raw(text) => T::deserialize(Value::String(text.clone())),
        }
    }
}

/// Encode an outbound payload as JSON text.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(payload).map(Bytes::from)
}
