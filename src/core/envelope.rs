//! Inbound message envelope.
//!
//! Every inbound frame is a JSON object whose `type` field names the topic; the
//! payload fields sit next to it at the top level:
//!
//! ```text
//! {"type":"system_metrics","timestamp":"...","cpu":{...},"memory":{...},"disk":{...}}
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use sonic_rs::{JsonValueTrait, Value};
use thiserror::Error;

/// Field holding the topic discriminant.
pub const TOPIC_FIELD: &str = "type";

/// Reasons a text frame is not a valid envelope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("missing \"type\" field")]
    MissingType,
    #[error("\"type\" field is not a string")]
    NonStringType,
}

/// A parsed inbound message: topic plus the full JSON object.
///
/// `body` still contains the `type` field, so the cached value of a consumer is
/// deep-equal to the frame the server sent.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    topic: String,
    body: Value,
    raw: Bytes,
}

impl Envelope {
    /// Parse a text frame payload. Takes ownership of the bytes so typed decoding can
    /// reuse them without copying.
    pub fn parse(raw: Bytes) -> Result<Self, EnvelopeError> {
        let body: Value = sonic_rs::from_slice(raw.as_ref())
            .map_err(|err| EnvelopeError::InvalidJson(err.to_string()))?;
        if !body.is_object() {
            return Err(EnvelopeError::NotAnObject);
        }
        let topic = match body.get(TOPIC_FIELD) {
            None => return Err(EnvelopeError::MissingType),
            Some(value) => value
                .as_str()
                .ok_or(EnvelopeError::NonStringType)?
                .to_owned(),
        };
        Ok(Self { topic, body, raw })
    }

    pub fn parse_str(text: &str) -> Result<Self, EnvelopeError> {
        Self::parse(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[inline]
    pub fn body(&self) -> &Value {
        &self.body
    }

    #[inline]
    pub fn raw(&self) -> &[u8] {
        self.raw.as_ref()
    }

    /// Top-level payload field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    /// Decode the whole frame into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        sonic_rs::from_slice(self.raw.as_ref())
            .map_err(|err| EnvelopeError::InvalidJson(err.to_string()))
    }
}
