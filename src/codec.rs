//! Value codec used for every value crossing the instance boundary.
//!
//! Workflow arguments, results, marker values, signal and query payloads are
//! carried as opaque [`Payload`] bytes. A [`DataConverter`] turns
//! `serde_json::Value` trees into bytes and back; [`JsonDataConverter`] is the
//! default and can be swapped on the registry.

use crate::errors::CodecError;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

/// Encoded value as produced by a [`DataConverter`].
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Payload(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({})", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload(bytes)
    }
}

/// Injectable serializer for values exchanged with workflow code.
pub trait DataConverter: Send + Sync + fmt::Debug {
    fn to_payload(&self, value: &serde_json::Value) -> Result<Payload, CodecError>;
    fn from_payload(&self, payload: &Payload) -> Result<serde_json::Value, CodecError>;
}

/// Default converter: compact JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDataConverter;

impl DataConverter for JsonDataConverter {
    fn to_payload(&self, value: &serde_json::Value) -> Result<Payload, CodecError> {
        serde_json::to_vec(value)
            .map(Payload)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn from_payload(&self, payload: &Payload) -> Result<serde_json::Value, CodecError> {
        serde_json::from_slice(&payload.0).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

pub fn encode<T: Serialize + ?Sized>(converter: &dyn DataConverter, value: &T) -> Result<Payload, CodecError> {
    let tree = serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    converter.to_payload(&tree)
}

pub fn decode<T: DeserializeOwned>(converter: &dyn DataConverter, payload: &Payload) -> Result<T, CodecError> {
    let tree = converter.from_payload(payload)?;
    serde_json::from_value(tree).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Decode optional arguments; a missing payload decodes as JSON `null` so `()`
/// and `Option<_>` arguments work without a payload.
pub fn decode_optional<T: DeserializeOwned>(
    converter: &dyn DataConverter,
    payload: Option<&Payload>,
) -> Result<T, CodecError> {
    match payload {
        Some(p) => decode(converter, p),
        None => serde_json::from_value(serde_json::Value::Null).map_err(|e| CodecError::Decode(e.to_string())),
    }
}
