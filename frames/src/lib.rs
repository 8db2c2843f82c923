//! Shared envelope model and codecs for the board sync transport.
//!
//! Every message on a board socket, in both directions, is an envelope
//! `{ type, data, timestamp? }`. Text frames carry it as JSON; binary frames
//! carry the same envelope as protobuf so payload-heavy boards can switch to
//! the compact encoding without touching the model.
//!
//! VALIDATION
//! ==========
//! Decoding enforces the minimal shape every consumer relies on: `type` is a
//! non-empty string, `data` is present (null counts as present), and
//! `timestamp` is a number or absent. Anything else is a [`CodecError`].

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error returned by the decode functions.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text frame is not valid JSON.
    #[error("invalid json envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// The binary frame could not be decoded as a protobuf `WireEnvelope`.
    #[error("failed to decode protobuf envelope: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The JSON document is not an object.
    #[error("envelope is not a json object")]
    NotAnObject,
    /// `type` is missing, empty, or not a string.
    #[error("envelope type must be a non-empty string")]
    InvalidType,
    /// `data` is missing.
    #[error("envelope data is missing")]
    MissingData,
    /// `timestamp` is present but not a number.
    #[error("envelope timestamp must be a number")]
    InvalidTimestamp,
}

/// Outbound encoding used for frames this side sends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// Protobuf binary frames.
    Protobuf,
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" | "text" => Ok(Self::Json),
            "protobuf" | "proto" | "binary" => Ok(Self::Protobuf),
            other => Err(format!("unknown wire format: {other}")),
        }
    }
}

/// A raw socket payload before envelope decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    /// UTF-8 text frame carrying a JSON envelope.
    Text(String),
    /// Binary frame carrying a protobuf envelope.
    Binary(Vec<u8>),
}

impl WireMessage {
    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single message on the board wire protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Namespaced message type, e.g. `"task:moved"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary JSON payload.
    pub data: Value,
    /// Milliseconds since the Unix epoch, if the sender stamped one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Some(now_ms()),
        }
    }

    /// Build an envelope without a timestamp.
    pub fn unstamped(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: None,
        }
    }

    /// Rough in-memory size: type plus serialized payload.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        self.kind.len() + self.data.to_string().len() + std::mem::size_of::<Self>()
    }
}

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// FORMAT DISPATCH
// =============================================================================

/// Encode an envelope in the requested wire format.
#[must_use]
pub fn encode(envelope: &Envelope, format: WireFormat) -> WireMessage {
    match format {
        WireFormat::Json => WireMessage::Text(encode_text(envelope)),
        WireFormat::Protobuf => WireMessage::Binary(encode_binary(envelope)),
    }
}

/// Decode a raw socket payload, picking the codec from the frame type.
///
/// # Errors
///
/// Returns a [`CodecError`] for malformed payloads or shape violations.
pub fn decode(message: &WireMessage) -> Result<Envelope, CodecError> {
    match message {
        WireMessage::Text(text) => decode_text(text),
        WireMessage::Binary(bytes) => decode_binary(bytes),
    }
}

// =============================================================================
// JSON TEXT CODEC
// =============================================================================

/// Encode an envelope as a JSON string.
#[must_use]
pub fn encode_text(envelope: &Envelope) -> String {
    // Serializing a struct of strings and `Value`s cannot fail.
    serde_json::to_string(envelope).unwrap_or_default()
}

/// Decode and validate a JSON envelope.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for invalid JSON and the shape variants for
/// documents that parse but do not look like an envelope.
pub fn decode_text(text: &str) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    envelope_from_value(value)
}

/// Validate an already-parsed JSON document as an envelope.
///
/// # Errors
///
/// Returns the shape variant of [`CodecError`] that the document violates.
pub fn envelope_from_value(value: Value) -> Result<Envelope, CodecError> {
    let Value::Object(mut map) = value else {
        return Err(CodecError::NotAnObject);
    };

    let kind = match map.remove("type") {
        Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
        _ => return Err(CodecError::InvalidType),
    };
    let Some(data) = map.remove("data") else {
        return Err(CodecError::MissingData);
    };
    let timestamp = match map.remove("timestamp") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(number_to_ms(&n)),
        Some(_) => return Err(CodecError::InvalidTimestamp),
    };

    Ok(Envelope {
        kind,
        data,
        timestamp,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn number_to_ms(n: &serde_json::Number) -> i64 {
    n.as_i64()
        .or_else(|| n.as_f64().map(|f| f as i64))
        .unwrap_or(0)
}

// =============================================================================
// PROTOBUF BINARY CODEC
// =============================================================================

/// Encode an envelope into protobuf bytes.
#[must_use]
pub fn encode_binary(envelope: &Envelope) -> Vec<u8> {
    let wire = WireEnvelope {
        kind: envelope.kind.clone(),
        data: Some(json_to_proto_value(&envelope.data)),
        timestamp: envelope.timestamp,
    };

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec cannot run out of buffer space.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode and validate protobuf bytes as an envelope.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes, [`CodecError::InvalidType`]
/// for an empty type and [`CodecError::MissingData`] when no payload was sent.
pub fn decode_binary(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let wire = WireEnvelope::decode(bytes)?;
    if wire.kind.trim().is_empty() {
        return Err(CodecError::InvalidType);
    }
    let Some(data) = wire.data else {
        return Err(CodecError::MissingData);
    };

    Ok(Envelope {
        kind: wire.kind,
        data: proto_to_json_value(&data),
        timestamp: wire.timestamp,
    })
}

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => {
            prost_types::value::Kind::NullValue(prost_types::NullValue::NullValue as i32)
        }
        Value::Bool(v) => prost_types::value::Kind::BoolValue(*v),
        Value::Number(v) => prost_types::value::Kind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => prost_types::value::Kind::StringValue(v.clone()),
        Value::Array(v) => prost_types::value::Kind::ListValue(prost_types::ListValue {
            values: v.iter().map(json_to_proto_value).collect(),
        }),
        Value::Object(v) => prost_types::value::Kind::StructValue(prost_types::Struct {
            fields: v
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };

    prost_types::Value { kind: Some(kind) }
}

fn proto_to_json_value(value: &prost_types::Value) -> Value {
    let Some(kind) = &value.kind else {
        return Value::Null;
    };

    match kind {
        prost_types::value::Kind::NullValue(_) => Value::Null,
        prost_types::value::Kind::NumberValue(v) => number_from_f64(*v),
        prost_types::value::Kind::StringValue(v) => Value::String(v.clone()),
        prost_types::value::Kind::BoolValue(v) => Value::Bool(*v),
        prost_types::value::Kind::StructValue(v) => Value::Object(
            v.fields
                .iter()
                .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                .collect(),
        ),
        prost_types::value::Kind::ListValue(v) => {
            Value::Array(v.values.iter().map(proto_to_json_value).collect())
        }
    }
}

/// Protobuf only has doubles; whole numbers come back as JSON integers so ids
/// and positions survive a binary round trip unchanged.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn number_from_f64(v: f64) -> Value {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
        return Value::from(v as i64);
    }
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

#[derive(Clone, PartialEq, Message)]
struct WireEnvelope {
    #[prost(string, tag = "1")]
    kind: String,
    #[prost(message, optional, tag = "2")]
    data: Option<prost_types::Value>,
    #[prost(int64, optional, tag = "3")]
    timestamp: Option<i64>,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
