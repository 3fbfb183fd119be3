//! Request and response envelopes carried inside frames.

use ciborium::Value;
use serde::{Deserialize, Deserializer, Serialize};

/// Sequence number correlating a request with its response.
pub type Sequence = u64;

/// Request envelope for wire format.
///
/// `arg` is kept as an untyped CBOR value. The server coerces it into the
/// handler's declared argument type after lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestEnvelope {
    /// Target in `Type.Method` form.
    pub service_method: String,
    /// Caller-assigned sequence number.
    pub seq: Sequence,
    /// Call argument.
    pub arg: Value,
}

/// Response envelope for wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseEnvelope {
    /// Echo of the request's `service_method`.
    pub service_method: String,
    /// Echo of the request's sequence number.
    pub seq: Sequence,
    /// Error text, empty on success.
    #[serde(default)]
    pub error: String,
    /// Reply value, absent when `error` is set.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub reply: Option<Value>,
}

/// A `Reply` key that is present stays `Some`, even when it holds `null`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ResponseEnvelope {
    /// Build a successful response.
    #[must_use]
    pub fn success(service_method: String, seq: Sequence, reply: Value) -> Self {
        Self {
            service_method,
            seq,
            error: String::new(),
            reply: Some(reply),
        }
    }

    /// Build an error response. The reply is omitted.
    #[must_use]
    pub fn failure(service_method: String, seq: Sequence, error: impl Into<String>) -> Self {
        let mut error = error.into();
        // An empty error string would read as success on the other side
        if error.is_empty() {
            error.push_str("unknown error");
        }
        Self {
            service_method,
            seq,
            error,
            reply: None,
        }
    }

    /// Whether this response reports success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}
