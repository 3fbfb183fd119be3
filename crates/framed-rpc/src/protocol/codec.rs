//! CBOR envelope codec and value coercion.
//!
//! CBOR is self-describing, so an envelope can be decoded without knowing the
//! argument or reply type. Payloads come back as [`ciborium::Value`], and the
//! caller coerces them into its static type with [`from_value`].

use crate::error::{CodecError, Result};
use crate::protocol::message::{RequestEnvelope, ResponseEnvelope, Sequence};
use bytes::Bytes;
use ciborium::Value;
use serde::{Serialize, de::DeserializeOwned};

/// Encode a message into CBOR bytes.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
    let mut vec = Vec::new();
    ciborium::ser::into_writer(msg, &mut vec).map_err(CodecError::from)?;
    Ok(Bytes::from(vec))
}

/// Decode CBOR bytes into a message.
///
/// # Errors
///
/// Returns an error if the data is invalid or the message cannot be deserialized.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::de::from_reader(data)
        .map_err(CodecError::from)
        .map_err(Into::into)
}

/// Convert a typed value into its untyped CBOR representation.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Value::serialized(&value)
        .map_err(|e| CodecError::SerializationFailed(e.to_string()))
        .map_err(Into::into)
}

/// Coerce an untyped CBOR value into `T`.
///
/// # Errors
///
/// Returns [`CodecError::Coercion`] if the value's shape does not match `T`.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T> {
    value.deserialized().map_err(|e| {
        CodecError::Coercion {
            target: std::any::type_name::<T>(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Encode a request envelope.
///
/// # Errors
///
/// Returns an error if the argument cannot be serialized.
pub fn encode_request<A: Serialize + ?Sized>(
    service_method: &str,
    seq: Sequence,
    arg: &A,
) -> Result<Bytes> {
    encode(&RequestEnvelope {
        service_method: service_method.to_string(),
        seq,
        arg: to_value(arg)?,
    })
}

/// Decode a request envelope. The argument stays untyped.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid request envelope.
pub fn decode_request(data: &[u8]) -> Result<RequestEnvelope> {
    decode(data)
}

/// Encode a response envelope.
///
/// # Errors
///
/// Returns an error if the envelope cannot be serialized.
pub fn encode_response(response: &ResponseEnvelope) -> Result<Bytes> {
    encode(response)
}

/// Decode a response envelope. The reply stays untyped.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid response envelope.
pub fn decode_response(data: &[u8]) -> Result<ResponseEnvelope> {
    decode(data)
}

/// Recover the `Seq` field from envelope bytes that failed full decoding.
///
/// Returns `None` when the bytes are not a CBOR map with an unsigned `Seq`.
#[must_use]
pub fn peek_sequence(data: &[u8]) -> Option<Sequence> {
    let Ok(Value::Map(entries)) = ciborium::de::from_reader::<Value, _>(data) else {
        return None;
    };

    entries.into_iter().find_map(|(key, value)| match (key, value) {
        (Value::Text(key), Value::Integer(seq)) if key == "Seq" => Sequence::try_from(seq).ok(),
        _ => None,
    })
}
