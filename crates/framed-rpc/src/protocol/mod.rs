//! Protocol layer for the RPC transport.
//!
//! This module contains the wire-level definitions:
//! - Length-prefixed framing
//! - Request and response envelopes
//! - The CBOR envelope codec and value coercion

pub mod codec;
pub mod framing;
pub mod message;

pub use framing::{FRAME_HEADER_SIZE, FrameCodec, MAX_FRAME_SIZE};
pub use message::{RequestEnvelope, ResponseEnvelope, Sequence};
