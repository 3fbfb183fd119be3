//! Length-prefixed RPC transport with sequence-number call routing.
//!
//! Requests and responses travel as CBOR envelopes inside 4-byte big-endian
//! length-prefixed frames. Arguments and replies are self-describing on the
//! wire and get coerced into the caller's types at the edges.
//!
//! # Features
//!
//! - **Framing**: `tokio_util` codec that survives arbitrary short reads
//! - **Polymorphic payloads**: any serde type as argument or reply
//! - **Out-of-order responses**: calls are matched by sequence number
//! - **Explicit registry**: handlers are registered on a value, never globally
//!
//! # Example
//!
//! ```no_run
//! use framed_rpc::{RpcClient, RpcServer, ServerConfig, ServiceRegistry};
//! use std::convert::Infallible;
//!
//! async fn example() -> framed_rpc::Result<()> {
//!     let mut registry = ServiceRegistry::new();
//!     registry.register("Echo.Echo", |arg: String| async move {
//!         Ok::<_, Infallible>(arg)
//!     })?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:1234").await?;
//!     let server = RpcServer::new(registry, ServerConfig::default());
//!     tokio::spawn(async move { server.serve(listener).await });
//!
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:1234").await?;
//!     let client = RpcClient::new(stream);
//!     let reply: String = client.call("Echo.Echo", "hello").await?;
//!     assert_eq!(reply, "hello");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use error::{Error, Result};
pub use protocol::{
    FrameCodec, RequestEnvelope, ResponseEnvelope, Sequence, codec,
    codec::{from_value, to_value},
};
pub use registry::{FnHandler, RpcHandler, ServiceBuilder, ServiceRegistry};
pub use transport::{
    client::{ClientBuilder, ClientConfig, RpcClient},
    server::{RpcServer, ServerConfig},
};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use ciborium::Value;
