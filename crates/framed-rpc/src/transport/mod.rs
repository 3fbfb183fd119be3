//! Transport layer for the RPC framework.
//!
//! This module runs the protocol over a byte stream: the client side that
//! issues calls and routes responses, and the server side that dispatches
//! requests to registered handlers.

pub mod client;
pub mod server;

pub use client::{ClientBuilder, ClientConfig, ResponseSender, RpcClient};
pub use server::{RpcServer, ServerConfig};
