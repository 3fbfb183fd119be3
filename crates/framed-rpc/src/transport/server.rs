//! RPC server implementation.
//!
//! Each connection runs its own dispatch loop: read one request frame, invoke
//! the registered handler, write one response frame, repeat. Requests on a
//! single connection are handled one at a time. Connections run concurrently
//! with each other.

use crate::error::{HandlerError, ProtocolError, Result};
use crate::protocol::codec;
use crate::protocol::message::{RequestEnvelope, ResponseEnvelope};
use crate::protocol::{FrameCodec, MAX_FRAME_SIZE};
use crate::registry::ServiceRegistry;
use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the RPC server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum frame size.
    pub max_frame_size: usize,
    /// Close a connection that sends no request for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_frame_size: MAX_FRAME_SIZE,
            idle_timeout: None,
        }
    }
}

/// RPC server dispatching requests to a [`ServiceRegistry`].
pub struct RpcServer {
    registry: Arc<ServiceRegistry>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Create a new RPC server.
    #[must_use]
    pub fn new(registry: ServiceRegistry, config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Accept connections from an already bound listener until shutdown.
    ///
    /// Each accepted connection gets its own dispatch task. Connections over
    /// `max_connections` are dropped.
    ///
    /// # Errors
    ///
    /// Accept failures are logged and do not end the loop. The error return
    /// is kept for callers that `?` the result.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("RPC server listening on {}", addr);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                                warn!(
                                    "Max connections reached, rejecting connection from {}",
                                    addr
                                );
                                continue;
                            };

                            let registry = Arc::clone(&self.registry);
                            let config = self.config.clone();
                            let shutdown = self.shutdown.child_token();

                            tokio::spawn(async move {
                                debug!("New connection from {}", addr);
                                if let Err(e) = dispatch(stream, registry, config, shutdown).await {
                                    error!("Connection error from {}: {}", addr, e);
                                }
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                () = self.shutdown.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Run the dispatch loop for one connection until it closes.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer sends bytes that do not decode as a
    /// request envelope, or if writing a response fails. End of stream and
    /// read failures end the loop with `Ok`.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        dispatch(
            stream,
            Arc::clone(&self.registry),
            self.config.clone(),
            self.shutdown.child_token(),
        )
        .await
    }

    /// Stop accepting connections and close every open dispatch loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Per-connection dispatch loop.
async fn dispatch<S>(
    stream: S,
    registry: Arc<ServiceRegistry>,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(
        stream,
        FrameCodec::new().with_max_frame_size(config.max_frame_size),
    );

    loop {
        let next = tokio::select! {
            next = next_frame(&mut framed, config.idle_timeout) => next,
            () = shutdown.cancelled() => {
                debug!("Closing connection on shutdown");
                return Ok(());
            }
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("Frame error: {}", e);
                return Ok(());
            }
            None => {
                debug!("Connection closed by client");
                return Ok(());
            }
        };

        // A frame that is not a request envelope means the peer speaks
        // something else; nothing after it can be trusted.
        let request = codec::decode_request(&frame).inspect_err(|e| {
            error!("Failed to decode request: {}", e);
        })?;

        let response = invoke(&registry, request).await;
        let response_bytes = encode_reply(response, config.max_frame_size)?;

        framed.send(response_bytes).await?;
    }
}

/// Encode a response, swapping an oversized reply for an error response so
/// only that call fails.
fn encode_reply(response: ResponseEnvelope, max_frame_size: usize) -> Result<Bytes> {
    let bytes = codec::encode_response(&response)?;
    if bytes.len() <= max_frame_size {
        return Ok(bytes);
    }

    let err = ProtocolError::FrameTooLarge {
        size: bytes.len(),
        max: max_frame_size,
    };
    warn!(
        "Reply to call {} ({}) dropped: {}",
        response.seq, response.service_method, err
    );
    codec::encode_response(&ResponseEnvelope::failure(
        response.service_method,
        response.seq,
        err.to_string(),
    ))
}

/// Read the next frame, treating an idle timeout like end of stream.
async fn next_frame<S>(
    framed: &mut Framed<S, FrameCodec>,
    idle_timeout: Option<Duration>,
) -> Option<std::io::Result<Bytes>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match idle_timeout {
        Some(idle) => timeout(idle, framed.next()).await.unwrap_or_else(|_| {
            warn!("Connection idle for {:?}, closing", idle);
            None
        }),
        None => framed.next().await,
    }
}

/// Run the handler for one request and build its response.
async fn invoke(registry: &ServiceRegistry, request: RequestEnvelope) -> ResponseEnvelope {
    let RequestEnvelope {
        service_method,
        seq,
        arg,
    } = request;

    let result = match registry.lookup(&service_method) {
        Ok(handler) => AssertUnwindSafe(handler.call(arg))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic)).into())),
        Err(e) => Err(e),
    };

    match result {
        Ok(reply) => ResponseEnvelope::success(service_method, seq, reply),
        Err(e) => {
            debug!("Call {} ({}) failed: {}", seq, service_method, e);
            ResponseEnvelope::failure(service_method, seq, e.to_string())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
