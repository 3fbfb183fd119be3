//! RPC client implementation.
//!
//! A client owns one connection. Any number of tasks may issue calls on it
//! concurrently; each call gets a fresh sequence number and waits on its own
//! oneshot channel. A single background task reads response frames and
//! routes them back by sequence number, so responses may arrive in any order.

use crate::error::{ConnectionError, Error, ProtocolError, Result};
use crate::protocol::codec;
use crate::protocol::message::{ResponseEnvelope, Sequence};
use crate::protocol::{FrameCodec, MAX_FRAME_SIZE};
use bytes::Bytes;
use ciborium::Value;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Type alias for response sender channel.
pub type ResponseSender = oneshot::Sender<Result<ResponseEnvelope>>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum frame size, both directions.
    pub max_frame_size: usize,
    /// Deadline applied to every [`RpcClient::call`]. `None` waits forever.
    pub default_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            default_timeout: None,
        }
    }
}

/// Builder for creating RPC clients.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the default call timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = Some(timeout);
        self
    }

    /// Build a client over an established stream.
    ///
    /// Spawns the response reader, so this must run inside a Tokio runtime.
    pub fn build<S>(self, stream: S) -> RpcClient
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        RpcClient::with_config(stream, self.config)
    }
}

/// State shared between callers and the response reader.
struct Shared {
    pending: DashMap<Sequence, ResponseSender>,
    closed: AtomicBool,
    shut_down: AtomicBool,
    reader_stop: CancellationToken,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> Error {
        if self.shut_down.load(Ordering::SeqCst) {
            ConnectionError::ShuttingDown.into()
        } else {
            ConnectionError::Closed.into()
        }
    }

    /// Mark the connection dead and stop the reader. The reader resolves
    /// whatever is still pending on its way out.
    fn fail(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader_stop.cancel();
    }

    /// Resolve every pending call with a connection error.
    fn fail_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let seqs: Vec<Sequence> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !seqs.is_empty() {
            warn!("Failing {} pending calls on closed connection", seqs.len());
        }
        for seq in seqs {
            if let Some((_, sender)) = self.pending.remove(&seq) {
                let _ = sender.send(Err(self.closed_error()));
            }
        }
    }

    /// Deliver one response frame to the call waiting for it.
    fn route(&self, payload: &[u8]) {
        match codec::decode_response(payload) {
            Ok(response) => {
                if let Some((_, sender)) = self.pending.remove(&response.seq) {
                    let _ = sender.send(Ok(response));
                } else {
                    warn!("Received response for unknown sequence: {}", response.seq);
                }
            }
            Err(e) => match codec::peek_sequence(payload) {
                Some(seq) => {
                    if let Some((_, sender)) = self.pending.remove(&seq) {
                        let _ = sender.send(Err(e));
                    } else {
                        warn!("Undecodable response for unknown sequence {}: {}", seq, e);
                    }
                }
                None => {
                    error!("Failed to decode response: {}", e);
                }
            },
        }
    }
}

/// Removes a call's pending entry when the call finishes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    seq: Sequence,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.seq);
    }
}

/// RPC client issuing calls over one connection.
pub struct RpcClient {
    sink: Mutex<FramedWrite<BoxedWriter, FrameCodec>>,
    next_seq: AtomicU64,
    shared: Arc<Shared>,
    config: ClientConfig,
}

impl RpcClient {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a client with default configuration over an established stream.
    ///
    /// Spawns the response reader, so this must run inside a Tokio runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(stream, ClientConfig::default())
    }

    fn with_config<S>(stream: S, config: ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = FrameCodec::new().with_max_frame_size(config.max_frame_size);
        let (reader, writer) = tokio::io::split(stream);
        let writer: BoxedWriter = Box::new(writer);

        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            reader_stop: CancellationToken::new(),
        });

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            Self::handle_stream(FramedRead::new(reader, codec), reader_shared).await;
        });

        Self {
            sink: Mutex::new(FramedWrite::new(writer, codec)),
            next_seq: AtomicU64::new(0),
            shared,
            config,
        }
    }

    /// Read response frames until the stream ends or the client stops.
    async fn handle_stream<R>(mut stream: FramedRead<R, FrameCodec>, shared: Arc<Shared>)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(payload)) => shared.route(&payload),
                        Some(Err(e)) => {
                            error!("Stream error: {}", e);
                            break;
                        }
                        None => {
                            debug!("Stream closed");
                            break;
                        }
                    }
                }
                () = shared.reader_stop.cancelled() => {
                    debug!("Response reader stopped");
                    break;
                }
            }
        }

        shared.fail_pending();
    }

    /// Call `service_method` with `arg` and wait for the typed reply.
    ///
    /// Uses the configured default timeout, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] with the server's error text, a codec error if
    /// the reply does not coerce into `R`, or a connection error if the
    /// connection fails or the client was closed.
    pub async fn call<A, R>(&self, service_method: &str, arg: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_inner(service_method, arg, self.config.default_timeout)
            .await
    }

    /// Like [`call`](Self::call) with an explicit deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the request cannot be written and
    /// answered in time, and otherwise the same errors as
    /// [`call`](Self::call).
    pub async fn call_with_timeout<A, R>(
        &self,
        service_method: &str,
        arg: &A,
        deadline: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_inner(service_method, arg, Some(deadline)).await
    }

    #[instrument(skip(self, arg))]
    async fn call_inner<A, R>(
        &self,
        service_method: &str,
        arg: &A,
        deadline: Option<Duration>,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.shared.is_closed() {
            return Err(self.shared.closed_error());
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let payload = codec::encode_request(service_method, seq, arg)?;
        if payload.len() > self.config.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.config.max_frame_size,
            }
            .into());
        }

        let response_rx = self.register(seq)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            seq,
        };

        debug!(
            "Sending call {} to {} (pending: {})",
            seq,
            service_method,
            self.shared.pending.len()
        );
        // Deadline covers the write as well as the response
        let exchange = async {
            self.send(payload).await?;
            let response = response_rx.await.map_err(|_| self.shared.closed_error())??;
            Ok::<_, Error>(response)
        };
        let response = match deadline {
            Some(deadline) => timeout(deadline, exchange)
                .await
                .map_err(|_| Error::Timeout(deadline))??,
            None => exchange.await?,
        };

        if !response.is_success() {
            return Err(Error::Remote(response.error));
        }

        codec::from_value(&response.reply.unwrap_or(Value::Null))
    }

    /// Insert a pending entry for `seq`.
    fn register(&self, seq: Sequence) -> Result<oneshot::Receiver<Result<ResponseEnvelope>>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.shared.pending.insert(seq, response_tx);

        // The reader marks the connection closed before draining, so either
        // it sees this entry or we see the flag.
        if self.shared.is_closed() {
            self.shared.pending.remove(&seq);
            return Err(self.shared.closed_error());
        }

        Ok(response_rx)
    }

    /// Write one frame. A write failure kills the connection.
    async fn send(&self, payload: Bytes) -> Result<()> {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(payload).await {
            error!("Failed to write request: {}", e);
            self.shared.fail();
            return Err(e.into());
        }
        Ok(())
    }

    /// Number of calls waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Whether the connection is closed or the client was shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close the client.
    ///
    /// New calls fail immediately, calls still waiting resolve with a
    /// shutdown error, and the write side of the stream is shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if shutting down the write side fails.
    pub async fn close(&self) -> Result<()> {
        debug!("Shutting down RPC client");

        self.shared.shut_down.store(true, Ordering::SeqCst);
        self.shared.fail();

        let mut sink = self.sink.lock().await;
        sink.close().await?;
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        self.shared.fail();
    }
}
