//! Single-ticket TCP exchange.
//!
//! Each attempt runs one sequential state machine on its own connection:
//!
//! ```text
//! Connecting ──► Sending ──► Receiving ──► Done
//!      │            │          │  ▲  │
//!      │            │          └──┘  │  (no terminator yet: read again)
//!      └────────────┴────────────────┴──► Failed
//! ```
//!
//! Every step is bounded by its own timeout. Whatever happens, the socket is
//! shut down in both directions before the attempt returns.

use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tally_core::{
    codec,
    config::{AppConfig, EndpointConfig},
    error::{DecodeError, StoreError},
    store::ResultStore,
    types::TicketId,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::Exchange;

/// Callback invoked with every raw chunk received for a ticket.
///
/// Parameters: `(ticket, chunk)`
pub type OnChunkCallback = Arc<dyn Fn(TicketId, &[u8]) + Send + Sync>;

/// Step of the exchange state machine an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Connecting,
    Sending,
    Receiving,
}

impl fmt::Display for ExchangePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connect"),
            Self::Sending => write!(f, "send"),
            Self::Receiving => write!(f, "receive"),
        }
    }
}

/// Why an exchange attempt failed. Every variant is retryable.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Name resolution or TCP connect failed.
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("{phase} timed out after {limit:?}")]
    Timeout { phase: ExchangePhase, limit: Duration },

    #[error("{phase} failed: {source}")]
    Io {
        phase: ExchangePhase,
        #[source]
        source: io::Error,
    },

    /// The peer closed the connection before sending the frame terminator.
    #[error("connection closed before frame terminator")]
    ConnectionClosed,

    #[error("decode failed: {0}")]
    Decode(#[source] DecodeError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ExchangeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Decode { source, .. } => Self::Decode(source),
            other => Self::Store(other),
        }
    }
}

/// Terminal result of one attempt.
#[derive(Debug)]
pub enum Outcome {
    Success(u64),
    Failure(ExchangeError),
}

/// Run one attempt for an in-flight `ticket` and decode the result.
///
/// This is the exchange boundary: errors from the transport and from decoding
/// both come back as [`Outcome::Failure`]. On success the ticket is already
/// `Done` in `store`; on failure it is still `InFlight` and the caller decides
/// what happens next.
pub async fn attempt<E: Exchange + ?Sized>(exchange: &E, ticket: TicketId, store: &ResultStore) -> Outcome {
    let result = match exchange.exchange(ticket, store).await {
        Ok(()) => store.mark_done(ticket).map_err(ExchangeError::from),
        Err(e) => Err(e),
    };

    match result {
        Ok(value) => Outcome::Success(value),
        Err(cause) => Outcome::Failure(cause),
    }
}

/// Connection settings for [`TcpExchange`].
#[derive(Debug, Clone)]
pub struct TcpExchangeConfig {
    pub endpoint: EndpointConfig,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
    pub read_buffer_size: usize,
}

impl TcpExchangeConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.effective_endpoint(),
            connect_timeout: config.connect_timeout(),
            send_timeout: config.send_timeout(),
            recv_timeout: config.recv_timeout(),
            read_buffer_size: config.effective_read_buffer_size(),
        }
    }
}

impl Default for TcpExchangeConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

/// Exchange over a fresh TCP connection per attempt.
pub struct TcpExchange {
    config: TcpExchangeConfig,
    observer: Option<OnChunkCallback>,
}

impl TcpExchange {
    /// A zero `read_buffer_size` is raised to one byte; an empty buffer
    /// would read as end-of-stream on every call.
    pub fn new(mut config: TcpExchangeConfig) -> Self {
        config.read_buffer_size = config.read_buffer_size.max(1);
        Self { config, observer: None }
    }

    /// Forward every raw received chunk to `observer`.
    pub fn with_observer(mut self, observer: OnChunkCallback) -> Self {
        self.observer = Some(observer);
        self
    }

    async fn connect(&self) -> Result<TcpStream, ExchangeError> {
        let endpoint = &self.config.endpoint;
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));

        let stream = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ExchangeError::Connect { endpoint: endpoint.to_string(), source });
            }
            Err(_) => {
                return Err(ExchangeError::Timeout {
                    phase: ExchangePhase::Connecting,
                    limit: self.config.connect_timeout,
                });
            }
        };

        // Requests are a single tiny write; don't let Nagle hold them back.
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn converse(&self, stream: &mut TcpStream, ticket: TicketId, store: &ResultStore) -> Result<(), ExchangeError> {
        let request = codec::encode_request(ticket);
        bounded(ExchangePhase::Sending, self.config.send_timeout, stream.write_all(&request)).await?;
        trace!("ticket #{ticket}: sent {} byte(s)", request.len());

        let mut buf = vec![0u8; self.config.read_buffer_size];
        loop {
            let n = bounded(ExchangePhase::Receiving, self.config.recv_timeout, stream.read(&mut buf)).await?;
            if n == 0 {
                return Err(ExchangeError::ConnectionClosed);
            }

            let chunk = &buf[..n];
            if let Some(observer) = &self.observer {
                observer(ticket, chunk);
            }

            let scan = codec::scan_chunk(chunk);
            if !scan.digits.is_empty() {
                store.record_bytes(ticket, &scan.digits)?;
            }
            if scan.terminated {
                trace!("ticket #{ticket}: frame terminator received");
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Exchange for TcpExchange {
    async fn exchange(&self, ticket: TicketId, store: &ResultStore) -> Result<(), ExchangeError> {
        let mut stream = self.connect().await?;
        let result = self.converse(&mut stream, ticket, store).await;
        release(stream);
        result
    }
}

/// Run one socket operation under `limit`.
async fn bounded<T>(
    phase: ExchangePhase,
    limit: Duration,
    op: impl Future<Output = io::Result<T>>,
) -> Result<T, ExchangeError> {
    match tokio::time::timeout(limit, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(ExchangeError::Io { phase, source }),
        Err(_) => Err(ExchangeError::Timeout { phase, limit }),
    }
}

/// Shut the socket down in both directions, then close it.
fn release(stream: TcpStream) {
    match stream.into_std() {
        Ok(socket) => {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                trace!("socket shutdown: {e}");
            }
        }
        Err(e) => trace!("socket release: {e}"),
    }
}
