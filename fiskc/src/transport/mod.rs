//! Message transport for scheduler and worker connections.
//!
//! Protocol code only sees [`Frame`]s moving through a [`FrameChannel`]; the
//! websocket handshake and framing live behind [`Connector`]. Tests swap in
//! an in-memory connector.

mod ws;

pub use ws::WsConnector;

use async_trait::async_trait;
use futures::{Sink, Stream};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// One message on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Close handshake, with the peer's reason if it gave one.
    Close(Option<String>),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Close(_) => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("timed out connecting to {url} after {}ms", .after.as_millis())]
    Timeout { url: String, after: Duration },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("connection closed")]
    Closed,
}

/// Bidirectional frame stream.
pub trait FrameChannel:
    Stream<Item = Result<Frame, TransportError>> + Sink<Frame, Error = TransportError>
{
}

impl<T> FrameChannel for T where
    T: Stream<Item = Result<Frame, TransportError>> + Sink<Frame, Error = TransportError>
{
}

pub type BoxChannel = Pin<Box<dyn FrameChannel>>;

/// An established connection and the handshake response headers.
pub struct Connection {
    pub channel: BoxChannel,
    /// Header names are lowercase.
    pub response_headers: HashMap<String, String>,
}

impl Connection {
    pub fn new(channel: BoxChannel, response_headers: HashMap<String, String>) -> Self {
        Self {
            channel,
            response_headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Parameters of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Bound on the whole handshake.
    pub timeout: Duration,
}

impl ConnectRequest {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            timeout,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Opens connections. Implementations must honour `request.timeout`.
#[async_trait(?Send)]
pub trait Connector {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError>;
}
