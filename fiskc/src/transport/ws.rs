//! Websocket transport over `tokio-tungstenite`.

use super::{ConnectRequest, Connection, Connector, Frame, TransportError};
use async_trait::async_trait;
use futures::{Sink, Stream};
use std::borrow::Cow;
use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait(?Send)]
impl Connector for WsConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(format!("{}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(format!("{}: {}", name, e)))?;
            ws_request.headers_mut().insert(name, value);
        }

        debug!("Connecting to {}", request.url);
        let (stream, response) = tokio::time::timeout(request.timeout, connect_async(ws_request))
            .await
            .map_err(|_| TransportError::Timeout {
                url: request.url.clone(),
                after: request.timeout,
            })?
            .map_err(|e| TransportError::Connect {
                url: request.url.clone(),
                reason: e.to_string(),
            })?;

        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();

        Ok(Connection::new(
            Box::pin(WsChannel { inner: stream }),
            response_headers,
        ))
    }
}

/// Adapts a websocket stream to [`Frame`]s. Control frames other than close
/// are handled by tungstenite and never surface.
struct WsChannel {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

fn map_error(error: WsError) -> TransportError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::Socket(other.to_string()),
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Close(reason) => Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Owned(reason.unwrap_or_default()),
        })),
    }
}

impl Stream for WsChannel {
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let message = match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                None => return Poll::Ready(None),
                Some(Err(e)) => return Poll::Ready(Some(Err(map_error(e)))),
                Some(Ok(message)) => message,
            };
            let frame = match message {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(data) => Frame::Binary(data),
                Message::Close(close) => Frame::Close(close.map(|c| c.reason.into_owned())),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Poll::Ready(Some(Ok(frame)));
        }
    }
}

impl Sink<Frame> for WsChannel {
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(map_error)
    }

    fn start_send(mut self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(to_message(frame))
            .map_err(map_error)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(map_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(map_error)
    }
}
