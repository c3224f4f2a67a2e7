//! Drives a protocol state machine over a transport channel.
//!
//! [`ProtocolConnection`] owns the channel and does all the I/O when the
//! multiplexer polls it: queued outbound frames are written and flushed, then
//! every inbound frame that is already available is read. The protocol sees
//! the results only through [`FrameProtocol`] callbacks, in arrival order, when
//! the connection is dispatched.

use crate::mux::EventSource;
use crate::transport::{BoxChannel, Frame, TransportError};
use futures::SinkExt;
use std::collections::VecDeque;
use std::task::{Context, Poll};
use tracing::{debug, trace};

/// A protocol state machine that talks in [`Frame`]s.
pub trait FrameProtocol {
    fn name(&self) -> &str;

    /// Next frame to send, if any.
    fn poll_outbound(&mut self) -> Option<Frame>;

    fn on_frame(&mut self, frame: Frame);

    /// Everything handed out by `poll_outbound` so far reached the socket.
    fn on_flushed(&mut self);

    /// The connection closed or failed; no more frames will arrive.
    fn on_closed(&mut self, reason: String);

    fn is_terminal(&self) -> bool;
}

#[derive(Debug)]
enum ConnectionEvent {
    Frame(Frame),
    Flushed,
    Closed(String),
}

pub struct ProtocolConnection<P> {
    channel: BoxChannel,
    protocol: P,
    events: VecDeque<ConnectionEvent>,
    /// Taken from the protocol but not yet accepted by the sink.
    pending_out: Option<Frame>,
    unflushed: bool,
    closed: bool,
}

impl<P: FrameProtocol> ProtocolConnection<P> {
    pub fn new(channel: BoxChannel, protocol: P) -> Self {
        Self {
            channel,
            protocol,
            events: VecDeque::new(),
            pending_out: None,
            unflushed: false,
            closed: false,
        }
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn fail(&mut self, error: TransportError) {
        debug!("{}: {}", self.protocol.name(), error);
        self.closed = true;
        self.pending_out = None;
        self.events.push_back(ConnectionEvent::Closed(error.to_string()));
    }

    fn poll_write(&mut self, cx: &mut Context<'_>) {
        while !self.closed {
            let frame = match self.pending_out.take() {
                Some(frame) => frame,
                None => match self.protocol.poll_outbound() {
                    Some(frame) => frame,
                    None => break,
                },
            };
            match self.channel.as_mut().poll_ready(cx) {
                Poll::Ready(Ok(())) => {
                    trace!("{}: send {} frame", self.protocol.name(), frame.kind());
                    if let Err(e) = self.channel.as_mut().start_send(frame) {
                        self.fail(e);
                        return;
                    }
                    self.unflushed = true;
                }
                Poll::Ready(Err(e)) => {
                    self.fail(e);
                    return;
                }
                Poll::Pending => {
                    self.pending_out = Some(frame);
                    break;
                }
            }
        }

        if self.closed || !self.unflushed {
            return;
        }
        match self.channel.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {
                self.unflushed = false;
                if self.pending_out.is_none() {
                    self.events.push_back(ConnectionEvent::Flushed);
                }
            }
            Poll::Ready(Err(e)) => self.fail(e),
            Poll::Pending => {}
        }
    }

    fn poll_read(&mut self, cx: &mut Context<'_>) {
        while !self.closed {
            match self.channel.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(Frame::Close(reason)))) => {
                    self.closed = true;
                    let reason = reason
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by peer".to_string());
                    self.events.push_back(ConnectionEvent::Closed(reason));
                }
                Poll::Ready(Some(Ok(frame))) => {
                    self.events.push_back(ConnectionEvent::Frame(frame));
                }
                Poll::Ready(Some(Err(e))) => self.fail(e),
                Poll::Ready(None) => {
                    self.closed = true;
                    self.events
                        .push_back(ConnectionEvent::Closed("connection closed".to_string()));
                }
                Poll::Pending => break,
            }
        }
    }

    /// Send a close frame with `reason` and shut the channel down.
    pub async fn close(mut self, reason: &str) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.channel
            .send(Frame::Close(Some(reason.to_string())))
            .await?;
        match self.channel.close().await {
            Ok(()) | Err(TransportError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl<P: FrameProtocol> EventSource for ProtocolConnection<P> {
    fn name(&self) -> &str {
        self.protocol.name()
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.poll_write(cx);
        self.poll_read(cx);
        if self.events.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }

    fn on_ready(&mut self) {
        while let Some(event) = self.events.pop_front() {
            match event {
                ConnectionEvent::Frame(frame) => self.protocol.on_frame(frame),
                ConnectionEvent::Flushed => self.protocol.on_flushed(),
                ConnectionEvent::Closed(reason) => self.protocol.on_closed(reason),
            }
        }
    }
}
