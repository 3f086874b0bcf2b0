//! The carrier abstraction and its tokio-tungstenite adapter.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::warn;

/// Error type of the carrier.
pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Outbound unit handed to the carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    /// One binary fragment; compression is disabled.
    Fragment {
        /// Fragment bytes.
        data: Bytes,
        /// End-of-message marker.
        fin: bool,
    },
    /// Liveness probe.
    Ping,
}

/// Inbound event delivered by the carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    /// A complete inbound binary message.
    Message(Bytes),
    /// The peer answered a liveness probe.
    Pong,
    /// The carrier has terminated.
    Closed,
}

/// The message-oriented transport the multiplexor runs over.
///
/// The carrier is injected already open; it delivers binary messages in
/// order and handles ping/pong at its own protocol level. Anything that
/// is a `Sink` of [`WsFrame`] and a `Stream` of [`WsEvent`] qualifies;
/// [`WebSocketCarrier`] adapts a tokio-tungstenite stream.
pub trait Carrier:
    Sink<WsFrame, Error = WsError>
    + Stream<Item = Result<WsEvent, WsError>>
    + Send
    + Unpin
    + 'static
{
}

impl<T> Carrier for T where
    T: Sink<WsFrame, Error = WsError>
        + Stream<Item = Result<WsEvent, WsError>>
        + Send
        + Unpin
        + 'static
{
}

/// [`Carrier`] over an established tokio-tungstenite WebSocket.
///
/// tungstenite's interface is message-oriented, so outbound fragments
/// are coalesced into one binary message per end-of-message marker;
/// inbound pings are answered by tokio-tungstenite itself and not
/// surfaced.
#[derive(Debug)]
pub struct WebSocketCarrier<S> {
    inner: WebSocketStream<S>,
    partial: BytesMut,
}

impl<S> WebSocketCarrier<S> {
    /// Wrap an established WebSocket.
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            partial: BytesMut::new(),
        }
    }
}

impl<S> From<WebSocketStream<S>> for WebSocketCarrier<S> {
    fn from(inner: WebSocketStream<S>) -> Self {
        Self::new(inner)
    }
}

impl<S> Sink<WsFrame> for WebSocketCarrier<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = WsError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        self.inner.poll_ready_unpin(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), WsError> {
        let this = self.get_mut();
        match item {
            WsFrame::Ping => this.inner.start_send_unpin(Message::Ping(Bytes::new())),
            WsFrame::Fragment { data, fin: false } => {
                this.partial.extend_from_slice(&data);
                Ok(())
            }
            WsFrame::Fragment { data, fin: true } => {
                let message = if this.partial.is_empty() {
                    data
                } else {
                    this.partial.extend_from_slice(&data);
                    this.partial.split().freeze()
                };
                this.inner.start_send_unpin(Message::Binary(message))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        self.inner.poll_flush_unpin(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        self.inner.poll_close_unpin(cx)
    }
}

impl<S> Stream for WebSocketCarrier<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<WsEvent, WsError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            return match std::task::ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => Poll::Ready(Some(Ok(WsEvent::Message(data)))),
                Some(Ok(Message::Pong(_))) => Poll::Ready(Some(Ok(WsEvent::Pong))),
                Some(Ok(Message::Ping(_))) => {
                    // tokio-tungstenite queues the pong reply itself
                    continue;
                }
                Some(Ok(Message::Close(_))) => Poll::Ready(Some(Ok(WsEvent::Closed))),
                Some(Ok(Message::Text(text))) => {
                    warn!("dropping unexpected text message: `{text}'");
                    continue;
                }
                Some(Ok(Message::Frame(_))) => {
                    unreachable!("raw frames are not surfaced by tokio-tungstenite")
                }
                Some(Err(e)) => Poll::Ready(Some(Err(e))),
                None => Poll::Ready(None),
            };
        }
    }
}
