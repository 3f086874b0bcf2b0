//! In-memory carrier for end-to-end tests.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{Sink, Stream};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use wsmux::frame::Header;
use wsmux::{ChannelEvent, ChannelOptions, Multiplexor, WsError, WsEvent, WsFrame};

/// One raw unit on the simulated wire.
#[derive(Debug, Clone)]
pub enum Wire {
    /// A complete binary message.
    Message(Bytes),
    Ping,
    Pong,
    /// Orderly close marker.
    Closed,
}

/// One endpoint of a simulated WebSocket.
///
/// Outbound fragments are reassembled into whole messages, like a real
/// WebSocket stack; with `auto_pong` the endpoint answers inbound pings
/// by itself, without surfacing them.
#[derive(Debug)]
pub struct TestCarrier {
    out_tx: mpsc::UnboundedSender<Wire>,
    in_rx: mpsc::UnboundedReceiver<Wire>,
    auto_pong: bool,
    partial: BytesMut,
}

impl TestCarrier {
    fn new(out_tx: mpsc::UnboundedSender<Wire>, in_rx: mpsc::UnboundedReceiver<Wire>, auto_pong: bool) -> Self {
        Self {
            out_tx,
            in_rx,
            auto_pong,
            partial: BytesMut::new(),
        }
    }
}

/// A connected carrier pair with WebSocket-like ping/pong behavior.
pub fn pair() -> (TestCarrier, TestCarrier) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        TestCarrier::new(a_tx, a_rx, true),
        TestCarrier::new(b_tx, b_rx, true),
    )
}

/// A carrier whose far end is scripted by hand: the carrier itself, a
/// sender injecting inbound wire units, and a receiver observing
/// outbound ones. Pings are not answered automatically.
pub fn endpoint() -> (
    TestCarrier,
    mpsc::UnboundedSender<Wire>,
    mpsc::UnboundedReceiver<Wire>,
) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (TestCarrier::new(out_tx, in_rx, false), in_tx, out_rx)
}

impl Sink<WsFrame> for TestCarrier {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), WsError> {
        let this = self.get_mut();
        match item {
            WsFrame::Ping => this
                .out_tx
                .send(Wire::Ping)
                .map_err(|_| WsError::ConnectionClosed),
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
                this.out_tx
                    .send(Wire::Message(message))
                    .map_err(|_| WsError::ConnectionClosed)
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        self.get_mut().out_tx.send(Wire::Closed).ok();
        Poll::Ready(Ok(()))
    }
}

impl Stream for TestCarrier {
    type Item = Result<WsEvent, WsError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            return match this.in_rx.poll_recv(cx) {
                Poll::Ready(Some(Wire::Message(data))) => {
                    Poll::Ready(Some(Ok(WsEvent::Message(data))))
                }
                Poll::Ready(Some(Wire::Ping)) => {
                    if this.auto_pong {
                        this.out_tx.send(Wire::Pong).ok();
                    }
                    continue;
                }
                Poll::Ready(Some(Wire::Pong)) => Poll::Ready(Some(Ok(WsEvent::Pong))),
                Poll::Ready(Some(Wire::Closed)) => Poll::Ready(Some(Ok(WsEvent::Closed))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

/// Build a raw version-2 frame message.
pub fn raw_frame(kind: u16, dst: u32, src: u32, payload: &[u8]) -> Wire {
    raw_frame_version(2, kind, dst, src, payload)
}

/// Build a raw frame message with an explicit version.
pub fn raw_frame_version(version: u16, kind: u16, dst: u32, src: u32, payload: &[u8]) -> Wire {
    let mut buf = BytesMut::with_capacity(16 + payload.len());
    buf.put_u16(version);
    buf.put_u16(kind);
    buf.put_u32(dst);
    buf.put_u32(src);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Wire::Message(buf.freeze())
}

/// The next protocol frame on the wire, skipping pings and pongs.
pub async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Wire>) -> (Header, Bytes) {
    loop {
        match rx.recv().await.expect("wire closed") {
            Wire::Message(bytes) => {
                return wsmux::frame::decode_frame(bytes).expect("malformed frame on the wire")
            }
            Wire::Ping | Wire::Pong => continue,
            Wire::Closed => panic!("unexpected carrier close"),
        }
    }
}

/// Assert that nothing but pings/pongs (and at most a close marker) is
/// left on the wire.
pub fn assert_no_more_frames(rx: &mut mpsc::UnboundedReceiver<Wire>) {
    while let Ok(unit) = rx.try_recv() {
        assert!(
            !matches!(unit, Wire::Message(_)),
            "unexpected frame on the wire: {unit:?}"
        );
    }
}

/// Open a low-level channel and return its id and event queue.
pub fn open_low_level(
    mux: &Multiplexor,
    timeout: Duration,
) -> (u32, mpsc::UnboundedReceiver<ChannelEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let options = ChannelOptions {
        timeout,
        ..ChannelOptions::default()
    };
    let id = mux.open_channel(&options, events_tx).expect("open failed");
    (id, events_rx)
}

/// Let the multiplexor task catch up with queued work.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}
