//! Multiplex many independent, bidirectional, ordered byte channels
//! over one already-established, message-oriented carrier (a WebSocket
//! or anything that looks like one).
//!
//! Two layers are exposed:
//!
//! - [`Multiplexor`]: the explicit channel API (open, close, send,
//!   flow control, counters) plus liveness surveillance of the
//!   carrier. Channel callbacks are delivered as [`ChannelEvent`]s
//!   through a queue installed at open time.
//! - [`MuxStream`]: one channel as a plain `AsyncRead + AsyncWrite`
//!   duplex stream with buffering, backpressure coupling to the peer,
//!   and an optional inactivity timeout.
//!
//! The carrier is injected via the [`ws::Carrier`] trait;
//! [`ws::WebSocketCarrier`] adapts a tokio-tungstenite stream.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![warn(missing_docs, missing_debug_implementations)]
#![forbid(unsafe_code)]

mod alloc;
pub mod config;
mod dupe;
mod error;
pub mod frame;
mod inner;
mod liveness;
mod stream;
mod table;
pub mod ws;

pub use crate::dupe::Dupe;
pub use crate::error::Error;
pub use crate::stream::MuxStream;
pub use crate::ws::{Carrier, WsError, WsEvent, WsFrame};

use crate::inner::{MultiplexorInner, TaskData};
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

/// Crate result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Per-channel event, delivered through the queue installed at
/// [`Multiplexor::open_channel`] time.
///
/// For any channel, [`Open`](ChannelEvent::Open) strictly precedes
/// [`Data`](ChannelEvent::Data) and
/// [`FlowControl`](ChannelEvent::FlowControl), which strictly precede
/// [`Close`](ChannelEvent::Close); [`Error`](ChannelEvent::Error)
/// immediately precedes `Close` when both occur, and `Close` is always
/// the last event.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel is established.
    Open {
        /// The peer's local id for this channel.
        peer: u32,
    },
    /// Payload bytes from the peer.
    Data(Bytes),
    /// The peer asked us to pause or resume sending DATA.
    FlowControl {
        /// `true` to stop sending, `false` to resume.
        stop: bool,
    },
    /// The channel failed; always followed by
    /// [`Close`](ChannelEvent::Close).
    Error(Error),
    /// The channel is gone.
    Close,
}

/// Byte counters of a channel. Monotone non-decreasing over the
/// channel's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Payload bytes accepted for sending.
    pub bytes_written: u64,
    /// Payload bytes received.
    pub bytes_read: u64,
}

/// Session-level notification.
#[derive(Debug)]
pub enum MuxEvent {
    /// The session failed; followed by [`Closed`](MuxEvent::Closed).
    Error(Error),
    /// The session has terminated.
    Closed,
}

/// Multiplexor configuration.
#[derive(Debug, Clone)]
pub struct MuxOptions {
    /// Opaque label recorded on the tracing span for diagnostics.
    pub reference: Option<String>,
    /// Hard cap on simultaneously open channels.
    pub max_channels: usize,
    /// Interval between keep-alive pings.
    pub keep_alive: Duration,
    /// Pong idle cap; must exceed `keep_alive`.
    pub alive_threshold: Duration,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            reference: None,
            max_channels: config::DEFAULT_MAX_CHANNELS,
            keep_alive: config::DEFAULT_KEEP_ALIVE,
            alive_threshold: config::DEFAULT_KEEP_ALIVE.saturating_mul(2),
        }
    }
}

/// Channel and adapter configuration.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Accept this pre-announced peer channel instead of initiating.
    pub dst_channel: Option<u32>,
    /// How long to wait for the peer to acknowledge our OPEN. Ignored
    /// when accepting.
    pub timeout: Duration,
    /// Read-side pause threshold and write-buffer bound, in bytes.
    pub high_water_mark: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            dst_channel: None,
            timeout: config::DEFAULT_OPEN_TIMEOUT,
            high_water_mark: config::DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// One multiplexing session over one carrier.
///
/// Dropping the multiplexor destroys the session.
pub struct Multiplexor {
    inner: Arc<MultiplexorInner>,
    con_recv_stream_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxEvent>>,
}

impl Multiplexor {
    /// Start a session over an established carrier.
    ///
    /// Spawns the processing task on the current tokio runtime.
    ///
    /// # Panics
    /// Panics when `options.alive_threshold` does not exceed
    /// `options.keep_alive`.
    #[must_use]
    pub fn new<C: Carrier>(carrier: C, options: MuxOptions) -> Self {
        assert!(
            options.alive_threshold > options.keep_alive,
            "alive_threshold must exceed keep_alive"
        );
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (con_recv_stream_tx, con_recv_stream_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MultiplexorInner {
            frame_tx,
            control_tx,
            table: RwLock::new(table::ChannelTable::default()),
            con_recv_stream_tx,
            event_tx,
            destroyed: AtomicBool::new(false),
            max_channels: options.max_channels,
            keep_alive: options.keep_alive,
            alive_threshold: options.alive_threshold,
        });
        let span = match &options.reference {
            Some(reference) => tracing::info_span!("mux", %reference),
            None => tracing::info_span!("mux"),
        };
        tokio::spawn(
            inner
                .dupe()
                .task(
                    carrier,
                    TaskData {
                        frame_rx,
                        control_rx,
                    },
                )
                .instrument(span),
        );
        Self {
            inner,
            con_recv_stream_rx: tokio::sync::Mutex::new(con_recv_stream_rx),
            event_rx: tokio::sync::Mutex::new(event_rx),
        }
    }

    /// Open a channel with a caller-managed event queue (the low-level
    /// API).
    ///
    /// Returns the local channel id immediately; establishment is
    /// signalled by [`ChannelEvent::Open`]. With
    /// `options.dst_channel` set this accepts a pre-announced peer
    /// channel instead of initiating.
    ///
    /// Read-side backpressure is the caller's business on this API:
    /// pause and resume the peer with [`flow_control`](Self::flow_control)
    /// as the event queue is drained. Only [`MuxStream`]-backed
    /// channels are paused automatically.
    pub fn open_channel(
        &self,
        options: &ChannelOptions,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<u32> {
        self.inner
            .open_channel(options, events, false)
            .map(|(id, _)| id)
    }

    /// Close an open channel. Fails with [`Error::ChannelNotOpen`] when
    /// the channel is absent or still opening.
    pub fn close_channel(&self, channel: u32) -> Result<()> {
        self.inner.close_channel(channel)
    }

    /// Send payload bytes on an open channel. The channel's
    /// `bytes_written` counter updates once the carrier queue accepts
    /// the frame.
    pub fn send(&self, channel: u32, data: Bytes) -> Result<()> {
        self.inner.send_data(channel, vec![data])
    }

    /// Send several segments as a single DATA message.
    pub fn send_vectored(&self, channel: u32, segments: Vec<Bytes>) -> Result<()> {
        self.inner.send_data(channel, segments)
    }

    /// Ask the peer to pause (`stop = true`) or resume DATA on an open
    /// channel.
    pub fn flow_control(&self, channel: u32, stop: bool) -> Result<()> {
        self.inner.flow_control(channel, stop)
    }

    /// Byte counters of a channel, or `None` when it does not exist.
    #[must_use]
    pub fn channel_info(&self, channel: u32) -> Option<ChannelInfo> {
        self.inner.channel_info(channel)
    }

    /// Open a channel and return its stream immediately.
    ///
    /// The stream is still opening: writes are buffered and flushed
    /// once the peer acknowledges. Use
    /// [`established`](MuxStream::established) or
    /// [`connect`](Self::connect) to wait for the handshake.
    pub fn open_stream(&self, options: &ChannelOptions) -> Result<MuxStream> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (local_id, shared) = self.inner.open_channel(options, events_tx, true)?;
        Ok(MuxStream::new(
            local_id,
            shared,
            events_rx,
            self.inner.frame_tx.dupe(),
            self.inner.control_tx.dupe(),
            options.high_water_mark,
        ))
    }

    /// Open a channel and wait for the peer to acknowledge it.
    pub async fn connect(&self) -> Result<MuxStream> {
        self.connect_with(&ChannelOptions::default()).await
    }

    /// [`connect`](Self::connect) with explicit options.
    pub async fn connect_with(&self, options: &ChannelOptions) -> Result<MuxStream> {
        let mut stream = self.open_stream(options)?;
        stream.established().await?;
        Ok(stream)
    }

    /// The next peer-initiated channel, already acknowledged.
    ///
    /// Fails with [`Error::SocketClosed`] once the session is down.
    pub async fn accept(&self) -> Result<MuxStream> {
        self.con_recv_stream_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::SocketClosed)
    }

    /// The next session-level notification. On fatal termination
    /// [`MuxEvent::Error`] precedes [`MuxEvent::Closed`].
    pub async fn next_event(&self) -> Option<MuxEvent> {
        self.event_rx.lock().await.recv().await
    }

    /// Whether the session has terminated (or `destroy` was requested).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Relaxed)
    }

    /// Gracefully close every channel and terminate the session.
    /// Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl Drop for Multiplexor {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl fmt::Debug for Multiplexor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexor")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
