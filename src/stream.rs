//! A channel presented as a duplex byte stream.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::frame::Frame;
use crate::inner::Control;
use crate::table::ChannelShared;
use crate::{ChannelEvent, Error};
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, Sleep};
use tracing::trace;

/// Read-side lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// OPEN sent, ACK not yet observed.
    Opening,
    /// Established; reads and writes flow.
    Open,
    /// Torn down, locally or by the peer.
    Closed,
}

/// Where the next write goes.
enum WriteDisposition {
    /// Into the pending queue (opening or corked).
    Buffer,
    /// Straight to the multiplexor.
    Direct,
}

/// One multiplexed channel as an [`AsyncRead`]`+`[`AsyncWrite`] stream.
///
/// Safe to [`tokio::io::split`]: only the read half consumes the
/// channel's event queue; the write half runs on the shared flags and
/// is woken by the multiplexor task through the writer waker.
///
/// Dropping the stream without a shutdown closes the channel.
pub struct MuxStream {
    local_id: u32,
    shared: Arc<ChannelShared>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    frame_tx: mpsc::UnboundedSender<Frame>,
    control_tx: mpsc::UnboundedSender<Control>,
    state: StreamState,
    /// Chunk currently being copied out.
    read_buf: Bytes,
    /// Chunks delivered but not yet copied out.
    read_queue: VecDeque<Bytes>,
    /// Error surfaced exactly once from the read path.
    read_error: Option<Error>,
    /// Writes buffered while opening or corked, bounded by the
    /// high-water mark.
    write_queue: VecDeque<Bytes>,
    write_queued: usize,
    high_water: usize,
    /// The channel close was already requested; `Drop` must not repeat
    /// it.
    close_sent: bool,
    /// Sliding inactivity timeout.
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    /// Handle count; at zero the inactivity timer is disarmed.
    refs: u32,
}

impl MuxStream {
    pub(crate) fn new(
        local_id: u32,
        shared: Arc<ChannelShared>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        frame_tx: mpsc::UnboundedSender<Frame>,
        control_tx: mpsc::UnboundedSender<Control>,
        high_water: usize,
    ) -> Self {
        Self {
            local_id,
            shared,
            events,
            frame_tx,
            control_tx,
            state: StreamState::Opening,
            read_buf: Bytes::new(),
            read_queue: VecDeque::new(),
            read_error: None,
            write_queue: VecDeque::new(),
            write_queued: 0,
            high_water,
            close_sent: false,
            timeout: None,
            deadline: None,
            refs: 1,
        }
    }

    /// Local channel id.
    #[must_use]
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Peer channel id; 0 while the channel is still opening.
    #[must_use]
    pub fn peer_id(&self) -> u32 {
        self.shared.peer.load(Ordering::Relaxed)
    }

    /// Total payload bytes accepted for sending on this channel.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Relaxed)
    }

    /// Total payload bytes received on this channel.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.shared.bytes_read.load(Ordering::Relaxed)
    }

    /// Wait until the peer acknowledges the channel.
    ///
    /// Resolves immediately for accepted channels. Fails with the
    /// channel's error on timeout, rejection, or teardown.
    pub async fn established(&mut self) -> Result<(), Error> {
        loop {
            match self.state {
                StreamState::Open => return Ok(()),
                StreamState::Closed => {
                    return Err(self.read_error.take().unwrap_or(Error::ChannelNotOpen))
                }
                StreamState::Opening => {}
            }
            match self.events.recv().await {
                Some(event) => self.handle_event(event),
                None => return Err(Error::SocketClosed),
            }
        }
    }

    /// Arm (or disarm, with `None` or a zero duration) the sliding
    /// inactivity timeout. Expiry surfaces as
    /// [`io::ErrorKind::TimedOut`] from the pending read or write.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout.filter(|d| !d.is_zero());
        self.deadline = match self.timeout {
            Some(d) if self.refs > 0 => Some(Box::pin(tokio::time::sleep(d))),
            _ => None,
        };
    }

    /// Keep-alive accessor retained for API compatibility: enabling it
    /// disables the inactivity timeout.
    pub fn set_keep_alive(&mut self, enable: bool) {
        if enable {
            self.set_timeout(None);
        }
    }

    /// No-op accessor retained for API compatibility.
    pub fn set_nodelay(&self, _nodelay: bool) {}

    /// No-op accessor retained for API compatibility.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// No-op accessor retained for API compatibility.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Increment the handle count, re-arming the inactivity timer when
    /// coming back from zero.
    pub fn retain(&mut self) {
        self.refs += 1;
        if self.refs == 1 {
            let timeout = self.timeout;
            self.set_timeout(timeout);
        }
    }

    /// Decrement the handle count. At zero the inactivity timer is
    /// disarmed so a pooled stream does not keep the runtime busy.
    pub fn release(&mut self) {
        self.refs = self.refs.saturating_sub(1);
        if self.refs == 0 {
            self.deadline = None;
        }
    }

    /// Close the channel immediately, discarding buffered writes.
    /// Idempotent.
    pub fn destroy(&mut self) {
        self.write_queue.clear();
        self.write_queued = 0;
        self.request_close();
        self.state = StreamState::Closed;
    }

    /// Request an orderly channel close from the multiplexor.
    fn request_close(&mut self) {
        if !self.close_sent {
            self.close_sent = true;
            self.deadline = None;
            self.control_tx
                .send(Control::CloseChannel(self.local_id))
                .ok();
        }
    }

    /// Reset the inactivity deadline after any activity.
    fn touch(&mut self) {
        if let (Some(timeout), Some(deadline)) = (self.timeout, self.deadline.as_mut()) {
            deadline.as_mut().reset(Instant::now() + timeout);
        }
    }

    /// Register the inactivity deadline; `true` once it has expired.
    fn deadline_expired(&mut self, cx: &mut Context<'_>) -> bool {
        match self.deadline.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }

    fn timed_out() -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, "channel inactivity timeout")
    }

    fn broken_pipe() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")
    }

    /// Apply one event from the multiplexor to the read-side state.
    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open { peer } => {
                trace!("channel {} established with peer {peer}", self.local_id);
                if self.state == StreamState::Opening {
                    self.state = StreamState::Open;
                }
                self.touch();
            }
            ChannelEvent::Data(chunk) => {
                self.touch();
                if !chunk.is_empty() {
                    self.read_queue.push_back(chunk);
                }
            }
            // The cork state lives in the shared flags; the event is
            // for low-level observers
            ChannelEvent::FlowControl { .. } => {}
            ChannelEvent::Error(e) => {
                self.read_error = Some(e);
            }
            ChannelEvent::Close => {
                self.state = StreamState::Closed;
            }
        }
    }

    /// Account for consumed bytes and resume a paused peer once the
    /// queue has drained to half the mark.
    fn after_consume(&mut self, n: usize) {
        self.touch();
        if n == 0 {
            return;
        }
        let inflight = self
            .shared
            .inflight
            .fetch_sub(n, Ordering::Relaxed)
            .saturating_sub(n);
        if self.shared.peer_paused.load(Ordering::Relaxed) && inflight <= self.high_water / 2 {
            let peer = self.shared.peer.load(Ordering::Relaxed);
            if peer > 0
                && self
                    .frame_tx
                    .send(Frame::resume(peer, self.local_id))
                    .is_ok()
            {
                self.shared.peer_paused.store(false, Ordering::Relaxed);
                trace!("channel {} resumed the peer", self.local_id);
            }
        }
    }

    /// Hand segments straight to the multiplexor as one DATA message.
    fn send_direct(&mut self, segments: Vec<Bytes>) -> io::Result<()> {
        let peer = self.shared.peer.load(Ordering::Relaxed);
        let total: usize = segments.iter().map(Bytes::len).sum();
        self.frame_tx
            .send(Frame::data(peer, self.local_id, segments))
            .map_err(|_| Self::broken_pipe())?;
        self.shared
            .bytes_written
            .fetch_add(total as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Flush the pending queue to the multiplexor, in order.
    fn drain_write_queue(&mut self) -> io::Result<()> {
        while let Some(chunk) = self.write_queue.pop_front() {
            let len = chunk.len();
            self.send_direct(vec![chunk])?;
            self.write_queued -= len;
        }
        Ok(())
    }

    /// Decide whether the next write buffers, goes direct, or waits.
    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<WriteDisposition>> {
        if self.close_sent || self.shared.closed.load(Ordering::Relaxed) {
            return Poll::Ready(Err(Self::broken_pipe()));
        }
        // `opened` publishes `peer`
        let opened = self.shared.opened.load(Ordering::Acquire);
        let corked = self.shared.corked.load(Ordering::Relaxed);
        if opened && !corked {
            self.drain_write_queue()?;
            return Poll::Ready(Ok(WriteDisposition::Direct));
        }
        if self.write_queued < self.high_water {
            return Poll::Ready(Ok(WriteDisposition::Buffer));
        }
        self.shared.writer_waker.register(cx.waker());
        // Re-check after registering so a concurrent open/uncork/close
        // cannot lose the wake
        if self.shared.closed.load(Ordering::Relaxed)
            || (self.shared.opened.load(Ordering::Acquire)
                && !self.shared.corked.load(Ordering::Relaxed))
        {
            cx.waker().wake_by_ref();
        }
        if self.deadline_expired(cx) {
            return Poll::Ready(Err(Self::timed_out()));
        }
        Poll::Pending
    }

    fn poll_flush_impl(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.close_sent || self.shared.closed.load(Ordering::Relaxed) {
            return if self.write_queue.is_empty() {
                Poll::Ready(Ok(()))
            } else {
                Poll::Ready(Err(Self::broken_pipe()))
            };
        }
        if self.shared.opened.load(Ordering::Acquire) && !self.shared.corked.load(Ordering::Relaxed)
        {
            self.drain_write_queue()?;
        }
        if self.write_queue.is_empty() {
            return Poll::Ready(Ok(()));
        }
        self.shared.writer_waker.register(cx.waker());
        if self.shared.closed.load(Ordering::Relaxed)
            || (self.shared.opened.load(Ordering::Acquire)
                && !self.shared.corked.load(Ordering::Relaxed))
        {
            cx.waker().wake_by_ref();
        }
        if self.deadline_expired(cx) {
            return Poll::Ready(Err(Self::timed_out()));
        }
        Poll::Pending
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                this.after_consume(n);
                return Poll::Ready(Ok(()));
            }
            if let Some(chunk) = this.read_queue.pop_front() {
                this.read_buf = chunk;
                continue;
            }
            if this.state == StreamState::Closed {
                return match this.read_error.take() {
                    Some(e) => Poll::Ready(Err(e.into())),
                    // EOF
                    None => Poll::Ready(Ok(())),
                };
            }
            match this.events.poll_recv(cx) {
                Poll::Ready(Some(event)) => this.handle_event(event),
                Poll::Ready(None) => this.state = StreamState::Closed,
                Poll::Pending => {
                    if this.deadline_expired(cx) {
                        return Poll::Ready(Err(Self::timed_out()));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let disposition = ready!(this.poll_write_ready(cx))?;
        let chunk = Bytes::copy_from_slice(buf);
        match disposition {
            WriteDisposition::Buffer => {
                this.write_queued += chunk.len();
                this.write_queue.push_back(chunk);
            }
            WriteDisposition::Direct => this.send_direct(vec![chunk])?,
        }
        this.touch();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let disposition = ready!(this.poll_write_ready(cx))?;
        let segments: Vec<Bytes> = bufs
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| Bytes::copy_from_slice(b))
            .collect();
        let total: usize = segments.iter().map(Bytes::len).sum();
        if total == 0 {
            return Poll::Ready(Ok(0));
        }
        match disposition {
            WriteDisposition::Buffer => {
                for chunk in segments {
                    this.write_queued += chunk.len();
                    this.write_queue.push_back(chunk);
                }
            }
            // All segments travel as a single DATA message
            WriteDisposition::Direct => this.send_direct(segments)?,
        }
        this.touch();
        Poll::Ready(Ok(total))
    }

    fn is_write_vectored(&self) -> bool {
        true
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_flush_impl(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.close_sent {
            return Poll::Ready(Ok(()));
        }
        if !this.shared.closed.load(Ordering::Relaxed) && !this.write_queue.is_empty() {
            match this.poll_flush_impl(cx) {
                Poll::Ready(Ok(())) => {}
                // The queue is lost either way; close regardless
                Poll::Ready(Err(_)) => {}
                Poll::Pending => return Poll::Pending,
            }
        }
        this.request_close();
        this.state = StreamState::Closed;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.request_close();
    }
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxStream")
            .field("local_id", &self.local_id)
            .field("peer_id", &self.peer_id())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
