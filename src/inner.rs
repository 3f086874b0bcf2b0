//! The multiplexor processing task and frame dispatch.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::alloc;
use crate::dupe::Dupe;
use crate::frame::{self, Frame, Header, MessageType};
use crate::liveness::Liveness;
use crate::stream::MuxStream;
use crate::table::{ChannelContext, ChannelShared, ChannelTable};
use crate::ws::{Carrier, WsError, WsEvent, WsFrame};
use crate::{ChannelEvent, ChannelInfo, ChannelOptions, Error, MuxEvent, Result};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Notifications from timers and adapters to the processing task.
#[derive(Debug)]
pub(crate) enum Control {
    /// The ack timer of a locally initiated channel expired.
    AckTimeout(u32),
    /// An adapter wants its channel closed (shutdown or drop).
    CloseChannel(u32),
    /// Orderly session shutdown.
    Destroy,
}

/// Receivers owned by the processing task.
#[derive(Debug)]
pub(crate) struct TaskData {
    pub frame_rx: mpsc::UnboundedReceiver<Frame>,
    pub control_rx: mpsc::UnboundedReceiver<Control>,
}

/// Multiplexor shared state.
pub(crate) struct MultiplexorInner {
    /// Where API entry points and adapters queue outbound frames.
    pub frame_tx: mpsc::UnboundedSender<Frame>,
    /// Control queue into the processing task.
    pub control_tx: mpsc::UnboundedSender<Control>,
    /// Channel contexts. Lock scopes are tight and never held across an
    /// await point.
    pub table: RwLock<ChannelTable>,
    /// Peer-initiated channels on their way to `accept`.
    pub con_recv_stream_tx: mpsc::UnboundedSender<MuxStream>,
    /// Session-level notifications.
    pub event_tx: mpsc::UnboundedSender<MuxEvent>,
    /// Set once the session terminated or `destroy` was requested.
    pub destroyed: AtomicBool,
    /// Hard cap on simultaneously open channels.
    pub max_channels: usize,
    /// Ping period.
    pub keep_alive: Duration,
    /// Pong idle cap.
    pub alive_threshold: Duration,
}

impl std::fmt::Debug for MultiplexorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexorInner")
            .field("max_channels", &self.max_channels)
            .field("keep_alive", &self.keep_alive)
            .field("alive_threshold", &self.alive_threshold)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

/// Write one protocol message to the carrier, fragment by fragment.
async fn send_frame<S>(sink: &mut S, frame: Frame) -> std::result::Result<(), WsError>
where
    S: Sink<WsFrame, Error = WsError> + Unpin,
{
    let mut fragments = frame.into_fragments().into_iter().peekable();
    while let Some(fragment) = fragments.next() {
        if fragments.peek().is_some() {
            sink.feed(fragment).await?;
        } else {
            sink.send(fragment).await?;
        }
    }
    Ok(())
}

impl MultiplexorInner {
    /// Processing task: drives the carrier, the keep-alive probe, the
    /// outbound queue, and the channel state machine.
    #[tracing::instrument(skip_all, level = "trace")]
    pub(crate) async fn task<C: Carrier>(self: Arc<Self>, carrier: C, taskdata: TaskData) {
        let TaskData {
            mut frame_rx,
            mut control_rx,
        } = taskdata;
        let (mut sink, mut stream) = carrier.split();
        let mut liveness = Liveness::new(self.alive_threshold);
        let mut keepalive = tokio::time::interval(self.keep_alive);
        // A missed tick means we were busy doing networking; no need to
        // make up for it.
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let result: Result<()> = loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    trace!("sending keepalive ping");
                    if let Err(e) = sink.send(WsFrame::Ping).await {
                        break Err(Error::from(e));
                    }
                    if let Err(idle_ms) = liveness.check() {
                        break Err(Error::PingTimeout(idle_ms));
                    }
                }
                Some(frame) = frame_rx.recv() => {
                    if let Err(e) = send_frame(&mut sink, frame).await {
                        break Err(Error::from(e));
                    }
                }
                Some(control) = control_rx.recv() => {
                    match control {
                        Control::Destroy => break Ok(()),
                        Control::AckTimeout(id) => self.ack_timeout(id),
                        Control::CloseChannel(id) => self.channel_released(id),
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(WsEvent::Message(data))) => {
                        if let Err(e) = self.process_message(data) {
                            break Err(e);
                        }
                    }
                    Some(Ok(WsEvent::Pong)) => {
                        trace!("received pong");
                        liveness.record_pong();
                    }
                    Some(Ok(WsEvent::Closed)) | None => {
                        debug!("carrier closed by peer");
                        if self.destroyed.load(Ordering::Relaxed) {
                            // We asked for the shutdown; this is orderly
                            break Ok(());
                        }
                        break Err(Error::SocketClosedUnexpectedly);
                    }
                    Some(Err(e)) => break Err(Error::from(e)),
                },
            }
        };
        self.wind_down(result, sink, frame_rx).await;
    }

    /// Tear the session down, orderly or not.
    ///
    /// An orderly shutdown drains queued frames and sends CLOSE for
    /// every open channel; a fatal one sends nothing further on the
    /// carrier.
    #[tracing::instrument(skip_all, level = "trace")]
    async fn wind_down<S>(
        &self,
        result: Result<()>,
        mut sink: S,
        mut frame_rx: mpsc::UnboundedReceiver<Frame>,
    ) where
        S: Sink<WsFrame, Error = WsError> + Unpin,
    {
        self.destroyed.store(true, Ordering::Relaxed);
        match result {
            Ok(()) => {
                debug!("closing all channels");
                // Flush frames the adapters queued before the shutdown
                while let Ok(frame) = frame_rx.try_recv() {
                    if send_frame(&mut sink, frame).await.is_err() {
                        break;
                    }
                }
                let channels = { self.table.write().drain() };
                for (local_id, ctx) in channels {
                    if ctx.dst_channel > 0 {
                        send_frame(&mut sink, Frame::close(ctx.dst_channel, local_id, None))
                            .await
                            .ok();
                    }
                    self.finish_teardown(ctx, None);
                }
                sink.close().await.ok();
                self.event_tx.send(MuxEvent::Closed).ok();
            }
            Err(e) => {
                warn!("session terminated: {e}");
                let channels = { self.table.write().drain() };
                for (_, ctx) in channels {
                    self.finish_teardown(ctx, Some(e.clone()));
                }
                sink.close().await.ok();
                self.event_tx.send(MuxEvent::Error(e)).ok();
                self.event_tx.send(MuxEvent::Closed).ok();
            }
        }
    }
}

impl MultiplexorInner {
    /// Install a channel and start its handshake.
    ///
    /// Returns the local id and the state shared with the adapter. The
    /// context is installed before any frame goes out; a failed send
    /// removes it again. `adapter_paced` marks channels backed by a
    /// [`MuxStream`], whose read path drains the inflight counter;
    /// only those get a core-driven PAUSE at the high-water mark.
    pub(crate) fn open_channel(
        &self,
        options: &ChannelOptions,
        events: mpsc::UnboundedSender<ChannelEvent>,
        adapter_paced: bool,
    ) -> Result<(u32, Arc<ChannelShared>)> {
        if self.destroyed.load(Ordering::Relaxed) {
            return Err(Error::SocketClosed);
        }
        let mut table = self.table.write();
        if table.len() >= self.max_channels {
            return Err(Error::NoChannels);
        }
        let local_id =
            alloc::next_channel_id(&table, self.max_channels).ok_or(Error::NoChannels)?;
        let ctx = ChannelContext::new(events, options.high_water_mark, adapter_paced);
        let shared = ctx.shared.dupe();
        let events = ctx.events.dupe();
        if let Some(peer) = options.dst_channel {
            // Accepting a pre-announced peer channel
            if table.remote_to_local(peer).is_some() {
                return Err(Error::OpenChannelReuse);
            }
            table.insert(local_id, ctx);
            table.bind(local_id, peer);
            drop(table);
            shared.peer.store(peer, Ordering::Relaxed);
            shared.opened.store(true, Ordering::Release);
            if let Err(e) = self.queue_frame(Frame::ack(peer, local_id)) {
                self.table.write().remove(local_id);
                return Err(e);
            }
            // Queue delivery runs on the consumer's next scheduling
            // turn, never synchronously from here
            events.send(ChannelEvent::Open { peer }).ok();
            trace!("accepted channel {local_id} for peer {peer}");
            Ok((local_id, shared))
        } else {
            table.insert(local_id, ctx);
            drop(table);
            if let Err(e) = self.queue_frame(Frame::open(local_id)) {
                self.table.write().remove(local_id);
                return Err(e);
            }
            self.arm_ack_timer(local_id, options.timeout);
            trace!("opening channel {local_id}");
            Ok((local_id, shared))
        }
    }

    /// Arm the single-shot ack timer for a locally initiated channel.
    fn arm_ack_timer(&self, local_id: u32, timeout: Duration) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        {
            let mut table = self.table.write();
            match table.get_mut(local_id) {
                Some(ctx) => ctx.ack_timer = Some(cancel_tx),
                // Already torn down; nothing to time out
                None => return,
            }
        }
        let control_tx = self.control_tx.dupe();
        tokio::spawn(async move {
            tokio::select! {
                // Resolves when the timer handle is dropped (ACK, CLOSE,
                // or teardown)
                _ = &mut cancel_rx => {}
                () = tokio::time::sleep(timeout) => {
                    control_tx.send(Control::AckTimeout(local_id)).ok();
                }
            }
        });
    }

    /// Close an open channel on behalf of the local side.
    pub(crate) fn close_channel(&self, local_id: u32) -> Result<()> {
        if self.destroyed.load(Ordering::Relaxed) {
            return Err(Error::SocketClosed);
        }
        let ctx = {
            let mut table = self.table.write();
            let open = table.get(local_id).is_some_and(|ctx| ctx.dst_channel > 0);
            if !open {
                return Err(Error::ChannelNotOpen);
            }
            table
                .remove(local_id)
                .expect("context vanished under the write lock")
        };
        self.queue_frame(Frame::close(ctx.dst_channel, local_id, None))
            .ok();
        self.finish_teardown(ctx, None);
        debug!("closed channel {local_id}");
        Ok(())
    }

    /// Send payload segments as one DATA message on an open channel.
    pub(crate) fn send_data(&self, local_id: u32, segments: Vec<Bytes>) -> Result<()> {
        if self.destroyed.load(Ordering::Relaxed) {
            return Err(Error::SocketClosed);
        }
        let total: usize = segments.iter().map(Bytes::len).sum();
        let (frame, shared) = {
            let table = self.table.read();
            let ctx = table.get(local_id).ok_or(Error::ChannelNotOpen)?;
            if ctx.dst_channel == 0 {
                return Err(Error::ChannelNotOpen);
            }
            (
                Frame::data(ctx.dst_channel, local_id, segments),
                ctx.shared.dupe(),
            )
        };
        self.queue_frame(frame)?;
        // Bookkeeping strictly after the queue accepted the frame
        shared
            .bytes_written
            .fetch_add(total as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Ask the peer to pause or resume DATA on an open channel.
    pub(crate) fn flow_control(&self, local_id: u32, stop: bool) -> Result<()> {
        if self.destroyed.load(Ordering::Relaxed) {
            return Err(Error::SocketClosed);
        }
        let frame = {
            let table = self.table.read();
            let ctx = table.get(local_id).ok_or(Error::ChannelNotOpen)?;
            if ctx.dst_channel == 0 {
                return Err(Error::ChannelNotOpen);
            }
            Frame::flow(ctx.dst_channel, local_id, stop)
        };
        self.queue_frame(frame)
    }

    /// Byte counters of a channel, while it exists.
    pub(crate) fn channel_info(&self, local_id: u32) -> Option<ChannelInfo> {
        let table = self.table.read();
        let ctx = table.get(local_id)?;
        Some(ChannelInfo {
            bytes_written: ctx.shared.bytes_written.load(Ordering::Relaxed),
            bytes_read: ctx.shared.bytes_read.load(Ordering::Relaxed),
        })
    }

    /// Request an orderly shutdown. Idempotent.
    pub(crate) fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::Relaxed) {
            return;
        }
        debug!("destroying multiplexor");
        self.control_tx.send(Control::Destroy).ok();
    }

    fn queue_frame(&self, frame: Frame) -> Result<()> {
        self.frame_tx.send(frame).map_err(|_| Error::SocketClosed)
    }

    /// Best-effort CLOSE carrying an error code.
    fn send_close_code(&self, dst: u32, src: u32, error: &Error) {
        self.queue_frame(Frame::close(dst, src, error.code())).ok();
    }

    /// Deliver the terminal events for a removed context.
    fn finish_teardown(&self, ctx: ChannelContext, error: Option<Error>) {
        ctx.shared.closed.store(true, Ordering::Relaxed);
        ctx.shared.writer_waker.wake();
        if let Some(e) = error {
            ctx.events.send(ChannelEvent::Error(e)).ok();
        }
        ctx.events.send(ChannelEvent::Close).ok();
        // Dropping the context cancels any pending ack timer
    }

    /// Remove a channel and deliver its terminal events.
    fn teardown_channel(&self, local_id: u32, error: Option<Error>) {
        let removed = self.table.write().remove(local_id);
        if let Some(ctx) = removed {
            self.finish_teardown(ctx, error);
        }
    }
}

impl MultiplexorInner {
    /// Dispatch one inbound carrier message.
    ///
    /// Only session-fatal conditions return an error; everything else
    /// is recovered locally (a CLOSE to the peer, or a dropped frame).
    #[tracing::instrument(skip_all, level = "trace")]
    fn process_message(&self, data: Bytes) -> Result<()> {
        let (header, payload) = match frame::decode_frame(data) {
            Ok(parts) => parts,
            Err(_) => {
                warn!("dropping malformed frame");
                return Ok(());
            }
        };
        if header.version != frame::PROTOCOL_VERSION {
            return Err(Error::UnsupportedProtocolVersion(header.version));
        }
        trace!(
            "received frame type={} dst={} src={} len={}",
            header.kind,
            header.dst,
            header.src,
            payload.len()
        );
        match MessageType::try_from(header.kind) {
            Ok(MessageType::Data) => self.handle_data(&header, payload),
            Ok(MessageType::Open) => self.handle_open(&header),
            Ok(MessageType::Ack) => self.handle_ack(&header),
            Ok(MessageType::Close) => self.handle_close(&header, &payload),
            Ok(MessageType::Pause) => self.handle_flow(&header, true),
            Ok(MessageType::Resume) => self.handle_flow(&header, false),
            Err(kind) => debug!("ignoring unknown message type {kind}"),
        }
        Ok(())
    }

    fn handle_data(&self, header: &Header, payload: Bytes) {
        if header.dst == 0 || header.src == 0 {
            warn!("dropping DATA with a zero channel id");
            return;
        }
        enum Verdict {
            Unknown,
            Mismatch,
            Delivered,
        }
        let verdict = {
            let table = self.table.read();
            match table.get(header.dst) {
                None => Verdict::Unknown,
                Some(ctx)
                    if ctx.dst_channel != header.src
                        || table.remote_to_local(header.src) != Some(header.dst) =>
                {
                    Verdict::Mismatch
                }
                Some(ctx) => {
                    let len = payload.len();
                    ctx.shared
                        .bytes_read
                        .fetch_add(len as u64, Ordering::Relaxed);
                    if ctx.adapter_paced {
                        // Ask the peer to pause once the adapter's
                        // queue crosses the mark; the adapter resumes
                        // as it drains. Raw event-queue channels send
                        // their own PAUSE via `flow_control`.
                        let inflight =
                            ctx.shared.inflight.fetch_add(len, Ordering::Relaxed) + len;
                        if inflight > ctx.high_water
                            && !ctx.shared.peer_paused.swap(true, Ordering::Relaxed)
                        {
                            trace!("pausing peer on channel {}", header.dst);
                            self.queue_frame(Frame::pause(ctx.dst_channel, header.dst))
                                .ok();
                        }
                    }
                    if ctx.events.send(ChannelEvent::Data(payload)).is_err() {
                        // Adapter dropped; its release notification is
                        // already on the control queue
                        trace!("dropping DATA for a released channel");
                    }
                    Verdict::Delivered
                }
            }
        };
        match verdict {
            Verdict::Unknown => {
                debug!("DATA for unknown channel {}", header.dst);
                self.send_close_code(header.src, 0, &Error::ChannelNotOpen);
            }
            Verdict::Mismatch => self.mismatch(header.dst, header.src),
            Verdict::Delivered => {}
        }
    }

    /// Close both local channels involved in a source mismatch.
    fn mismatch(&self, dst: u32, src: u32) {
        warn!("channel mismatch: local {dst} is not bound to peer {src}");
        let (first, second) = {
            let mut table = self.table.write();
            let second = table
                .remote_to_local(src)
                .filter(|&other| other != dst)
                .and_then(|other| table.remove(other).map(|ctx| (other, ctx)));
            let first = table.remove(dst).map(|ctx| (dst, ctx));
            (first, second)
        };
        for (local_id, ctx) in first.into_iter().chain(second) {
            let peer = if ctx.dst_channel > 0 { ctx.dst_channel } else { src };
            self.send_close_code(peer, local_id, &Error::ChannelMismatch);
            self.finish_teardown(ctx, Some(Error::ChannelMismatch));
        }
    }

    fn handle_open(&self, header: &Header) {
        if header.src == 0 || header.dst != 0 {
            warn!("dropping malformed OPEN");
            return;
        }
        let peer = header.src;
        // A reused peer id costs the existing binding its life, and the
        // new OPEN is rejected
        let existing = {
            let mut table = self.table.write();
            table
                .remote_to_local(peer)
                .and_then(|id| table.remove(id).map(|ctx| (id, ctx)))
        };
        if let Some((local_id, ctx)) = existing {
            warn!("peer reused channel {peer}; closing local channel {local_id}");
            self.send_close_code(peer, local_id, &Error::OpenChannelReuse);
            self.finish_teardown(ctx, Some(Error::OpenChannelReuse));
            self.send_close_code(peer, 0, &Error::OpenChannelReuse);
            return;
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let options = ChannelOptions {
            dst_channel: Some(peer),
            ..ChannelOptions::default()
        };
        match self.open_channel(&options, events_tx, true) {
            Ok((local_id, shared)) => {
                let stream = MuxStream::new(
                    local_id,
                    shared,
                    events_rx,
                    self.frame_tx.dupe(),
                    self.control_tx.dupe(),
                    options.high_water_mark,
                );
                if self.con_recv_stream_tx.send(stream).is_err() {
                    // Nobody can accept it; retract the acceptance
                    warn!("no receiver for inbound channel {local_id}");
                    self.send_close_code(peer, 0, &Error::ChannelNotOpen);
                    self.teardown_channel(local_id, None);
                } else {
                    debug!("accepted channel {local_id} from peer {peer}");
                }
            }
            Err(e) => {
                debug!("rejecting OPEN from peer {peer}: {e}");
                self.send_close_code(peer, 0, &e);
            }
        }
    }

    fn handle_ack(&self, header: &Header) {
        if header.dst == 0 || header.src == 0 {
            warn!("dropping malformed ACK");
            return;
        }
        enum AckFor {
            Unknown,
            Established,
            Conflict,
            Opening,
        }
        let state = {
            let table = self.table.read();
            match table.get(header.dst) {
                None => AckFor::Unknown,
                Some(ctx) if ctx.dst_channel != 0 => AckFor::Established,
                Some(_) if table.remote_to_local(header.src).is_some() => AckFor::Conflict,
                Some(_) => AckFor::Opening,
            }
        };
        match state {
            AckFor::Unknown => {
                debug!("ACK for unknown channel {}", header.dst);
                self.send_close_code(header.src, 0, &Error::ChannelNotOpen);
                return;
            }
            AckFor::Established => {
                warn!("ignoring ACK for established channel {}", header.dst);
                return;
            }
            AckFor::Conflict => {
                // The peer id is already bound to another local channel
                self.mismatch(header.dst, header.src);
                return;
            }
            AckFor::Opening => {}
        }
        let handles = {
            let mut table = self.table.write();
            match table.get_mut(header.dst) {
                // Torn down between the two lock scopes
                None => None,
                Some(ctx) => {
                    // Cancel and clear the ack timer
                    ctx.ack_timer = None;
                    let events = ctx.events.dupe();
                    let shared = ctx.shared.dupe();
                    table.bind(header.dst, header.src);
                    Some((events, shared))
                }
            }
        };
        let Some((events, shared)) = handles else {
            return;
        };
        shared.peer.store(header.src, Ordering::Relaxed);
        shared.opened.store(true, Ordering::Release);
        shared.writer_waker.wake();
        events.send(ChannelEvent::Open { peer: header.src }).ok();
        debug!("channel {} established with peer {}", header.dst, header.src);
    }

    fn handle_close(&self, header: &Header, payload: &Bytes) {
        if header.dst == 0 {
            warn!("dropping CLOSE without a destination");
            return;
        }
        let remote = if payload.is_empty() {
            None
        } else {
            let code = String::from_utf8_lossy(payload);
            Some(Box::new(Error::decode_remote(&code)))
        };
        let removed = self.table.write().remove(header.dst);
        let Some(mut ctx) = removed else {
            debug!("stray CLOSE for channel {}", header.dst);
            return;
        };
        let error = if ctx.ack_timer.take().is_some() {
            // The peer answered our OPEN with a CLOSE
            Some(Error::OpenChannelRejected { remote })
        } else if remote.is_some() {
            Some(Error::ChannelClosedByPeer { remote })
        } else {
            None
        };
        debug!("channel {} closed by peer", header.dst);
        self.finish_teardown(ctx, error);
    }

    fn handle_flow(&self, header: &Header, stop: bool) {
        if header.dst == 0 || header.src == 0 {
            warn!("dropping malformed flow control frame");
            return;
        }
        let delivered = {
            let table = self.table.read();
            match table.get(header.dst) {
                None => false,
                Some(ctx) => {
                    ctx.shared.corked.store(stop, Ordering::Relaxed);
                    if !stop {
                        ctx.shared.writer_waker.wake();
                    }
                    ctx.events.send(ChannelEvent::FlowControl { stop }).ok();
                    true
                }
            }
        };
        if delivered {
            trace!(
                "channel {} {} by peer",
                header.dst,
                if stop { "paused" } else { "resumed" }
            );
        } else {
            debug!("flow control for unknown channel {}", header.dst);
            self.send_close_code(header.src, 0, &Error::ChannelNotOpen);
        }
    }

    /// A locally initiated channel ran out of time waiting for ACK.
    fn ack_timeout(&self, local_id: u32) {
        let removed = {
            let mut table = self.table.write();
            // An established channel raced its timer and won
            let still_opening = table.get(local_id).is_some_and(|ctx| ctx.dst_channel == 0);
            if still_opening {
                table.remove(local_id)
            } else {
                None
            }
        };
        if let Some(ctx) = removed {
            debug!("channel {local_id} open timed out");
            self.finish_teardown(ctx, Some(Error::OpenChannelTimeout));
        }
    }

    /// An adapter shut down or was dropped; close its channel.
    fn channel_released(&self, local_id: u32) {
        let removed = self.table.write().remove(local_id);
        if let Some(ctx) = removed {
            if ctx.dst_channel > 0 {
                self.queue_frame(Frame::close(ctx.dst_channel, local_id, None))
                    .ok();
            }
            self.finish_teardown(ctx, None);
            debug!("released channel {local_id}");
        }
    }
}
