//! Channel bookkeeping: local contexts and the peer-id binding.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::ChannelEvent;
use futures_util::task::AtomicWaker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// State shared between the multiplexor task and a channel's adapter.
///
/// Relaxed ordering throughout: these are counters and latches, not
/// guards for memory accesses. The exception is `opened`, which
/// publishes `peer` and therefore uses release/acquire.
#[derive(Debug, Default)]
pub(crate) struct ChannelShared {
    /// Total payload bytes accepted for sending on this channel.
    pub bytes_written: AtomicU64,
    /// Total payload bytes received on this channel.
    pub bytes_read: AtomicU64,
    /// Bytes delivered to the adapter and not yet consumed.
    pub inflight: AtomicUsize,
    /// We sent PAUSE and have not resumed the peer yet.
    pub peer_paused: AtomicBool,
    /// Peer channel id; published by the `opened` store.
    pub peer: AtomicU32,
    /// The handshake completed; writes may go direct.
    pub opened: AtomicBool,
    /// The peer sent PAUSE; outbound writes are buffered.
    pub corked: AtomicBool,
    /// The channel is gone; writes fail.
    pub closed: AtomicBool,
    /// Wakes a writer blocked on open, cork, or teardown.
    pub writer_waker: AtomicWaker,
}

/// Per-channel context owned by the multiplexor.
#[derive(Debug)]
pub(crate) struct ChannelContext {
    /// Peer channel id; 0 until the channel is acknowledged.
    pub dst_channel: u32,
    /// Inbound event queue to the channel's consumer.
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    /// Counters and write-path flags shared with the adapter.
    pub shared: Arc<ChannelShared>,
    /// Cancellation handle of the pending ack timer when we initiated
    /// the channel. Dropping it cancels the timer.
    pub ack_timer: Option<oneshot::Sender<()>>,
    /// Read-side pause threshold in bytes.
    pub high_water: usize,
    /// An adapter drains `inflight` and resumes the peer for this
    /// channel. Raw event-queue channels drive flow control themselves
    /// and must not be paused on their behalf.
    pub adapter_paced: bool,
}

impl ChannelContext {
    pub fn new(
        events: mpsc::UnboundedSender<ChannelEvent>,
        high_water: usize,
        adapter_paced: bool,
    ) -> Self {
        Self {
            dst_channel: 0,
            events,
            shared: Arc::new(ChannelShared::default()),
            ack_timer: None,
            high_water,
            adapter_paced,
        }
    }
}

/// The channel table: local id → context, peer `src` → local id.
///
/// Invariant: `remote[r] == c` iff `local[c].dst_channel == r` for
/// `r > 0`.
#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    local: HashMap<u32, ChannelContext>,
    remote: HashMap<u32, u32>,
}

impl ChannelTable {
    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn contains_local(&self, id: u32) -> bool {
        self.local.contains_key(&id)
    }

    pub fn max_local_id(&self) -> Option<u32> {
        self.local.keys().copied().max()
    }

    pub fn get(&self, id: u32) -> Option<&ChannelContext> {
        self.local.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut ChannelContext> {
        self.local.get_mut(&id)
    }

    pub fn remote_to_local(&self, peer: u32) -> Option<u32> {
        self.remote.get(&peer).copied()
    }

    /// Install a context. The id must come from the allocator.
    pub fn insert(&mut self, id: u32, ctx: ChannelContext) {
        debug_assert!(!self.local.contains_key(&id), "allocator returned a used id");
        self.local.insert(id, ctx);
    }

    /// Bind an installed channel to its peer id.
    pub fn bind(&mut self, local: u32, peer: u32) {
        if let Some(ctx) = self.local.get_mut(&local) {
            ctx.dst_channel = peer;
            self.remote.insert(peer, local);
        }
    }

    /// Remove a context, dropping its remote binding. Dropping the
    /// returned context cancels any pending ack timer.
    pub fn remove(&mut self, id: u32) -> Option<ChannelContext> {
        let ctx = self.local.remove(&id)?;
        if ctx.dst_channel > 0 {
            self.remote.remove(&ctx.dst_channel);
        }
        Some(ctx)
    }

    /// Take every context, clearing both maps.
    pub fn drain(&mut self) -> Vec<(u32, ChannelContext)> {
        self.remote.clear();
        self.local.drain().collect()
    }
}
