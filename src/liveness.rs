//! Peer liveness bookkeeping.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::time::Duration;
use tokio::time::Instant;

/// Tracks the last pong and decides when the peer counts as dead.
///
/// The multiplexor task owns the ping interval; this only does the
/// arithmetic, so it stays testable under paused time.
#[derive(Debug)]
pub(crate) struct Liveness {
    last_pong: Instant,
    alive_threshold: Duration,
}

impl Liveness {
    /// Start the clock; construction counts as hearing from the peer.
    pub fn new(alive_threshold: Duration) -> Self {
        Self {
            last_pong: Instant::now(),
            alive_threshold,
        }
    }

    /// Record a pong from the peer.
    pub fn record_pong(&mut self) {
        self.last_pong = Instant::now();
    }

    /// Time since the last pong.
    pub fn idle(&self) -> Duration {
        self.last_pong.elapsed()
    }

    /// `Err(idle milliseconds)` when the peer has been silent for at
    /// least the alive threshold.
    pub fn check(&self) -> Result<(), u64> {
        let idle = self.idle();
        if idle >= self.alive_threshold {
            Err(idle.as_millis() as u64)
        } else {
            Ok(())
        }
    }
}
