//! Protocol constants and tunable defaults.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::time::Duration;

/// Default interval between keep-alive pings on the carrier.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_millis(10_000);

/// Default time to wait for the peer to acknowledge an OPEN.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Default cap on simultaneously open channels per session.
pub const DEFAULT_MAX_CHANNELS: usize = 65_535;

/// Default per-channel high-water mark in bytes: the read-side queue
/// size above which the peer is asked to pause, and the bound on writes
/// buffered while a channel is opening or corked.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Highest allocatable channel id. Id 0 is reserved on the wire to mean
/// "no channel".
pub const MAX_CHANNEL_ID: u32 = u32::MAX;
