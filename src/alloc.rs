//! Channel id allocation.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::MAX_CHANNEL_ID;
use crate::table::ChannelTable;

/// Pick the next free channel id.
///
/// Starts one past the highest allocated id, wrapping from
/// [`MAX_CHANNEL_ID`] back to 1, and probes upward until a free id is
/// found, giving up after `max_channels` probes. The caller rejects a
/// full table before calling.
pub(crate) fn next_channel_id(table: &ChannelTable, max_channels: usize) -> Option<u32> {
    let start = match table.max_local_id() {
        None | Some(MAX_CHANNEL_ID) => 1,
        Some(max) => max + 1,
    };
    let mut id = start;
    for _ in 0..max_channels {
        if !table.contains_local(id) {
            return Some(id);
        }
        id = if id == MAX_CHANNEL_ID { 1 } else { id + 1 };
    }
    None
}
