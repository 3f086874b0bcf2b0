//! Fuzz the frame codec: decoding must never panic, and a successful
//! decode must re-encode to the same header bytes.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![no_main]

use libfuzzer_sys::fuzz_target;
use wsmux::frame::{decode_frame, HEADER_LEN};

fuzz_target!(|data: &[u8]| {
    let bytes = bytes::Bytes::copy_from_slice(data);
    match decode_frame(bytes) {
        Ok((header, payload)) => {
            assert!(data.len() >= HEADER_LEN);
            assert_eq!(&header.encode()[..], &data[..HEADER_LEN]);
            assert_eq!(payload.len(), data.len() - HEADER_LEN);
        }
        Err(_) => assert!(data.len() < HEADER_LEN),
    }
});
