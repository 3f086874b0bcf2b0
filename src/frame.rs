//! Wire format: a fixed 16-byte big-endian header plus payload segments.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::ws::WsFrame;
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes};

/// Wire protocol version implemented by this crate.
pub const PROTOCOL_VERSION: u16 = 2;

/// Length of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 16;

/// Message types of the version-2 protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Payload bytes for an open channel.
    Data = 1,
    /// Request to open a channel; `src` is the initiator's local id.
    Open = 2,
    /// Acknowledges an OPEN; `src` is the acceptor's local id.
    Ack = 3,
    /// Close a channel, optionally carrying an error code.
    Close = 4,
    /// Ask the peer to stop sending DATA.
    Pause = 5,
    /// Ask the peer to resume sending DATA.
    Resume = 6,
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, u16> {
        match value {
            1 => Ok(Self::Data),
            2 => Ok(Self::Open),
            3 => Ok(Self::Ack),
            4 => Ok(Self::Close),
            5 => Ok(Self::Pause),
            6 => Ok(Self::Resume),
            other => Err(other),
        }
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version of the sender.
    pub version: u16,
    /// Raw message type. Unknown values are ignored by the dispatcher,
    /// not by the codec.
    pub kind: u16,
    /// Destination channel at the receiver (0 for OPEN).
    pub dst: u32,
    /// Sender's local channel id (0 on a reject CLOSE).
    pub src: u32,
    /// Advertised payload length. Informational: the receiver trusts
    /// the actual payload length.
    pub length: u32,
}

impl Header {
    /// Header for an outbound version-2 message.
    #[must_use]
    pub fn new(kind: MessageType, dst: u32, src: u32, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: kind as u16,
            dst,
            src,
            length,
        }
    }

    /// Encode into the 16-byte big-endian wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let mut cursor = &mut buf[..];
        cursor.put_u16(self.version);
        cursor.put_u16(self.kind);
        cursor.put_u32(self.dst);
        cursor.put_u32(self.src);
        cursor.put_u32(self.length);
        buf
    }
}

/// Split an inbound message into its header and payload.
///
/// Fails with [`Error::InvalidFrame`] when the buffer is shorter than a
/// header. Neither `version` nor `type` is validated here; the
/// dispatcher decides what to do with them.
pub fn decode_frame(mut bytes: Bytes) -> Result<(Header, Bytes)> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::InvalidFrame);
    }
    let header = Header {
        version: bytes.get_u16(),
        kind: bytes.get_u16(),
        dst: bytes.get_u32(),
        src: bytes.get_u32(),
        length: bytes.get_u32(),
    };
    Ok((header, bytes))
}

/// An outbound protocol message: header plus zero or more payload
/// segments.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Message header; `length` is the sum of the segment lengths.
    pub header: Header,
    /// Payload segments, each sent as its own carrier fragment.
    pub payload: Vec<Bytes>,
}

impl Frame {
    fn control(kind: MessageType, dst: u32, src: u32) -> Self {
        Self {
            header: Header::new(kind, dst, src, 0),
            payload: Vec::new(),
        }
    }

    /// DATA carrying `segments` to peer channel `dst`.
    #[must_use]
    pub fn data(dst: u32, src: u32, segments: Vec<Bytes>) -> Self {
        let total: usize = segments.iter().map(Bytes::len).sum();
        // `length` is informational, saturate rather than panic
        let length = u32::try_from(total).unwrap_or(u32::MAX);
        Self {
            header: Header::new(MessageType::Data, dst, src, length),
            payload: segments,
        }
    }

    /// OPEN announcing our local channel `src`.
    #[must_use]
    pub fn open(src: u32) -> Self {
        Self::control(MessageType::Open, 0, src)
    }

    /// ACK for the peer's channel `dst` from our local channel `src`.
    #[must_use]
    pub fn ack(dst: u32, src: u32) -> Self {
        Self::control(MessageType::Ack, dst, src)
    }

    /// CLOSE for the peer's channel `dst`, optionally carrying an error
    /// code. `src` is 0 when rejecting an OPEN.
    #[must_use]
    pub fn close(dst: u32, src: u32, code: Option<&str>) -> Self {
        match code {
            None => Self::control(MessageType::Close, dst, src),
            Some(code) => {
                let payload = Bytes::copy_from_slice(code.as_bytes());
                Self {
                    header: Header::new(MessageType::Close, dst, src, payload.len() as u32),
                    payload: vec![payload],
                }
            }
        }
    }

    /// PAUSE for the peer's channel `dst`.
    #[must_use]
    pub fn pause(dst: u32, src: u32) -> Self {
        Self::control(MessageType::Pause, dst, src)
    }

    /// RESUME for the peer's channel `dst`.
    #[must_use]
    pub fn resume(dst: u32, src: u32) -> Self {
        Self::control(MessageType::Resume, dst, src)
    }

    /// PAUSE or RESUME depending on `stop`.
    #[must_use]
    pub fn flow(dst: u32, src: u32, stop: bool) -> Self {
        if stop {
            Self::pause(dst, src)
        } else {
            Self::resume(dst, src)
        }
    }

    /// Emit the message as carrier fragments with end-of-message
    /// marking: a bare header is final; otherwise the last payload
    /// segment is.
    #[must_use]
    pub fn into_fragments(self) -> Vec<WsFrame> {
        let mut fragments = Vec::with_capacity(1 + self.payload.len());
        let last = self.payload.len();
        fragments.push(WsFrame::Fragment {
            data: Bytes::copy_from_slice(&self.header.encode()),
            fin: last == 0,
        });
        for (i, segment) in self.payload.into_iter().enumerate() {
            fragments.push(WsFrame::Fragment {
                data: segment,
                fin: i + 1 == last,
            });
        }
        fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_data_header() {
        let header = Header::new(MessageType::Data, 255, 1, 4);
        let expected: [u8; HEADER_LEN] = [
            0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
            0x00, 0x04,
        ];
        assert_eq!(header.encode(), expected);
    }

    #[test]
    fn decode_round_trip() {
        let frame = Frame::data(255, 1, vec![Bytes::from_static(b"AAAA")]);
        let header = frame.header;
        let mut wire = Vec::new();
        wire.extend_from_slice(&header.encode());
        wire.extend_from_slice(b"AAAA");
        let (decoded, payload) = decode_frame(Bytes::from(wire)).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.encode(), header.encode());
        assert_eq!(&payload[..], b"AAAA");
    }

    #[test]
    fn short_buffer_is_an_error() {
        let result = decode_frame(Bytes::from_static(&[0u8; HEADER_LEN - 1]));
        assert!(matches!(result, Err(Error::InvalidFrame)));
        assert!(matches!(
            decode_frame(Bytes::new()),
            Err(Error::InvalidFrame)
        ));
    }

    #[test]
    fn unknown_type_decodes() {
        // The codec leaves type validation to the dispatcher
        let header = Header {
            version: PROTOCOL_VERSION,
            kind: 99,
            dst: 1,
            src: 2,
            length: 0,
        };
        let (decoded, _) = decode_frame(Bytes::copy_from_slice(&header.encode())).unwrap();
        assert_eq!(decoded.kind, 99);
        assert!(MessageType::try_from(decoded.kind).is_err());
    }

    #[test]
    fn fragment_marking() {
        let bare = Frame::ack(7, 3).into_fragments();
        assert_eq!(bare.len(), 1);
        assert!(matches!(bare[0], WsFrame::Fragment { fin: true, .. }));

        let with_payload = Frame::data(
            7,
            3,
            vec![Bytes::from_static(b"aa"), Bytes::from_static(b"bb")],
        )
        .into_fragments();
        assert_eq!(with_payload.len(), 3);
        let fins: Vec<bool> = with_payload
            .iter()
            .map(|f| match f {
                WsFrame::Fragment { fin, .. } => *fin,
                WsFrame::Ping => unreachable!(),
            })
            .collect();
        assert_eq!(fins, [false, false, true]);
    }

    #[test]
    fn close_carries_code() {
        let frame = Frame::close(9, 0, Some("ERR_WSM_CHANNEL_NOT_OPEN"));
        assert_eq!(frame.header.length as usize, "ERR_WSM_CHANNEL_NOT_OPEN".len());
        assert_eq!(&frame.payload[0][..], b"ERR_WSM_CHANNEL_NOT_OPEN");
    }
}
