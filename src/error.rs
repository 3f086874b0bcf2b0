//! Error taxonomy shared by the multiplexer and the stream adapter.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::ws::WsError;
use std::io;
use std::sync::Arc;
use thiserror::Error as ThisError;

/// Multiplexer errors.
///
/// The protocol kinds have an on-wire representation (see
/// [`code`](Error::code)) carried as the UTF-8 payload of CLOSE
/// messages. [`OpenChannelRejected`](Error::OpenChannelRejected) and
/// [`ChannelClosedByPeer`](Error::ChannelClosedByPeer) may wrap the
/// remote error reconstructed from such a payload.
#[derive(Debug, Clone, ThisError)]
#[non_exhaustive]
pub enum Error {
    /// No pong within the alive threshold; carries the observed idle
    /// time in milliseconds.
    #[error("no pong from peer for {0} ms")]
    PingTimeout(u64),
    /// The carrier closed before an orderly shutdown.
    #[error("websocket closed unexpectedly")]
    SocketClosedUnexpectedly,
    /// The session is already shut down.
    #[error("websocket closed")]
    SocketClosed,
    /// A frame with a version other than 2 was received.
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u16),
    /// The channel table is full.
    #[error("no channel numbers available")]
    NoChannels,
    /// The peer did not acknowledge our OPEN in time.
    #[error("channel open timed out")]
    OpenChannelTimeout,
    /// The peer rejected our OPEN.
    #[error("channel open rejected by peer")]
    OpenChannelRejected {
        /// Peer-supplied reason decoded from the CLOSE payload.
        remote: Option<Box<Error>>,
    },
    /// The channel is absent or still opening.
    #[error("channel not open")]
    ChannelNotOpen,
    /// The peer closed the channel and supplied an error.
    #[error("channel closed by peer")]
    ChannelClosedByPeer {
        /// Peer-supplied reason decoded from the CLOSE payload.
        remote: Option<Box<Error>>,
    },
    /// An OPEN named a peer channel that is already bound.
    #[error("peer channel id already in use")]
    OpenChannelReuse,
    /// A frame's source did not match the recorded peer channel.
    #[error("channel source/destination mismatch")]
    ChannelMismatch,
    /// A message too short to carry a header. Local only, never sent on
    /// the wire.
    #[error("invalid frame")]
    InvalidFrame,
    /// A peer error code this implementation does not recognize.
    #[error("remote error: {0}")]
    Remote(String),
    /// Carrier failure.
    #[error("websocket error: {0}")]
    WebSocket(Arc<WsError>),
}

impl Error {
    /// The wire code carried in CLOSE payloads, for kinds that have one.
    #[must_use]
    pub fn code(&self) -> Option<&'static str> {
        Some(match self {
            Self::PingTimeout(_) => "ERR_WSM_PING_TIMEOUT",
            Self::SocketClosedUnexpectedly => "ERR_WSM_SOCKET_CLOSED_UNEXPECTEDLY",
            Self::SocketClosed => "ERR_WSM_SOCKET_CLOSED",
            Self::UnsupportedProtocolVersion(_) => "ERR_WSM_UNSUPPORTED_PROTOCOL_VERSION",
            Self::NoChannels => "ERR_WSM_NO_CHANNELS",
            Self::OpenChannelTimeout => "ERR_WSM_OPEN_CHANNEL_TIMEOUT",
            Self::OpenChannelRejected { .. } => "ERR_WSM_OPEN_CHANNEL_REJECTED",
            Self::ChannelNotOpen => "ERR_WSM_CHANNEL_NOT_OPEN",
            Self::ChannelClosedByPeer { .. } => "ERR_WSM_CHANNEL_CLOSED_BY_PEER",
            Self::OpenChannelReuse => "ERR_WSM_OPEN_CHANNEL_REUSE",
            Self::ChannelMismatch => "ERR_WSM_CHANNEL_MISMATCH",
            _ => return None,
        })
    }

    /// Reconstruct a typed error from a wire code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "ERR_WSM_PING_TIMEOUT" => Self::PingTimeout(0),
            "ERR_WSM_SOCKET_CLOSED_UNEXPECTEDLY" => Self::SocketClosedUnexpectedly,
            "ERR_WSM_SOCKET_CLOSED" => Self::SocketClosed,
            "ERR_WSM_UNSUPPORTED_PROTOCOL_VERSION" => Self::UnsupportedProtocolVersion(0),
            "ERR_WSM_NO_CHANNELS" => Self::NoChannels,
            "ERR_WSM_OPEN_CHANNEL_TIMEOUT" => Self::OpenChannelTimeout,
            "ERR_WSM_OPEN_CHANNEL_REJECTED" => Self::OpenChannelRejected { remote: None },
            "ERR_WSM_CHANNEL_NOT_OPEN" => Self::ChannelNotOpen,
            "ERR_WSM_CHANNEL_CLOSED_BY_PEER" => Self::ChannelClosedByPeer { remote: None },
            "ERR_WSM_OPEN_CHANNEL_REUSE" => Self::OpenChannelReuse,
            "ERR_WSM_CHANNEL_MISMATCH" => Self::ChannelMismatch,
            _ => return None,
        })
    }

    /// Decode a CLOSE payload into the peer's error: a typed kind when
    /// the code is known, a generic [`Remote`](Error::Remote) otherwise.
    pub(crate) fn decode_remote(payload: &str) -> Self {
        Self::from_code(payload).unwrap_or_else(|| Self::Remote(payload.to_owned()))
    }

    /// The wrapped peer error, if any.
    #[must_use]
    pub fn remote(&self) -> Option<&Error> {
        match self {
            Self::OpenChannelRejected { remote } | Self::ChannelClosedByPeer { remote } => {
                remote.as_deref()
            }
            _ => None,
        }
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        Self::WebSocket(Arc::new(e))
    }
}

/// Mapping for stream consumers, POSIX-flavored where a kind exists.
impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::OpenChannelTimeout => io::ErrorKind::TimedOut,
            Error::OpenChannelRejected { .. } => io::ErrorKind::ConnectionRefused,
            Error::ChannelNotOpen => io::ErrorKind::NotConnected,
            Error::ChannelClosedByPeer { .. } => io::ErrorKind::ConnectionReset,
            Error::OpenChannelReuse => io::ErrorKind::AddrInUse,
            Error::SocketClosed | Error::SocketClosedUnexpectedly => io::ErrorKind::BrokenPipe,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}
