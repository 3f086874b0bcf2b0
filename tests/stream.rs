//! Duplex adapter behavior: buffering, backpressure, timeouts, teardown.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

mod common;

use common::{endpoint, next_frame, pair, raw_frame, settle};
use std::io::IoSlice;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wsmux::frame::MessageType;
use wsmux::{ChannelOptions, Multiplexor, MuxOptions, MuxStream};

fn mux(carrier: common::TestCarrier) -> Multiplexor {
    Multiplexor::new(carrier, MuxOptions::default())
}

/// Open a stream over a scripted wire and complete its handshake with
/// peer id 9.
async fn established_stream(
    options: &ChannelOptions,
) -> (
    Multiplexor,
    MuxStream,
    tokio::sync::mpsc::UnboundedSender<common::Wire>,
    tokio::sync::mpsc::UnboundedReceiver<common::Wire>,
) {
    let (carrier, in_tx, mut out_rx) = endpoint();
    let a = mux(carrier);
    let mut stream = a.open_stream(options).unwrap();
    let (open, _) = next_frame(&mut out_rx).await;
    assert_eq!(open.kind, MessageType::Open as u16);
    in_tx.send(raw_frame(3, stream.local_id(), 9, &[])).unwrap();
    stream.established().await.unwrap();
    assert_eq!(stream.peer_id(), 9);
    (a, stream, in_tx, out_rx)
}

#[tokio::test]
async fn writes_buffer_until_established() {
    let (carrier, in_tx, mut out_rx) = endpoint();
    let a = mux(carrier);
    let mut stream = a.open_stream(&ChannelOptions::default()).unwrap();
    let local = stream.local_id();

    let (open, _) = next_frame(&mut out_rx).await;
    assert_eq!(open.kind, MessageType::Open as u16);

    // Not established yet: the write is accepted but held back
    stream.write_all(b"early").await.unwrap();
    settle().await;
    common::assert_no_more_frames(&mut out_rx);
    assert_eq!(stream.bytes_written(), 0);

    in_tx.send(raw_frame(3, local, 9, &[])).unwrap();
    stream.flush().await.unwrap();

    let (data, payload) = next_frame(&mut out_rx).await;
    assert_eq!(data.kind, MessageType::Data as u16);
    assert_eq!((data.dst, data.src), (9, local));
    assert_eq!(&payload[..], b"early");
    assert_eq!(stream.bytes_written(), 5);
}

#[tokio::test]
async fn peer_pause_corks_the_writer() {
    let (_a, mut stream, in_tx, mut out_rx) =
        established_stream(&ChannelOptions::default()).await;
    let local = stream.local_id();

    stream.write_all(b"a").await.unwrap();
    let (_, payload) = next_frame(&mut out_rx).await;
    assert_eq!(&payload[..], b"a");

    // PAUSE, then DATA as a fence so we know the pause was processed
    in_tx.send(raw_frame(5, local, 9, &[])).unwrap();
    in_tx.send(raw_frame(1, local, 9, b"fence")).unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"fence");

    // Corked: the write is buffered, nothing reaches the wire
    stream.write_all(b"b").await.unwrap();
    settle().await;
    common::assert_no_more_frames(&mut out_rx);

    // Uncork and flush releases the buffer in order
    in_tx.send(raw_frame(6, local, 9, &[])).unwrap();
    stream.flush().await.unwrap();
    let (data, payload) = next_frame(&mut out_rx).await;
    assert_eq!(data.kind, MessageType::Data as u16);
    assert_eq!(&payload[..], b"b");
}

#[tokio::test]
async fn read_backpressure_pauses_then_resumes_the_peer() {
    let options = ChannelOptions {
        high_water_mark: 4,
        ..ChannelOptions::default()
    };
    let (_a, mut stream, in_tx, mut out_rx) = established_stream(&options).await;
    let local = stream.local_id();

    // 5 queued bytes cross the 4-byte mark: the peer is paused once
    in_tx.send(raw_frame(1, local, 9, b"aaaaa")).unwrap();
    let (pause, _) = next_frame(&mut out_rx).await;
    assert_eq!(pause.kind, MessageType::Pause as u16);
    assert_eq!((pause.dst, pause.src), (9, local));

    // Draining below half the mark resumes it
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"aaaaa");
    let (resume, _) = next_frame(&mut out_rx).await;
    assert_eq!(resume.kind, MessageType::Resume as u16);
    assert_eq!((resume.dst, resume.src), (9, local));
    assert_eq!(stream.bytes_read(), 5);
}

#[tokio::test]
async fn vectored_write_packs_one_message() {
    let (_a, mut stream, _in_tx, mut out_rx) =
        established_stream(&ChannelOptions::default()).await;

    let written = stream
        .write_vectored(&[IoSlice::new(b"AA"), IoSlice::new(b"BB")])
        .await
        .unwrap();
    assert_eq!(written, 4);

    let (data, payload) = next_frame(&mut out_rx).await;
    assert_eq!(data.kind, MessageType::Data as u16);
    assert_eq!(data.length, 4);
    assert_eq!(&payload[..], b"AABB");
    assert_eq!(stream.bytes_written(), 4);
}

#[tokio::test]
async fn shutdown_flushes_then_closes() {
    let (carrier, in_tx, mut out_rx) = endpoint();
    let a = mux(carrier);
    let mut stream = a.open_stream(&ChannelOptions::default()).unwrap();
    let local = stream.local_id();
    let _ = next_frame(&mut out_rx).await; // OPEN

    stream.write_all(b"tail").await.unwrap();
    in_tx.send(raw_frame(3, local, 9, &[])).unwrap();
    stream.shutdown().await.unwrap();

    let (data, payload) = next_frame(&mut out_rx).await;
    assert_eq!(data.kind, MessageType::Data as u16);
    assert_eq!(&payload[..], b"tail");
    let (close, _) = next_frame(&mut out_rx).await;
    assert_eq!(close.kind, MessageType::Close as u16);
    assert_eq!((close.dst, close.src), (9, local));

    // Writing after shutdown is a hard error
    let error = stream.write_all(b"late").await.unwrap_err();
    assert_eq!(error.kind(), std::io::ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn remote_close_is_eof_then_broken_pipe() {
    let (a_carrier, b_carrier) = pair();
    let a = mux(a_carrier);
    let b = mux(b_carrier);
    let (connected, accepted) = tokio::join!(a.connect(), b.accept());
    let mut a_stream = connected.unwrap();
    let mut b_stream = accepted.unwrap();

    a_stream.shutdown().await.unwrap();

    // EOF after the peer's orderly close, no error
    let mut buf = [0u8; 8];
    let n = b_stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
    // The writable half is gone with the channel
    let error = b_stream.write_all(b"x").await.unwrap_err();
    assert_eq!(error.kind(), std::io::ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn drop_closes_the_channel() {
    let (a_carrier, b_carrier) = pair();
    let a = mux(a_carrier);
    let b = mux(b_carrier);
    let (connected, accepted) = tokio::join!(a.connect(), b.accept());
    let a_stream = connected.unwrap();
    let mut b_stream = accepted.unwrap();
    let id = a_stream.local_id();

    drop(a_stream);

    let mut buf = [0u8; 1];
    assert_eq!(b_stream.read(&mut buf).await.unwrap(), 0);
    settle().await;
    assert!(a.channel_info(id).is_none());
}

#[tokio::test(start_paused = true)]
async fn inactivity_timeout_fires() {
    let (_a, mut stream, _in_tx, _out_rx) =
        established_stream(&ChannelOptions::default()).await;
    stream.set_timeout(Some(Duration::from_millis(100)));

    let mut buf = [0u8; 1];
    let error = stream.read(&mut buf).await.unwrap_err();
    assert_eq!(error.kind(), std::io::ErrorKind::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn activity_resets_the_inactivity_timer() {
    let (_a, mut stream, in_tx, _out_rx) =
        established_stream(&ChannelOptions::default()).await;
    let local = stream.local_id();
    stream.set_timeout(Some(Duration::from_millis(100)));

    // Data arriving before the deadline feeds the read and re-arms it
    in_tx.send(raw_frame(1, local, 9, b"k")).unwrap();
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await.unwrap();

    let error = stream.read(&mut buf).await.unwrap_err();
    assert_eq!(error.kind(), std::io::ErrorKind::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn zero_timeout_and_keep_alive_disable_the_timer() {
    let (_a, mut stream, _in_tx, _out_rx) =
        established_stream(&ChannelOptions::default()).await;
    stream.set_timeout(Some(Duration::from_millis(100)));
    stream.set_keep_alive(true);

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await;
    assert!(read.is_err(), "read should stay pending with no timer");
}

#[tokio::test(start_paused = true)]
async fn releasing_the_last_ref_disarms_the_timer() {
    let (_a, mut stream, _in_tx, _out_rx) =
        established_stream(&ChannelOptions::default()).await;
    stream.set_timeout(Some(Duration::from_millis(100)));
    stream.release();

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await;
    assert!(read.is_err(), "read should stay pending while unreferenced");

    // Taking a reference again re-arms the configured timeout
    stream.retain();
    let error = stream.read(&mut buf).await.unwrap_err();
    assert_eq!(error.kind(), std::io::ErrorKind::TimedOut);
}

#[tokio::test]
async fn destroy_discards_buffered_writes() {
    let (carrier, _in_tx, mut out_rx) = endpoint();
    let a = mux(carrier);
    let mut stream = a.open_stream(&ChannelOptions::default()).unwrap();
    let local = stream.local_id();
    let _ = next_frame(&mut out_rx).await; // OPEN

    stream.write_all(b"never sent").await.unwrap();
    stream.destroy();
    settle().await;

    assert!(a.channel_info(local).is_none());
    common::assert_no_more_frames(&mut out_rx);
}

#[tokio::test]
async fn counters_survive_teardown() {
    let (a_carrier, b_carrier) = pair();
    let a = mux(a_carrier);
    let b = mux(b_carrier);
    let (connected, accepted) = tokio::join!(a.connect(), b.accept());
    let mut a_stream = connected.unwrap();
    let mut b_stream = accepted.unwrap();

    a_stream.write_all(b"0123456789").await.unwrap();
    let mut buf = [0u8; 10];
    b_stream.read_exact(&mut buf).await.unwrap();

    b_stream.shutdown().await.unwrap();
    let mut tail = [0u8; 1];
    assert_eq!(a_stream.read(&mut tail).await.unwrap(), 0);

    // The table entry is gone, the adapter snapshot is not
    settle().await;
    assert!(a.channel_info(a_stream.local_id()).is_none());
    assert_eq!(a_stream.bytes_written(), 10);
    assert_eq!(b_stream.bytes_read(), 10);
}
