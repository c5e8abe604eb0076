//! Socket transport integration tests over loopback TCP and Unix sockets.

mod common;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use stackfs_transport::{
    encode_frame, init, AddressFamily, ConnectionState, SocketTransport, Transport,
    TransportConfig, TransportError, TransportEvent,
};

#[test]
fn test_tcp_ping_pong() {
    let ctx = context();
    let (snotify, srx) = channel();
    let (cnotify, crx) = channel();
    let (listener, child, client) =
        connected_pair(&ctx, TransportConfig::default(), &srx, snotify, &crx, cnotify);

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(child.peer_info().identifier, client.local_info().identifier);

    client
        .submit(Bytes::from_static(b"PING"), vec![Bytes::from_static(b"hello")], None)
        .unwrap();
    let frame = receive_frame(&child, &srx);
    assert_eq!(&frame.header[..], b"PING");
    assert_eq!(&frame.payload[..], b"hello");

    child
        .submit(Bytes::from_static(b"PONG"), Vec::new(), None)
        .unwrap();
    let frame = receive_frame(&client, &crx);
    assert_eq!(&frame.header[..], b"PONG");
    assert!(frame.payload.is_empty());

    let m = ctx.metrics().snapshot();
    assert_eq!(m.frames_sent, 2);
    assert_eq!(m.frames_received, 2);
    assert_eq!(m.active_connections, 2);
    assert!(m.bytes_sent >= 2 * 12 + 4 + 5 + 4);

    drop(listener);
}

#[test]
fn test_unix_ping_pong() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stackfs.sock");
    let ctx = context();
    let (snotify, srx) = channel();
    let (cnotify, crx) = channel();

    let mut cfg = TransportConfig {
        address_family: AddressFamily::Unix,
        ..Default::default()
    };
    cfg.socket.listen_path = Some(path.clone());
    cfg.socket.connect_path = Some(path.clone());

    let listener = init(&ctx, cfg.clone(), snotify).unwrap();
    listener.listen().unwrap();
    assert_eq!(listener.local_info().identifier, path.display().to_string());

    let client = init(&ctx, cfg, cnotify).unwrap();
    client.connect().unwrap();
    wait_event(&crx, TransportEvent::ChildUp);
    let child = wait_event(&srx, TransportEvent::ChildUp).transport;

    client
        .submit(Bytes::from_static(b"PING"), vec![Bytes::from(vec![7u8; 4096])], None)
        .unwrap();
    let frame = receive_frame(&child, &srx);
    assert_eq!(&frame.header[..], b"PING");
    assert_eq!(frame.payload.len(), 4096);

    child
        .submit(Bytes::from_static(b"PONG"), Vec::new(), None)
        .unwrap();
    assert_eq!(&receive_frame(&client, &crx).header[..], b"PONG");
}

#[test]
fn test_frames_arrive_in_submission_order() {
    let ctx = context();
    let (snotify, srx) = channel();
    let (cnotify, crx) = channel();
    let (_listener, child, client) =
        connected_pair(&ctx, TransportConfig::default(), &srx, snotify, &crx, cnotify);

    const FRAMES: u32 = 200;
    let chunk = Bytes::from(vec![0xabu8; 16 * 1024]);
    for seq in 0..FRAMES {
        let chunks = (seq % 5) as usize;
        let payload = vec![chunk.clone(); chunks];
        client
            .submit(Bytes::from(seq.to_be_bytes().to_vec()), payload, None)
            .unwrap();
    }
    for seq in 0..FRAMES {
        let frame = receive_frame(&child, &srx);
        let got = u32::from_be_bytes(frame.header[..4].try_into().unwrap());
        assert_eq!(got, seq);
        assert_eq!(frame.payload.len(), (seq % 5) as usize * 16 * 1024);
    }
}

const BULK_PAYLOAD: usize = 128 * 1024;

fn flood(client: &SocketTransport) -> usize {
    let payload = Bytes::from(vec![1u8; BULK_PAYLOAD]);
    let mut frames = 0;
    while client.queued_bytes() == 0 {
        client
            .submit(Bytes::from_static(b"BULK"), vec![payload.clone()], None)
            .unwrap();
        frames += 1;
        assert!(frames < 10_000, "socket never backed up");
    }
    // Keep several frames queued behind the partial one.
    for _ in 0..8 {
        client
            .submit(Bytes::from_static(b"BULK"), vec![payload.clone()], None)
            .unwrap();
    }
    frames + 8
}

#[test]
fn test_backpressure_then_pollout() {
    let ctx = context();
    let (snotify, srx) = channel();
    let (cnotify, crx) = channel();
    let listener = init(&ctx, loopback_listener(TransportConfig::default()), snotify).unwrap();
    listener.listen().unwrap();
    let client_cfg = client_for(&listener, TransportConfig::default());
    let client = SocketTransport::new(&ctx, client_cfg, cnotify);
    client.connect().unwrap();
    wait_event(&crx, TransportEvent::ChildUp);
    let child = wait_event(&srx, TransportEvent::ChildUp).transport;

    let frames = flood(&client);
    assert_eq!(client.interest(), Some((true, true)));
    assert!(ctx.metrics().snapshot().writes_queued >= 1);

    for _ in 0..frames {
        let frame = receive_frame(&child, &srx);
        assert_eq!(&frame.header[..], b"BULK");
    }
    wait_event(&crx, TransportEvent::PollOut);
    assert_eq!(client.queued_bytes(), 0);
    assert_eq!(client.interest(), Some((true, false)));
}

#[test]
fn test_disconnect_discards_queue() {
    let ctx = context();
    let (snotify, _srx) = channel();
    let (cnotify, crx) = channel();
    let listener = init(&ctx, loopback_listener(TransportConfig::default()), snotify).unwrap();
    listener.listen().unwrap();
    let client_cfg = client_for(&listener, TransportConfig::default());
    let client = SocketTransport::new(&ctx, client_cfg, cnotify);
    client.connect().unwrap();
    wait_event(&crx, TransportEvent::ChildUp);

    flood(&client);
    client.disconnect().unwrap();
    assert_eq!(client.queued_bytes(), 0);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(ctx.metrics().snapshot().frames_discarded >= 1);

    // Explicit disconnect reports ChildDown only.
    assert_eq!(next_event(&crx).event, TransportEvent::ChildDown);
    assert!(quiet(&crx));
    assert!(matches!(
        client.submit(Bytes::from_static(b"LATE"), Vec::new(), None),
        Err(TransportError::NotConnected)
    ));
}

#[test]
fn test_peer_close_reports_pollerr_then_childdown() {
    let ctx = context();
    let (snotify, srx) = channel();
    let (cnotify, crx) = channel();
    let (listener, child, client) =
        connected_pair(&ctx, TransportConfig::default(), &srx, snotify, &crx, cnotify);

    client.disconnect().unwrap();
    assert_eq!(next_event(&crx).event, TransportEvent::ChildDown);

    let err = next_event(&srx);
    assert_eq!(err.event, TransportEvent::PollErr);
    assert!(Arc::ptr_eq(&err.transport, &child));
    assert_eq!(next_event(&srx).event, TransportEvent::ChildDown);
    assert_eq!(child.state(), ConnectionState::Disconnected);
    assert_eq!(listener.state(), ConnectionState::Connected);
    assert!(quiet(&srx));
    assert_eq!(ctx.metrics().snapshot().active_connections, 0);
}

#[test]
fn test_bad_magic_disconnects() {
    let ctx = context();
    let (snotify, srx) = channel();
    let listener = init(&ctx, loopback_listener(TransportConfig::default()), snotify).unwrap();
    listener.listen().unwrap();
    let addr = match listener.local_info().endpoint {
        Some(stackfs_transport::Endpoint::Inet(addr)) => addr,
        other => panic!("unexpected endpoint {other:?}"),
    };

    let mut raw = std::net::TcpStream::connect(addr).unwrap();
    wait_event(&srx, TransportEvent::ChildUp);
    raw.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

    assert_eq!(next_event(&srx).event, TransportEvent::PollErr);
    assert_eq!(next_event(&srx).event, TransportEvent::ChildDown);
    assert_eq!(ctx.metrics().snapshot().protocol_errors, 1);
}

#[test]
fn test_oversized_submit_rejected_locally() {
    let ctx = context();
    let (snotify, srx) = channel();
    let (cnotify, crx) = channel();
    let (_listener, child, client) =
        connected_pair(&ctx, TransportConfig::default(), &srx, snotify, &crx, cnotify);

    let too_big = Bytes::from(vec![0u8; 131_073]);
    assert!(matches!(
        client.submit(Bytes::from_static(b"HDR"), vec![too_big], None),
        Err(TransportError::PayloadTooLarge { .. })
    ));
    assert!(matches!(
        client.submit(Bytes::new(), Vec::new(), None),
        Err(TransportError::InvalidHeaderSize { .. })
    ));
    assert_eq!(client.state(), ConnectionState::Connected);

    client
        .submit(Bytes::from_static(b"OK"), Vec::new(), None)
        .unwrap();
    assert_eq!(&receive_frame(&child, &srx).header[..], b"OK");
}

#[test]
fn test_listener_from_options() {
    let ctx = context();
    let (notify, _rx) = channel();
    let options: BTreeMap<String, String> = [
        ("transport-type", "tcp"),
        ("transport.socket.bind-address", "127.0.0.1"),
        ("transport.socket.listen-port", "0"),
        ("transport.socket.nodelay", "off"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let cfg = TransportConfig::from_options(&options).unwrap();
    assert!(!cfg.socket.nodelay);
    let listener = init(&ctx, cfg, notify).unwrap();
    listener.listen().unwrap();
    assert!(listener.is_listener());
    assert!(listener.local_info().identifier.starts_with("127.0.0.1:"));
}

#[test]
fn test_disconnect_leaves_peer_only_started_frames() {
    let ctx = context();
    let (cnotify, crx) = channel();
    let peer = TcpListener::bind("127.0.0.1:0").unwrap();
    let cfg = TransportConfig {
        remote_host: Some("127.0.0.1".into()),
        remote_port: Some(peer.local_addr().unwrap().port()),
        ..Default::default()
    };
    let client = SocketTransport::new(&ctx, cfg, cnotify);
    client.connect().unwrap();
    let (mut raw, _) = peer.accept().unwrap();
    wait_event(&crx, TransportEvent::ChildUp);

    let submitted = flood(&client);
    client.disconnect().unwrap();
    let mut wire = Vec::new();
    raw.read_to_end(&mut wire).unwrap();

    // Whole frames, then at most the head of the frame that was mid-write.
    let frame = encode_frame(b"BULK", &[&[1u8; BULK_PAYLOAD][..]]).unwrap();
    for chunk in wire.chunks(frame.len()) {
        assert_eq!(chunk, &frame[..chunk.len()]);
    }
    let m = ctx.metrics().snapshot();
    let whole = wire.len() / frame.len();
    assert_eq!(wire.len() as u64, m.bytes_sent);
    assert_eq!(whole as u64, m.frames_sent);
    assert!(m.frames_discarded >= 1);
    assert_eq!(whole + m.frames_discarded as usize, submitted);
}

#[test]
fn test_last_frame_survives_peer_close() {
    let ctx = context();
    let (snotify, srx) = channel();
    let (cnotify, crx) = channel();
    let (_listener, child, client) =
        connected_pair(&ctx, TransportConfig::default(), &srx, snotify, &crx, cnotify);

    client
        .submit(Bytes::from_static(b"BYE!"), Vec::new(), None)
        .unwrap();
    wait_event(&srx, TransportEvent::PollIn);
    client.disconnect().unwrap();

    let frame = child.receive().unwrap().expect("announced frame kept");
    assert_eq!(&frame.header[..], b"BYE!");
    // Taking the frame resumes reading, which finds the close.
    assert_eq!(next_event(&srx).event, TransportEvent::PollErr);
    assert_eq!(next_event(&srx).event, TransportEvent::ChildDown);
    assert!(matches!(child.receive(), Err(TransportError::NotConnected)));
}

#[test]
fn test_announced_frame_survives_peer_reset() {
    let ctx = context();
    let (snotify, srx) = channel();
    let listener = init(&ctx, loopback_listener(TransportConfig::default()), snotify).unwrap();
    listener.listen().unwrap();
    let addr = match listener.local_info().endpoint {
        Some(stackfs_transport::Endpoint::Inet(addr)) => addr,
        other => panic!("unexpected endpoint {other:?}"),
    };

    let mut raw = TcpStream::connect(addr).unwrap();
    let child = wait_event(&srx, TransportEvent::ChildUp).transport;
    raw.write_all(&encode_frame(b"BYE!", &[]).unwrap()).unwrap();
    wait_event(&srx, TransportEvent::PollIn);

    // Linger zero turns the close into a reset while the frame is unread.
    socket2::SockRef::from(&raw)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(raw);
    assert_eq!(next_event(&srx).event, TransportEvent::PollErr);
    assert_eq!(next_event(&srx).event, TransportEvent::ChildDown);
    assert_eq!(child.state(), ConnectionState::Disconnected);

    let frame = child.receive().unwrap().expect("announced frame kept");
    assert_eq!(&frame.header[..], b"BYE!");
    assert!(frame.payload.is_empty());
    assert!(matches!(child.receive(), Err(TransportError::NotConnected)));
}
