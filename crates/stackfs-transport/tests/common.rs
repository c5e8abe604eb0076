//! Common fixtures for transport integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use stackfs_transport::{
    Endpoint, EventPool, EventPoolConfig, Notification, Notify, ReceivedFrame, Transport,
    TransportConfig, TransportContext, TransportEvent,
};

/// How long any single event may take to show up.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Started event pool plus the context built on it.
pub fn context() -> TransportContext {
    let pool = Arc::new(
        EventPool::new(EventPoolConfig {
            threads: 2,
            ..Default::default()
        })
        .unwrap(),
    );
    pool.start().unwrap();
    TransportContext::new(pool)
}

/// A notification channel.
pub fn channel() -> (Arc<dyn Notify>, Receiver<Notification>) {
    let (tx, rx) = unbounded();
    (Arc::new(tx), rx)
}

/// Next notification; panics if none arrives in time.
pub fn next_event(rx: &Receiver<Notification>) -> Notification {
    rx.recv_timeout(EVENT_TIMEOUT)
        .unwrap_or_else(|_| panic!("no notification within {EVENT_TIMEOUT:?}"))
}

/// Skips notifications until one carrying `event` arrives.
pub fn wait_event(rx: &Receiver<Notification>, event: TransportEvent) -> Notification {
    loop {
        let n = next_event(rx);
        if n.event == event {
            return n;
        }
    }
}

/// True if nothing arrives within a short grace period.
pub fn quiet(rx: &Receiver<Notification>) -> bool {
    rx.recv_timeout(Duration::from_millis(200)).is_err()
}

/// Waits for `PollIn` and takes the frame it announced.
pub fn receive_frame(t: &Arc<dyn Transport>, rx: &Receiver<Notification>) -> ReceivedFrame {
    loop {
        if let Some(frame) = t.receive().unwrap() {
            return frame;
        }
        wait_event(rx, TransportEvent::PollIn);
    }
}

/// TCP listener config on an ephemeral loopback port.
pub fn loopback_listener(mut cfg: TransportConfig) -> TransportConfig {
    cfg.socket.bind_address = Some("127.0.0.1".into());
    cfg.socket.listen_port = Some(0);
    cfg
}

/// Client config pointing at a listener's bound address.
pub fn client_for(listener: &Arc<dyn Transport>, mut cfg: TransportConfig) -> TransportConfig {
    let addr: SocketAddr = match listener.local_info().endpoint {
        Some(Endpoint::Inet(addr)) => addr,
        other => panic!("listener has no TCP address: {other:?}"),
    };
    cfg.remote_host = Some(addr.ip().to_string());
    cfg.remote_port = Some(addr.port());
    cfg
}

/// Brings up a listener and a connected client; returns
/// `(listener, server side child, client)`.
pub fn connected_pair(
    ctx: &TransportContext,
    cfg: TransportConfig,
    server_rx: &Receiver<Notification>,
    server_notify: Arc<dyn Notify>,
    client_rx: &Receiver<Notification>,
    client_notify: Arc<dyn Notify>,
) -> (Arc<dyn Transport>, Arc<dyn Transport>, Arc<dyn Transport>) {
    let listener =
        stackfs_transport::init(ctx, loopback_listener(cfg.clone()), server_notify).unwrap();
    listener.listen().unwrap();
    let client = stackfs_transport::init(ctx, client_for(&listener, cfg), client_notify).unwrap();
    client.connect().unwrap();
    let up = wait_event(client_rx, TransportEvent::ChildUp);
    assert!(Arc::ptr_eq(&up.transport, &client));
    let child = wait_event(server_rx, TransportEvent::ChildUp).transport;
    assert!(!child.is_listener());
    (listener, child, client)
}
