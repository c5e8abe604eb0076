//! Stream socket transport over TCP or Unix-domain sockets.
//!
//! Each transport owns one socket registered with the shared [`EventPool`].
//! Readiness drives connect completion, outbound queue draining and frame
//! assembly; every mutable field sits behind one per-connection mutex, and
//! events are queued under it and delivered after it is released.

use std::collections::HashMap;
use std::io;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::{TransportConfig, TransportKind};
use crate::error::{Result, TransportError};
use crate::event::{EventHandler, EventPool, Readiness, SlotId};
use crate::incoming::{Assembler, Pump};
use crate::ioq::{BufferRef, IoqEntry, OutboundQueue, QueueState};
use crate::metrics::TransportMetrics;
use crate::name::{resolve_client_bind, resolve_listen, resolve_remote, PeerInfo};
use crate::protocol::ReceivedFrame;
use crate::transport::{
    ConnectionState, Notify, Outbox, Transport, TransportContext, TransportEvent,
};

static SOCKET_IDS: AtomicU64 = AtomicU64::new(1);

type Events = Vec<TransportEvent>;

struct SocketPrivate {
    sock: Option<Socket>,
    slot: Option<SlotId>,
    state: ConnectionState,
    listening: bool,
    /// `ChildUp` has been reported and `ChildDown` is still owed.
    up: bool,
    incoming: Assembler,
    ioq: OutboundQueue,
    local: PeerInfo,
    peer: PeerInfo,
    connect_fail_logged: bool,
    submit_fail_logged: bool,
}

impl SocketPrivate {
    fn new() -> Self {
        Self {
            sock: None,
            slot: None,
            state: ConnectionState::Disconnected,
            listening: false,
            up: false,
            incoming: Assembler::new(),
            ioq: OutboundQueue::new(),
            local: PeerInfo::default(),
            peer: PeerInfo::default(),
            connect_fail_logged: false,
            submit_fail_logged: false,
        }
    }
}

/// Socket transport endpoint.
pub struct SocketTransport {
    id: u64,
    me: Weak<SocketTransport>,
    parent: Option<Weak<SocketTransport>>,
    config: Arc<TransportConfig>,
    pool: Arc<EventPool>,
    notify: Arc<dyn Notify>,
    metrics: Arc<TransportMetrics>,
    inner: Mutex<SocketPrivate>,
    outbox: Outbox,
    children: Mutex<HashMap<u64, Arc<SocketTransport>>>,
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let p = self.inner.lock();
        f.debug_struct("SocketTransport")
            .field("id", &self.id)
            .field("state", &p.state)
            .field("listening", &p.listening)
            .field("peer", &p.peer.identifier)
            .finish()
    }
}

impl SocketTransport {
    /// Creates a disconnected socket transport.
    pub fn new(
        ctx: &TransportContext,
        config: TransportConfig,
        notify: Arc<dyn Notify>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: SOCKET_IDS.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            parent: None,
            config: Arc::new(config),
            pool: ctx.pool().clone(),
            notify,
            metrics: ctx.metrics().clone(),
            inner: Mutex::new(SocketPrivate::new()),
            outbox: Outbox::default(),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Accepted connections still owned by this listener.
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Bytes waiting in the outbound queue.
    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().ioq.pending_bytes()
    }

    /// Current event pool interest `(read, write)`, if registered.
    pub fn interest(&self) -> Option<(bool, bool)> {
        let slot = self.inner.lock().slot?;
        self.pool.interest(slot)
    }

    fn handler(&self) -> Weak<dyn EventHandler> {
        let weak: Weak<dyn EventHandler> = self.me.clone();
        weak
    }

    fn configure(&self, sock: &Socket, inet: bool) -> Result<()> {
        if inet {
            if self.config.socket.nodelay {
                if let Err(e) = sock.set_nodelay(true) {
                    warn!(error = %e, "failed to set TCP_NODELAY");
                }
            }
            if self.config.socket.keepalive {
                if let Err(e) = sock.set_keepalive(true) {
                    warn!(error = %e, "failed to set SO_KEEPALIVE");
                }
            }
        }
        if self.config.non_blocking {
            sock.set_nonblocking(true)?;
        } else {
            warn!("non-blocking IO disabled");
        }
        Ok(())
    }

    fn on_connection_event(
        &self,
        p: &mut SocketPrivate,
        ev: Readiness,
        events: &mut Events,
    ) -> Result<()> {
        if p.state == ConnectionState::Connecting {
            self.finish_connect(p, events)?;
        }
        if ev.errored {
            let sock = p.sock.as_ref().ok_or(TransportError::NotConnected)?;
            return Err(match sock.take_error() {
                Ok(Some(e)) => e.into(),
                _ => TransportError::ConnectionClosed,
            });
        }
        if ev.writable && p.state == ConnectionState::Connected {
            self.on_writable(p, events)?;
        }
        if ev.readable && p.state == ConnectionState::Connected {
            self.on_readable(p, events)?;
        }
        Ok(())
    }

    fn finish_connect(&self, p: &mut SocketPrivate, events: &mut Events) -> Result<()> {
        let sock = p.sock.as_ref().ok_or(TransportError::NotConnected)?;
        if let Some(err) = sock.take_error()? {
            if !p.connect_fail_logged {
                p.connect_fail_logged = true;
                error!(peer = %p.peer, error = %err, "connection failed");
            }
            return Err(err.into());
        }
        if let Ok(addr) = sock.local_addr() {
            p.local = PeerInfo::from_sock_addr(&addr, None);
        }
        p.state = ConnectionState::Connected;
        p.up = true;
        self.metrics.connection_opened();
        info!(peer = %p.peer, local = %p.local, "connected");
        if let Some(slot) = p.slot {
            self.pool
                .select_on(slot, Some(true), Some(!p.ioq.is_empty()))?;
        }
        events.push(TransportEvent::ChildUp);
        Ok(())
    }

    fn on_writable(&self, p: &mut SocketPrivate, events: &mut Events) -> Result<()> {
        let slot = p.slot.ok_or(TransportError::NotConnected)?;
        if p.ioq.is_empty() {
            self.pool.select_on(slot, None, Some(false))?;
            return Ok(());
        }
        let mut w: &Socket = p.sock.as_ref().ok_or(TransportError::NotConnected)?;
        let before = p.ioq.len();
        let progress = p.ioq.churn(&mut w).map_err(|e| {
            error!(peer = %p.peer, error = %e, "writev failed");
            e
        })?;
        self.metrics.add_bytes_sent(progress.written as u64);
        let sent = before - p.ioq.len();
        self.metrics.add_frames_sent(sent as u64);
        if progress.state == QueueState::Empty {
            self.pool.select_on(slot, None, Some(false))?;
            events.push(TransportEvent::PollOut);
        }
        Ok(())
    }

    fn on_readable(&self, p: &mut SocketPrivate, events: &mut Events) -> Result<()> {
        let slot = p.slot.ok_or(TransportError::NotConnected)?;
        let mut r: &Socket = p.sock.as_ref().ok_or(TransportError::NotConnected)?;
        let before = p.incoming.bytes_read();
        let pumped = p.incoming.pump(&mut r);
        self.metrics
            .add_bytes_received(p.incoming.bytes_read() - before);
        match pumped {
            Ok(Pump::Complete) => {
                self.metrics.inc_frames_received();
                // Stop reading until the caller has taken the frame.
                self.pool.select_on(slot, Some(false), None)?;
                events.push(TransportEvent::PollIn);
                Ok(())
            }
            Ok(Pump::WouldBlock) => Ok(()),
            Err(e) => {
                if e.is_protocol_violation() {
                    self.metrics.inc_protocol_errors();
                    error!(peer = %p.peer, error = %e, "protocol violation, disconnecting");
                } else if matches!(e, TransportError::ConnectionClosed) {
                    debug!(peer = %p.peer, "EOF from peer");
                }
                Err(e)
            }
        }
    }

    fn on_listener_event(
        &self,
        p: &mut SocketPrivate,
        ev: Readiness,
        accepted: &mut Vec<Arc<SocketTransport>>,
    ) -> Result<()> {
        if ev.errored {
            return Err(TransportError::ConnectionClosed);
        }
        if !ev.readable {
            return Ok(());
        }
        let sock = p.sock.as_ref().ok_or(TransportError::NotConnected)?;
        match sock.accept() {
            Ok((new_sock, addr)) => {
                if let Err(e) = self.configure(&new_sock, addr.as_socket().is_some()) {
                    error!(error = %e, "failed to configure accepted socket");
                    return Ok(());
                }
                let peer = PeerInfo::from_sock_addr(&addr, None);
                let local = match new_sock.local_addr() {
                    Ok(a) => PeerInfo::from_sock_addr(&a, self.config.socket.listen_path.as_ref()),
                    Err(_) => p.local.clone(),
                };
                match self.adopt(new_sock, peer, local) {
                    Ok(child) => accepted.push(child),
                    Err(e) => error!(error = %e, "failed to register accepted connection"),
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                error!(local = %p.local, error = %e, "accept failed");
                Ok(())
            }
        }
    }

    /// Wraps an accepted socket. The child is registered with no interest
    /// until its `ChildUp` has been delivered.
    fn adopt(&self, sock: Socket, peer: PeerInfo, local: PeerInfo) -> Result<Arc<SocketTransport>> {
        let fd = sock.as_raw_fd();
        let mut state = SocketPrivate::new();
        state.sock = Some(sock);
        state.state = ConnectionState::Connected;
        state.up = true;
        state.peer = peer;
        state.local = local;
        let child = Arc::new_cyclic(|me| SocketTransport {
            id: SOCKET_IDS.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            parent: Some(self.me.clone()),
            config: self.config.clone(),
            pool: self.pool.clone(),
            notify: self.notify.clone(),
            metrics: self.metrics.clone(),
            inner: Mutex::new(state),
            outbox: Outbox::default(),
            children: Mutex::new(HashMap::new()),
        });
        let slot = self.pool.register(fd, child.handler(), false, false)?;
        child.inner.lock().slot = Some(slot);
        self.children.lock().insert(child.id, child.clone());
        self.metrics.connection_opened();
        info!(peer = %child.inner.lock().peer, "accepted connection");
        Ok(child)
    }

    fn announce(&self) {
        self.outbox.push(TransportEvent::ChildUp);
        self.outbox.drain(&self.me, &*self.notify);
        let p = self.inner.lock();
        if let Some(slot) = p.slot {
            let writable = !p.ioq.is_empty();
            if let Err(e) = self.pool.select_on(slot, Some(true), Some(writable)) {
                warn!(peer = %p.peer, error = %e, "failed to enable reading");
            }
        }
    }

    /// Releases the socket and everything queued on it, queueing the events
    /// owed to the caller. No-op if already torn down.
    fn teardown(&self, cause: Option<&TransportError>) {
        {
            let mut p = self.inner.lock();
            if p.sock.is_none() {
                return;
            }
            if let Some(slot) = p.slot.take() {
                if let Err(e) = self.pool.unregister(slot) {
                    debug!(error = %e, "unregister failed");
                }
            }
            if let Some(sock) = p.sock.take() {
                if let Err(e) = sock.shutdown(Shutdown::Both) {
                    debug!(error = %e, "shutdown failed");
                }
            }
            let discarded = p.ioq.flush();
            self.metrics.add_frames_discarded(discarded as u64);
            // A complete frame was already announced; only partial ones go.
            if !p.incoming.is_complete() {
                p.incoming.reset();
            }
            p.state = ConnectionState::Disconnected;
            p.listening = false;
            let was_up = std::mem::replace(&mut p.up, false);
            if was_up {
                self.metrics.connection_closed();
            }
            match cause {
                Some(e) => info!(peer = %p.peer, error = %e, discarded, "connection torn down"),
                None => debug!(peer = %p.peer, discarded, "disconnected"),
            }
            if cause.is_some() {
                self.outbox.push(TransportEvent::PollErr);
            }
            if was_up {
                self.outbox.push(TransportEvent::ChildDown);
            }
        }
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.children.lock().remove(&self.id);
        }
    }
}

impl EventHandler for SocketTransport {
    fn handle(&self, ev: Readiness) {
        let mut accepted = Vec::new();
        let result = {
            let mut guard = self.inner.lock();
            let p = &mut *guard;
            if p.slot != Some(ev.slot) || p.sock.is_none() {
                return;
            }
            let mut events = Events::new();
            let result = if p.listening {
                self.on_listener_event(p, ev, &mut accepted)
            } else {
                self.on_connection_event(p, ev, &mut events)
            };
            self.outbox.extend(events);
            result
        };
        if let Err(e) = result {
            self.teardown(Some(&e));
        }
        for child in accepted {
            child.announce();
        }
        self.outbox.drain(&self.me, &*self.notify);
    }
}

impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn connect(&self) -> Result<()> {
        let endpoint = resolve_remote(&self.config)?;
        let mut p = self.inner.lock();
        if p.sock.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        let sock = Socket::new(endpoint.domain(), Type::STREAM, None)?;
        self.configure(&sock, endpoint.is_inet())?;
        if let Some(bind) = resolve_client_bind(&self.config)? {
            sock.bind(&bind.to_sock_addr()?).map_err(|e| {
                error!(addr = %bind, error = %e, "client bind failed");
                e
            })?;
        }
        match sock.connect(&endpoint.to_sock_addr()?) {
            Ok(()) => {}
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!(peer = %endpoint, error = %e, "connect failed");
                return Err(e.into());
            }
        }
        let slot = self
            .pool
            .register(sock.as_raw_fd(), self.handler(), true, true)?;
        p.sock = Some(sock);
        p.slot = Some(slot);
        p.state = ConnectionState::Connecting;
        p.incoming.reset();
        p.peer = PeerInfo::from_endpoint(endpoint);
        p.connect_fail_logged = false;
        p.submit_fail_logged = false;
        debug!(peer = %p.peer, "connecting");
        Ok(())
    }

    fn listen(&self) -> Result<()> {
        let endpoint = resolve_listen(&self.config)?;
        let mut p = self.inner.lock();
        if p.sock.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        let sock = Socket::new(endpoint.domain(), Type::STREAM, None)?;
        if endpoint.is_inet() {
            sock.set_reuse_address(true)?;
        }
        if self.config.non_blocking {
            sock.set_nonblocking(true)?;
        }
        sock.bind(&endpoint.to_sock_addr()?).map_err(|e| {
            error!(addr = %endpoint, error = %e, "bind failed");
            e
        })?;
        sock.listen(self.config.socket.listen_backlog)?;
        p.local = match sock.local_addr() {
            Ok(addr) => PeerInfo::from_sock_addr(&addr, self.config.socket.listen_path.as_ref()),
            Err(_) => PeerInfo::from_endpoint(endpoint),
        };
        let slot = self
            .pool
            .register(sock.as_raw_fd(), self.handler(), true, false)?;
        p.sock = Some(sock);
        p.slot = Some(slot);
        p.listening = true;
        p.state = ConnectionState::Connected;
        info!(addr = %p.local, "listening");
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.teardown(None);
        self.outbox.drain(&self.me, &*self.notify);
        Ok(())
    }

    fn submit(&self, header: Bytes, payload: Vec<Bytes>, refs: Option<BufferRef>) -> Result<()> {
        let result = {
            let mut guard = self.inner.lock();
            let p = &mut *guard;
            if p.state != ConnectionState::Connected || p.listening || p.sock.is_none() {
                if !p.submit_fail_logged {
                    p.submit_fail_logged = true;
                    error!(peer = %p.peer, state = ?p.state, "not connected, submit refused");
                }
                return Err(TransportError::NotConnected);
            }
            let entry = IoqEntry::new(header, payload, refs)?;
            let slot = p.slot.ok_or(TransportError::NotConnected)?;
            let mut w: &Socket = p.sock.as_ref().ok_or(TransportError::NotConnected)?;
            let was_empty = p.ioq.is_empty();
            match p.ioq.submit(entry, &mut w) {
                Ok(progress) => {
                    self.metrics.add_bytes_sent(progress.written as u64);
                    if progress.state == QueueState::Pending {
                        self.metrics.inc_writes_queued();
                        if was_empty {
                            self.pool.select_on(slot, None, Some(true))?;
                        }
                    } else {
                        self.metrics.add_frames_sent(1);
                    }
                    Ok(())
                }
                Err(e) => {
                    error!(peer = %p.peer, error = %e, "writev failed");
                    Err(TransportError::from(e))
                }
            }
        };
        if let Err(e @ TransportError::Io(_)) = &result {
            self.teardown(Some(e));
            self.outbox.drain(&self.me, &*self.notify);
        }
        result
    }

    fn receive(&self) -> Result<Option<ReceivedFrame>> {
        let mut p = self.inner.lock();
        match p.incoming.take() {
            Some(frame) => {
                if let Some(slot) = p.slot {
                    self.pool.select_on(slot, Some(true), None)?;
                }
                Ok(Some(frame))
            }
            None if p.state == ConnectionState::Disconnected => Err(TransportError::NotConnected),
            None => Ok(None),
        }
    }

    fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    fn is_listener(&self) -> bool {
        self.inner.lock().listening
    }

    fn peer_info(&self) -> PeerInfo {
        self.inner.lock().peer.clone()
    }

    fn local_info(&self) -> PeerInfo {
        self.inner.lock().local.clone()
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        let slot = self.inner.get_mut().slot.take();
        if let Some(slot) = slot {
            let _ = self.pool.unregister(slot);
        }
    }
}
