//! RDMA transport.
//!
//! A TCP control connection carries the queue-pair handshake. Once the
//! handshake is done frames travel as single RDMA sends, each holding the
//! 12-byte frame header, the header blob and the payload, and the control
//! connection is only watched for the peer going away.
//!
//! Sends are credit limited: a connection may have `send_count` sends in
//! flight, and frames submitted beyond that wait in the outbound queue until
//! a send completion returns a credit.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
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
use crate::ioq::{BufferRef, IoqEntry, OutboundQueue};
use crate::metrics::TransportMetrics;
use crate::name::{resolve_client_bind, resolve_listen, resolve_remote, PeerInfo};
use crate::protocol::{decode_frame, ReceivedFrame};
use crate::rdma_device::{QpOwner, RdmaDevice};
use crate::rdma_handshake::{negotiate, Handshake, HandshakeData};
use crate::rdma_sim::{CompletionStatus, QueuePair, RtrAttrs, RtsAttrs};
use crate::transport::{
    ConnectionState, Notify, Outbox, Transport, TransportContext, TransportEvent,
};

static RDMA_IDS: AtomicU64 = AtomicU64::new(1);

const PSN_MASK: u32 = 0x00ff_ffff;
const QP_TIMEOUT: u8 = 14;
const QP_RETRY_CNT: u8 = 7;
const QP_RNR_RETRY: u8 = 7;

type Events = Vec<TransportEvent>;

struct Peer {
    qp: Arc<QueuePair>,
    local: HandshakeData,
    send_size: usize,
    recv_size: usize,
    /// Sends that may be posted before a completion returns a credit.
    quota: usize,
    ioq: OutboundQueue,
}

struct RdmaPrivate {
    sock: Option<Socket>,
    slot: Option<SlotId>,
    state: ConnectionState,
    listening: bool,
    /// `ChildUp` has been reported and `ChildDown` is still owed.
    up: bool,
    handshake: Option<Handshake>,
    peer: Option<Peer>,
    received: VecDeque<ReceivedFrame>,
    local: PeerInfo,
    remote: PeerInfo,
    connect_fail_logged: bool,
    submit_fail_logged: bool,
}

impl RdmaPrivate {
    fn new() -> Self {
        Self {
            sock: None,
            slot: None,
            state: ConnectionState::Disconnected,
            listening: false,
            up: false,
            handshake: None,
            peer: None,
            received: VecDeque::new(),
            local: PeerInfo::default(),
            remote: PeerInfo::default(),
            connect_fail_logged: false,
            submit_fail_logged: false,
        }
    }
}

/// RDMA transport endpoint.
pub struct RdmaTransport {
    id: u64,
    me: Weak<RdmaTransport>,
    parent: Option<Weak<RdmaTransport>>,
    config: Arc<TransportConfig>,
    pool: Arc<EventPool>,
    device: Arc<RdmaDevice>,
    notify: Arc<dyn Notify>,
    metrics: Arc<TransportMetrics>,
    inner: Mutex<RdmaPrivate>,
    outbox: Outbox,
    children: Mutex<HashMap<u64, Arc<RdmaTransport>>>,
}

impl std::fmt::Debug for RdmaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let p = self.inner.lock();
        f.debug_struct("RdmaTransport")
            .field("id", &self.id)
            .field("device", &self.device.name())
            .field("state", &p.state)
            .field("listening", &p.listening)
            .field("peer", &p.remote.identifier)
            .finish()
    }
}

impl RdmaTransport {
    /// Creates a disconnected RDMA transport on the configured device,
    /// opening the device on first use.
    pub fn new(
        ctx: &TransportContext,
        config: TransportConfig,
        notify: Arc<dyn Notify>,
    ) -> Result<Arc<Self>> {
        let device = ctx.rdma().get_device(
            config.rdma.device_name.as_deref(),
            config.rdma.port,
            &config.rdma,
        )?;
        Ok(Arc::new_cyclic(|me| Self {
            id: RDMA_IDS.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            parent: None,
            config: Arc::new(config),
            pool: ctx.pool().clone(),
            device,
            notify,
            metrics: ctx.metrics().clone(),
            inner: Mutex::new(RdmaPrivate::new()),
            outbox: Outbox::default(),
            children: Mutex::new(HashMap::new()),
        }))
    }

    /// Device port this transport sends on.
    pub fn device(&self) -> &Arc<RdmaDevice> {
        &self.device
    }

    /// Accepted connections still owned by this listener.
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Send credits left, once a queue pair exists.
    pub fn credits(&self) -> Option<usize> {
        self.inner.lock().peer.as_ref().map(|peer| peer.quota)
    }

    /// Frames waiting for a send credit.
    pub fn queued_frames(&self) -> usize {
        self.inner
            .lock()
            .peer
            .as_ref()
            .map_or(0, |peer| peer.ioq.len())
    }

    /// Negotiated `(send, recv)` block sizes, once the peer's data arrived.
    pub fn block_sizes(&self) -> Option<(usize, usize)> {
        let p = self.inner.lock();
        match (&p.handshake, &p.peer) {
            (None, Some(peer)) => Some((peer.send_size, peer.recv_size)),
            _ => None,
        }
    }

    fn handler(&self) -> Weak<dyn EventHandler> {
        let weak: Weak<dyn EventHandler> = self.me.clone();
        weak
    }

    fn configure(&self, sock: &Socket, inet: bool) -> Result<()> {
        if inet && self.config.socket.nodelay {
            if let Err(e) = sock.set_nodelay(true) {
                warn!(error = %e, "failed to set TCP_NODELAY");
            }
        }
        sock.set_nonblocking(true)?;
        Ok(())
    }

    /// Creates the queue pair and queues the local handshake data.
    fn start_handshake(&self, p: &mut RdmaPrivate) -> Result<()> {
        let qp = self.device.create_qp()?;
        let owner: Weak<dyn QpOwner> = self.me.clone();
        self.device.register(qp.qp_num(), owner);
        let send_size = self.config.rdma.send_size.min(self.device.max_send());
        let recv_size = self.config.rdma.recv_size.min(self.device.max_recv());
        let local = HandshakeData {
            recv_blksize: u32::try_from(recv_size).unwrap_or(u32::MAX),
            send_blksize: u32::try_from(send_size).unwrap_or(u32::MAX),
            lid: qp.lid(),
            qpn: qp.qp_num(),
            psn: rand::random::<u32>() & PSN_MASK,
        };
        debug!(
            peer = %p.remote,
            qpn = local.qpn,
            lid = local.lid,
            psn = local.psn,
            "starting handshake"
        );
        p.handshake = Some(Handshake::new(&local));
        p.peer = Some(Peer {
            qp,
            local,
            send_size,
            recv_size,
            quota: 0,
            ioq: OutboundQueue::new(),
        });
        Ok(())
    }

    /// Moves the queue pair to RTS against the peer's data.
    fn connect_qp(&self, peer: &mut Peer, remote: &HandshakeData) -> Result<()> {
        let (send, recv) = negotiate(peer.local.send_blksize, peer.local.recv_blksize, remote);
        peer.send_size = send as usize;
        peer.recv_size = recv as usize;
        peer.qp.modify_to_rtr(RtrAttrs {
            remote_qpn: remote.qpn,
            remote_lid: remote.lid,
            rq_psn: remote.psn,
            path_mtu: self.config.rdma.mtu,
        })?;
        peer.qp.modify_to_rts(RtsAttrs {
            sq_psn: peer.local.psn,
            timeout: QP_TIMEOUT,
            retry_cnt: QP_RETRY_CNT,
            rnr_retry: QP_RNR_RETRY,
        })?;
        debug!(
            qpn = peer.qp.qp_num(),
            remote_qpn = remote.qpn,
            send_size = peer.send_size,
            recv_size = peer.recv_size,
            "queue pair connected"
        );
        Ok(())
    }

    fn establish(&self, p: &mut RdmaPrivate, events: &mut Events) -> Result<()> {
        p.handshake = None;
        p.state = ConnectionState::Connected;
        p.up = true;
        if let Some(peer) = p.peer.as_mut() {
            peer.quota = self.config.rdma.send_count;
        }
        self.metrics.connection_opened();
        info!(peer = %p.remote, device = self.device.name(), "RDMA connection up");
        if let Some(slot) = p.slot {
            self.pool.select_on(slot, Some(true), Some(false))?;
        }
        events.push(TransportEvent::ChildUp);
        // Frames that arrived before the handshake finished.
        events.extend(std::iter::repeat(TransportEvent::PollIn).take(p.received.len()));
        Ok(())
    }

    fn on_control_event(
        &self,
        p: &mut RdmaPrivate,
        ev: Readiness,
        events: &mut Events,
    ) -> Result<()> {
        let sock = p.sock.as_ref().ok_or(TransportError::NotConnected)?;
        if ev.errored {
            return Err(match sock.take_error() {
                Ok(Some(e)) => e.into(),
                _ => TransportError::ConnectionClosed,
            });
        }
        if p.state == ConnectionState::Connecting && p.handshake.is_none() {
            if let Some(err) = sock.take_error()? {
                if !p.connect_fail_logged {
                    p.connect_fail_logged = true;
                    error!(peer = %p.remote, error = %err, "control connection failed");
                }
                return Err(err.into());
            }
            if let Ok(addr) = sock.local_addr() {
                p.local = PeerInfo::from_sock_addr(&addr, None);
            }
            self.start_handshake(p)?;
        }
        if p.handshake.is_some() {
            return self.drive_handshake(p, ev, events);
        }
        if ev.readable {
            let mut r: &Socket = p.sock.as_ref().ok_or(TransportError::NotConnected)?;
            let mut byte = [0u8; 1];
            return match r.read(&mut byte) {
                Ok(0) => {
                    debug!(peer = %p.remote, "control connection closed by peer");
                    Err(TransportError::ConnectionClosed)
                }
                Ok(_) => Err(TransportError::Handshake {
                    reason: "unexpected data on control connection".to_string(),
                }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        Ok(())
    }

    fn drive_handshake(
        &self,
        p: &mut RdmaPrivate,
        ev: Readiness,
        events: &mut Events,
    ) -> Result<()> {
        let slot = p.slot.ok_or(TransportError::NotConnected)?;
        let (complete, wants_write) = {
            let mut sock: &Socket = p.sock.as_ref().ok_or(TransportError::NotConnected)?;
            let hs = p.handshake.as_mut().ok_or(TransportError::NotConnected)?;
            if hs.wants_write() {
                hs.on_writable(&mut sock)?;
            }
            if ev.readable {
                if let Some(remote) = hs.on_readable(&mut sock)? {
                    let peer = p.peer.as_mut().ok_or(TransportError::NotConnected)?;
                    self.connect_qp(peer, &remote)?;
                    hs.qp_ready();
                    hs.on_writable(&mut sock)?;
                    // The peer's acknowledgement may already be buffered.
                    hs.on_readable(&mut sock)?;
                }
            }
            (hs.is_complete(), hs.wants_write())
        };
        if complete {
            self.establish(p, events)
        } else {
            self.pool.select_on(slot, Some(true), Some(wants_write))
        }
    }

    fn on_listener_event(&self, p: &mut RdmaPrivate, ev: Readiness) -> Result<()> {
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
                let remote = PeerInfo::from_sock_addr(&addr, None);
                let local = match new_sock.local_addr() {
                    Ok(a) => PeerInfo::from_sock_addr(&a, self.config.socket.listen_path.as_ref()),
                    Err(_) => p.local.clone(),
                };
                if let Err(e) = self.adopt(new_sock, remote, local) {
                    error!(error = %e, "failed to set up accepted RDMA connection");
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

    /// Wraps an accepted control connection and starts its handshake. The
    /// child reports `ChildUp` itself once the handshake completes.
    fn adopt(&self, sock: Socket, remote: PeerInfo, local: PeerInfo) -> Result<()> {
        let fd = sock.as_raw_fd();
        let mut state = RdmaPrivate::new();
        state.sock = Some(sock);
        state.state = ConnectionState::Connecting;
        state.remote = remote;
        state.local = local;
        let child = Arc::new_cyclic(|me| RdmaTransport {
            id: RDMA_IDS.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            parent: Some(self.me.clone()),
            config: self.config.clone(),
            pool: self.pool.clone(),
            device: self.device.clone(),
            notify: self.notify.clone(),
            metrics: self.metrics.clone(),
            inner: Mutex::new(state),
            outbox: Outbox::default(),
            children: Mutex::new(HashMap::new()),
        });
        {
            let mut p = child.inner.lock();
            child.start_handshake(&mut p)?;
        }
        let slot = self.pool.register(fd, child.handler(), true, true)?;
        child.inner.lock().slot = Some(slot);
        info!(peer = %child.inner.lock().remote, "accepted RDMA control connection");
        self.children.lock().insert(child.id, child);
        Ok(())
    }

    fn post(&self, peer: &Peer, entry: &IoqEntry) -> Result<()> {
        let data = entry.to_bytes();
        self.device.post_send(&peer.qp, &data)?;
        self.metrics.add_bytes_sent(data.len() as u64);
        self.metrics.add_frames_sent(1);
        Ok(())
    }

    /// Releases the control socket, the queue pair and everything queued,
    /// queueing the events owed to the caller. No-op if already torn down.
    fn teardown(&self, cause: Option<&TransportError>) {
        {
            let mut p = self.inner.lock();
            if p.sock.is_none() && p.peer.is_none() {
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
            let mut discarded = 0;
            if let Some(mut peer) = p.peer.take() {
                self.device.unregister(peer.qp.qp_num());
                peer.qp.destroy();
                discarded = peer.ioq.flush();
            }
            self.metrics.add_frames_discarded(discarded as u64);
            // Frames already announced with PollIn stay readable.
            p.handshake = None;
            p.state = ConnectionState::Disconnected;
            p.listening = false;
            let was_up = std::mem::replace(&mut p.up, false);
            if was_up {
                self.metrics.connection_closed();
            }
            match cause {
                Some(e) => {
                    info!(peer = %p.remote, error = %e, discarded, "RDMA connection torn down")
                }
                None => debug!(peer = %p.remote, discarded, "disconnected"),
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

impl EventHandler for RdmaTransport {
    fn handle(&self, ev: Readiness) {
        let result = {
            let mut guard = self.inner.lock();
            let p = &mut *guard;
            if p.slot != Some(ev.slot) || p.sock.is_none() {
                return;
            }
            let mut events = Events::new();
            let result = if p.listening {
                self.on_listener_event(p, ev)
            } else {
                self.on_control_event(p, ev, &mut events)
            };
            self.outbox.extend(events);
            result
        };
        if let Err(e) = result {
            self.teardown(Some(&e));
        }
        self.outbox.drain(&self.me, &*self.notify);
    }
}

impl QpOwner for RdmaTransport {
    fn on_send_complete(&self) {
        let result = {
            let mut p = self.inner.lock();
            let Some(peer) = p.peer.as_mut() else {
                return;
            };
            peer.quota += 1;
            let backlogged = !peer.ioq.is_empty();
            let mut result = Ok(());
            while peer.quota > 0 {
                let Some(entry) = peer.ioq.pop_front() else {
                    break;
                };
                if let Err(e) = self.post(peer, &entry) {
                    result = Err(e);
                    break;
                }
                peer.quota -= 1;
            }
            if result.is_ok() && backlogged && peer.ioq.is_empty() {
                self.outbox.push(TransportEvent::PollOut);
            }
            result
        };
        if let Err(e) = result {
            self.teardown(Some(&e));
        }
        self.outbox.drain(&self.me, &*self.notify);
    }

    fn on_recv_complete(&self, data: Vec<u8>) {
        let result = {
            let mut p = self.inner.lock();
            if p.peer.is_none() {
                return;
            }
            match decode_frame(&data) {
                Ok((frame, used)) => {
                    if used != data.len() {
                        let len = data.len();
                        warn!(peer = %p.remote, used, len, "trailing bytes after frame");
                    }
                    self.metrics.add_bytes_received(data.len() as u64);
                    self.metrics.inc_frames_received();
                    p.received.push_back(frame);
                    if p.up {
                        self.outbox.push(TransportEvent::PollIn);
                    }
                    Ok(())
                }
                Err(e) => {
                    self.metrics.inc_protocol_errors();
                    error!(peer = %p.remote, error = %e, "protocol violation, disconnecting");
                    Err(e)
                }
            }
        };
        if let Err(e) = result {
            self.teardown(Some(&e));
        }
        self.outbox.drain(&self.me, &*self.notify);
    }

    fn on_qp_error(&self, status: CompletionStatus) {
        let e = TransportError::Rdma {
            reason: format!("work request failed: {status:?}"),
        };
        self.teardown(Some(&e));
        self.outbox.drain(&self.me, &*self.notify);
    }
}

impl Transport for RdmaTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Rdma
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
            sock.bind(&bind.to_sock_addr()?)?;
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
        p.received.clear();
        p.remote = PeerInfo::from_endpoint(endpoint);
        p.connect_fail_logged = false;
        p.submit_fail_logged = false;
        debug!(peer = %p.remote, device = self.device.name(), "connecting");
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
        sock.set_nonblocking(true)?;
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
        info!(addr = %p.local, device = self.device.name(), "RDMA listening");
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
            let ready = p.state == ConnectionState::Connected && !p.listening;
            let Some(peer) = p.peer.as_mut().filter(|_| ready) else {
                if !p.submit_fail_logged {
                    p.submit_fail_logged = true;
                    error!(peer = %p.remote, state = ?p.state, "not connected, submit refused");
                }
                return Err(TransportError::NotConnected);
            };
            let entry = IoqEntry::new(header, payload, refs)?;
            if entry.len() > peer.send_size {
                return Err(TransportError::FrameTooLarge {
                    size: entry.len(),
                    max_size: peer.send_size,
                });
            }
            if peer.quota > 0 && peer.ioq.is_empty() {
                self.post(peer, &entry).map(|()| peer.quota -= 1)
            } else {
                peer.ioq.push_back(entry);
                self.metrics.inc_writes_queued();
                self.metrics.inc_credit_stalls();
                Ok(())
            }
        };
        if let Err(e) = &result {
            error!(error = %e, "RDMA post failed");
            self.teardown(Some(e));
            self.outbox.drain(&self.me, &*self.notify);
        }
        result
    }

    fn receive(&self) -> Result<Option<ReceivedFrame>> {
        let mut p = self.inner.lock();
        match p.received.pop_front() {
            Some(frame) => Ok(Some(frame)),
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
        self.inner.lock().remote.clone()
    }

    fn local_info(&self) -> PeerInfo {
        self.inner.lock().local.clone()
    }
}

impl Drop for RdmaTransport {
    fn drop(&mut self) {
        let p = self.inner.get_mut();
        if let Some(slot) = p.slot.take() {
            let _ = self.pool.unregister(slot);
        }
        if let Some(peer) = p.peer.take() {
            self.device.unregister(peer.qp.qp_num());
            peer.qp.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RdmaOptions;
    use crate::event::EventPoolConfig;
    use crate::transport::Notification;
    use crossbeam_channel::{unbounded, Receiver};

    fn setup() -> (TransportContext, Arc<dyn Notify>, Receiver<Notification>) {
        let pool = Arc::new(EventPool::new(EventPoolConfig::default()).unwrap());
        pool.start().unwrap();
        let (tx, rx) = unbounded();
        (TransportContext::new(pool), Arc::new(tx), rx)
    }

    fn rdma_config() -> TransportConfig {
        TransportConfig {
            kind: TransportKind::Rdma,
            rdma: RdmaOptions {
                send_count: 2,
                recv_count: 4,
                send_size: 4096,
                recv_size: 4096,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_submit_before_connect_fails() {
        let (ctx, notify, _rx) = setup();
        let t = RdmaTransport::new(&ctx, rdma_config(), notify).unwrap();
        assert!(matches!(
            t.submit(Bytes::from_static(b"PING"), Vec::new(), None),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(t.receive(), Err(TransportError::NotConnected)));
        assert_eq!(t.credits(), None);
        assert_eq!(t.block_sizes(), None);
    }

    #[test]
    fn test_unknown_device() {
        let (ctx, notify, _rx) = setup();
        let mut cfg = rdma_config();
        cfg.rdma.device_name = Some("mlx5_9".into());
        assert!(matches!(
            RdmaTransport::new(&ctx, cfg, notify),
            Err(TransportError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_listen_and_disconnect() {
        let (ctx, notify, rx) = setup();
        let mut cfg = rdma_config();
        cfg.socket.bind_address = Some("127.0.0.1".into());
        cfg.socket.listen_port = Some(0);
        let t = RdmaTransport::new(&ctx, cfg, notify).unwrap();
        t.listen().unwrap();
        assert!(t.is_listener());
        assert_eq!(t.state(), ConnectionState::Connected);
        assert_eq!(t.device().name(), "sim0");
        t.disconnect().unwrap();
        t.disconnect().unwrap();
        assert!(!t.is_listener());
        assert_eq!(ctx.pool().registered(), 0);
        assert!(rx.try_recv().is_err());
    }
}
