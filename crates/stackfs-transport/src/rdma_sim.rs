#![allow(missing_docs)]

//! Software verbs provider.
//!
//! Models the subset of InfiniBand verbs the RDMA transport needs: protection
//! domains, registered memory, completion queues, a shared receive queue and
//! reliable-connected queue pairs with the RESET, INIT, RTR, RTS state walk.
//! Devices and the queue pairs created on them live in one [`Fabric`], which
//! routes sends by destination QP number.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::PathMtu;
use crate::error::{Result, TransportError};

static MR_COUNTER: AtomicU32 = AtomicU32::new(1);
static QP_COUNTER: AtomicU32 = AtomicU32::new(1);
static CQ_COUNTER: AtomicU64 = AtomicU64::new(1);
static PD_COUNTER: AtomicU64 = AtomicU64::new(1);

const QPN_MASK: u32 = 0x00ff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const LOCAL_READ: Self = Self(1);
    pub const LOCAL_WRITE: Self = Self(2);
    pub const REMOTE_READ: Self = Self(4);
    pub const REMOTE_WRITE: Self = Self(8);
    pub const ALL: Self = Self(0xF);

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn empty() -> Self {
        Self(0)
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QpState {
    #[default]
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrOpcode {
    Send,
    Recv,
}

/// Outcome of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompletionStatus {
    #[default]
    Success,
    /// Incoming message larger than the posted receive buffer.
    LocalLengthError,
    /// Receiver rejected the message.
    RemoteOperationError,
    /// Destination queue pair unreachable.
    RetryExceeded,
    /// Request flushed because its queue pair went to the error state.
    Flushed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEntry {
    pub wr_id: u64,
    pub status: CompletionStatus,
    pub opcode: WrOpcode,
    pub byte_len: u32,
    pub qp_num: u32,
}

impl CompletionEntry {
    fn new(
        wr_id: u64,
        status: CompletionStatus,
        opcode: WrOpcode,
        byte_len: u32,
        qp_num: u32,
    ) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len,
            qp_num,
        }
    }
}

/// Registered memory.
#[derive(Debug)]
pub struct MemoryRegion {
    pub lkey: u32,
    buffer: Mutex<Vec<u8>>,
    pub access_flags: AccessFlags,
    pub length: usize,
}

impl MemoryRegion {
    fn new(length: usize, access_flags: AccessFlags) -> Self {
        Self {
            lkey: MR_COUNTER.fetch_add(1, Ordering::Relaxed) | 0x4000_0000,
            buffer: Mutex::new(vec![0u8; length]),
            access_flags,
            length,
        }
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        if !self.access_flags.contains(AccessFlags::LOCAL_READ) {
            return None;
        }
        let buf = self.buffer.lock();
        let end = offset.checked_add(len)?;
        buf.get(offset..end).map(<[u8]>::to_vec)
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        if !self.access_flags.contains(AccessFlags::LOCAL_WRITE) {
            return false;
        }
        let mut buf = self.buffer.lock();
        let Some(end) = offset.checked_add(data.len()) else {
            return false;
        };
        match buf.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionDomain {
    pub id: u64,
    pub device: String,
}

impl ProtectionDomain {
    pub fn new(device: &str) -> Self {
        Self {
            id: PD_COUNTER.fetch_add(1, Ordering::Relaxed),
            device: device.to_string(),
        }
    }

    /// Registers a zeroed buffer of `length` bytes.
    pub fn reg_mr(&self, length: usize, access_flags: AccessFlags) -> Arc<MemoryRegion> {
        Arc::new(MemoryRegion::new(length, access_flags))
    }
}

/// Completion queue with a blocking wait.
pub struct CompletionQueue {
    pub id: u64,
    entries: Mutex<VecDeque<CompletionEntry>>,
    ready: Condvar,
    shut_down: AtomicBool,
    pub capacity: usize,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("id", &self.id)
            .field("depth", &self.entries.lock().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl CompletionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            id: CQ_COUNTER.fetch_add(1, Ordering::Relaxed),
            entries: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            shut_down: AtomicBool::new(false),
            capacity,
        }
    }

    /// Queues a completion. Returns false on overrun.
    pub fn push(&self, entry: CompletionEntry) -> bool {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return false;
        }
        entries.push_back(entry);
        self.ready.notify_one();
        true
    }

    pub fn poll(&self) -> Option<CompletionEntry> {
        self.entries.lock().pop_front()
    }

    /// Waits up to `timeout` for a completion. Returns `None` on timeout or
    /// once the queue has been shut down and drained.
    pub fn wait(&self, timeout: Duration) -> Option<CompletionEntry> {
        let mut entries = self.entries.lock();
        if entries.is_empty() && !self.is_shut_down() {
            self.ready.wait_for(&mut entries, timeout);
        }
        entries.pop_front()
    }

    /// Wakes all waiters; subsequent waits return immediately.
    pub fn shutdown(&self) {
        let _entries = self.entries.lock();
        self.shut_down.store(true, Ordering::Release);
        self.ready.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

struct RecvRequest {
    wr_id: u64,
    mr: Arc<MemoryRegion>,
}

struct PendingSend {
    wr_id: u64,
    data: Vec<u8>,
    src_qp: u32,
    src_cq: Arc<CompletionQueue>,
    dest_qp: u32,
}

#[derive(Default)]
struct SrqState {
    recvs: VecDeque<RecvRequest>,
    /// Sends that arrived while no receive was posted.
    backlog: VecDeque<PendingSend>,
}

/// Receive buffers shared by every queue pair of a device.
pub struct SharedReceiveQueue {
    state: Mutex<SrqState>,
    recv_cq: Arc<CompletionQueue>,
    fabric: Weak<Fabric>,
}

impl SharedReceiveQueue {
    pub fn new(fabric: &Arc<Fabric>, recv_cq: Arc<CompletionQueue>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SrqState::default()),
            recv_cq,
            fabric: Arc::downgrade(fabric),
        })
    }

    /// Posts a receive buffer. A send waiting for a buffer lands in it
    /// immediately.
    pub fn post_recv(&self, wr_id: u64, mr: Arc<MemoryRegion>) {
        let recv = RecvRequest { wr_id, mr };
        let mut state = self.state.lock();
        loop {
            let Some(send) = state.backlog.pop_front() else {
                break;
            };
            if self.dest_alive(send.dest_qp) {
                drop(state);
                self.land(recv, send);
                return;
            }
            fail_send(&self.fabric, send, CompletionStatus::RetryExceeded);
        }
        state.recvs.push_back(recv);
    }

    pub fn posted(&self) -> usize {
        self.state.lock().recvs.len()
    }

    fn accept(&self, send: PendingSend) {
        let mut state = self.state.lock();
        let recv = state.recvs.pop_front();
        match recv {
            Some(recv) => {
                drop(state);
                self.land(recv, send);
            }
            None => {
                trace!(dest_qp = send.dest_qp, "no receive posted, send backlogged");
                state.backlog.push_back(send);
            }
        }
    }

    fn dest_alive(&self, qp_num: u32) -> bool {
        self.fabric
            .upgrade()
            .and_then(|f| f.lookup(qp_num))
            .is_some_and(|qp| qp.accepts_sends())
    }

    fn land(&self, recv: RecvRequest, send: PendingSend) {
        let len = send.data.len() as u32;
        if send.data.len() > recv.mr.length || !recv.mr.write_at(0, &send.data) {
            complete(
                &self.fabric,
                &self.recv_cq,
                CompletionEntry::new(
                    recv.wr_id,
                    CompletionStatus::LocalLengthError,
                    WrOpcode::Recv,
                    0,
                    send.dest_qp,
                ),
            );
            fail_send(&self.fabric, send, CompletionStatus::RemoteOperationError);
            return;
        }
        complete(
            &self.fabric,
            &self.recv_cq,
            CompletionEntry::new(
                recv.wr_id,
                CompletionStatus::Success,
                WrOpcode::Recv,
                len,
                send.dest_qp,
            ),
        );
        complete(
            &self.fabric,
            &send.src_cq,
            CompletionEntry::new(
                send.wr_id,
                CompletionStatus::Success,
                WrOpcode::Send,
                len,
                send.src_qp,
            ),
        );
    }
}

fn fail_send(fabric: &Weak<Fabric>, send: PendingSend, status: CompletionStatus) {
    complete(
        fabric,
        &send.src_cq,
        CompletionEntry::new(send.wr_id, status, WrOpcode::Send, 0, send.src_qp),
    );
}

/// Queues `entry` on `cq`. An overrun moves the entry's queue pair to the
/// error state.
fn complete(fabric: &Weak<Fabric>, cq: &CompletionQueue, entry: CompletionEntry) {
    let (qp_num, wr_id) = (entry.qp_num, entry.wr_id);
    if cq.push(entry) {
        return;
    }
    warn!(cq = cq.id, qp_num, wr_id, "completion queue overrun");
    if let Some(qp) = fabric.upgrade().and_then(|f| f.lookup(qp_num)) {
        qp.inner.lock().state = QpState::Error;
    }
}

/// Attributes for the INIT to RTR transition.
#[derive(Debug, Clone, Copy)]
pub struct RtrAttrs {
    pub remote_qpn: u32,
    pub remote_lid: u16,
    pub rq_psn: u32,
    pub path_mtu: PathMtu,
}

/// Attributes for the RTR to RTS transition.
#[derive(Debug, Clone, Copy)]
pub struct RtsAttrs {
    pub sq_psn: u32,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
}

#[derive(Debug, Default)]
struct QpInner {
    state: QpState,
    port: u8,
    remote_qpn: Option<u32>,
    rq_psn: u32,
    sq_psn: u32,
}

/// Reliable-connected queue pair.
pub struct QueuePair {
    qp_num: u32,
    lid: u16,
    inner: Mutex<QpInner>,
    send_cq: Arc<CompletionQueue>,
    srq: Arc<SharedReceiveQueue>,
    fabric: Weak<Fabric>,
}

impl std::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_num", &self.qp_num)
            .field("lid", &self.lid)
            .field("state", &self.state())
            .finish()
    }
}

impl QueuePair {
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    pub fn lid(&self) -> u16 {
        self.lid
    }

    pub fn state(&self) -> QpState {
        self.inner.lock().state
    }

    /// Whether incoming sends can land, that is RTR or RTS.
    pub fn accepts_sends(&self) -> bool {
        matches!(self.state(), QpState::ReadyToReceive | QpState::ReadyToSend)
    }

    pub fn modify_to_init(&self, port: u8) -> Result<()> {
        let mut qp = self.inner.lock();
        if qp.state != QpState::Reset {
            return Err(bad_transition(qp.state, QpState::Init));
        }
        qp.port = port;
        qp.state = QpState::Init;
        Ok(())
    }

    pub fn modify_to_rtr(&self, attrs: RtrAttrs) -> Result<()> {
        let mut qp = self.inner.lock();
        if qp.state != QpState::Init {
            return Err(bad_transition(qp.state, QpState::ReadyToReceive));
        }
        let fabric = self.fabric.upgrade().ok_or_else(|| TransportError::Rdma {
            reason: "fabric gone".to_string(),
        })?;
        let remote = fabric
            .lookup(attrs.remote_qpn)
            .ok_or_else(|| TransportError::Rdma {
                reason: format!("no queue pair {:#08x}", attrs.remote_qpn),
            })?;
        if remote.lid != attrs.remote_lid {
            return Err(TransportError::Rdma {
                reason: format!("no path to lid {:#06x}", attrs.remote_lid),
            });
        }
        debug!(
            qp_num = self.qp_num,
            remote_qpn = attrs.remote_qpn,
            mtu = attrs.path_mtu.bytes(),
            "queue pair ready to receive"
        );
        qp.remote_qpn = Some(attrs.remote_qpn);
        qp.rq_psn = attrs.rq_psn;
        qp.state = QpState::ReadyToReceive;
        Ok(())
    }

    pub fn modify_to_rts(&self, attrs: RtsAttrs) -> Result<()> {
        let mut qp = self.inner.lock();
        if qp.state != QpState::ReadyToReceive {
            return Err(bad_transition(qp.state, QpState::ReadyToSend));
        }
        trace!(
            qp_num = self.qp_num,
            timeout = attrs.timeout,
            retry_cnt = attrs.retry_cnt,
            rnr_retry = attrs.rnr_retry,
            "queue pair ready to send"
        );
        qp.sq_psn = attrs.sq_psn;
        qp.state = QpState::ReadyToSend;
        Ok(())
    }

    /// Sends `len` bytes from `mr`. Completion is reported on the send CQ
    /// once the message has landed in a receive buffer at the destination.
    pub fn post_send(&self, wr_id: u64, mr: &MemoryRegion, len: usize) -> Result<()> {
        let remote_qpn = {
            let mut qp = self.inner.lock();
            if qp.state != QpState::ReadyToSend {
                return Err(TransportError::Rdma {
                    reason: format!("post_send in state {:?}", qp.state),
                });
            }
            qp.sq_psn = (qp.sq_psn + 1) & QPN_MASK;
            qp.remote_qpn.ok_or(TransportError::NotConnected)?
        };
        let data = mr.read_at(0, len).ok_or_else(|| TransportError::Rdma {
            reason: format!("post_send of {len} bytes from {}-byte region", mr.length),
        })?;
        let send = PendingSend {
            wr_id,
            data,
            src_qp: self.qp_num,
            src_cq: self.send_cq.clone(),
            dest_qp: remote_qpn,
        };
        match self.fabric.upgrade().and_then(|f| f.lookup(remote_qpn)) {
            Some(dest) if dest.accepts_sends() => dest.srq.accept(send),
            _ => fail_send(&self.fabric, send, CompletionStatus::RetryExceeded),
        }
        Ok(())
    }

    /// Moves the queue pair to the error state and removes it from the
    /// fabric. Sends in flight towards it fail with `RetryExceeded`.
    pub fn destroy(&self) {
        self.inner.lock().state = QpState::Error;
        if let Some(fabric) = self.fabric.upgrade() {
            fabric.qps.write().remove(&self.qp_num);
        }
    }
}

fn bad_transition(from: QpState, to: QpState) -> TransportError {
    TransportError::Rdma {
        reason: format!("invalid queue pair transition {from:?} -> {to:?}"),
    }
}

/// A device on the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttr {
    pub name: String,
    pub ports: u8,
    pub lid_base: u16,
}

impl DeviceAttr {
    pub fn new(name: &str, ports: u8, lid_base: u16) -> Self {
        Self {
            name: name.to_string(),
            ports,
            lid_base,
        }
    }

    /// LID of `port`, or `None` if the device has no such port.
    pub fn lid(&self, port: u8) -> Option<u16> {
        (port >= 1 && port <= self.ports).then(|| self.lid_base + u16::from(port))
    }
}

/// Devices plus a routing table of live queue pairs.
pub struct Fabric {
    devices: Vec<DeviceAttr>,
    qps: RwLock<HashMap<u32, Weak<QueuePair>>>,
}

impl Default for Fabric {
    /// One two-port device named `sim0`.
    fn default() -> Self {
        Self::new(vec![DeviceAttr::new("sim0", 2, 0x10)])
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("devices", &self.devices)
            .field("queue_pairs", &self.qps.read().len())
            .finish()
    }
}

impl Fabric {
    pub fn new(devices: Vec<DeviceAttr>) -> Self {
        Self {
            devices,
            qps: RwLock::new(HashMap::new()),
        }
    }

    /// Named device, or the first one when `name` is `None`.
    pub fn device(&self, name: Option<&str>) -> Option<&DeviceAttr> {
        match name {
            Some(name) => self.devices.iter().find(|d| d.name == name),
            None => self.devices.first(),
        }
    }

    pub fn lookup(&self, qp_num: u32) -> Option<Arc<QueuePair>> {
        self.qps.read().get(&qp_num).and_then(Weak::upgrade)
    }

    /// Creates a queue pair in the RESET state on `device`/`port`.
    pub fn create_qp(
        self: &Arc<Self>,
        device: &DeviceAttr,
        port: u8,
        send_cq: Arc<CompletionQueue>,
        srq: Arc<SharedReceiveQueue>,
    ) -> Result<Arc<QueuePair>> {
        let lid = device.lid(port).ok_or_else(|| TransportError::Rdma {
            reason: format!("device {} has no port {port}", device.name),
        })?;
        let mut qps = self.qps.write();
        qps.retain(|_, qp| qp.strong_count() > 0);
        let qp_num = loop {
            let n = QP_COUNTER.fetch_add(1, Ordering::Relaxed) & QPN_MASK;
            if n != 0 && !qps.contains_key(&n) {
                break n;
            }
        };
        let qp = Arc::new(QueuePair {
            qp_num,
            lid,
            inner: Mutex::new(QpInner::default()),
            send_cq,
            srq,
            fabric: Arc::downgrade(self),
        });
        qps.insert(qp_num, Arc::downgrade(&qp));
        Ok(qp)
    }
}
