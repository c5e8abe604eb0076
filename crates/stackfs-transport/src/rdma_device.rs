//! RDMA device state shared by every queue pair on one device port.
//!
//! A device owns the protection domain, one send and one receive completion
//! queue, the shared receive queue and two pools of registered buffers
//! ("posts"). Two threads wait on the completion queues and route each
//! completion to the transport owning the queue pair it names.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::RdmaOptions;
use crate::error::{Result, TransportError};
use crate::rdma_sim::{
    AccessFlags, CompletionEntry, CompletionQueue, CompletionStatus, DeviceAttr, Fabric,
    MemoryRegion, ProtectionDomain, QueuePair, SharedReceiveQueue,
};

/// Room for the frame header and slack on top of the negotiated block size.
pub const POST_OVERHEAD: usize = 2048;

const CQ_DEPTH: usize = 65536;
const COMPLETION_WAIT: Duration = Duration::from_millis(100);

/// Receiver of completions for one queue pair.
pub(crate) trait QpOwner: Send + Sync {
    /// A send posted on this queue pair completed.
    fn on_send_complete(&self);
    /// A message arrived.
    fn on_recv_complete(&self, data: Vec<u8>);
    /// A work request failed; the queue pair is unusable.
    fn on_qp_error(&self, status: CompletionStatus);
}

/// A registered buffer and the work request id it is posted under.
#[derive(Clone)]
pub struct Post {
    pub id: u64,
    pub mr: Arc<MemoryRegion>,
}

struct PostPool {
    buf_size: usize,
    free: Vec<Post>,
    active: HashMap<u64, Post>,
    next_id: u64,
}

impl PostPool {
    fn new(pd: &ProtectionDomain, buf_size: usize, count: usize) -> Self {
        let mut pool = Self {
            buf_size,
            free: Vec::with_capacity(count),
            active: HashMap::new(),
            next_id: 1,
        };
        for _ in 0..count {
            let post = pool.allocate(pd);
            pool.free.push(post);
        }
        pool
    }

    fn allocate(&mut self, pd: &ProtectionDomain) -> Post {
        let id = self.next_id;
        self.next_id += 1;
        Post {
            id,
            mr: pd.reg_mr(self.buf_size, AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE),
        }
    }

    /// A free post; the pool grows when none is left.
    fn get(&mut self, pd: &ProtectionDomain) -> Post {
        match self.free.pop() {
            Some(post) => post,
            None => {
                trace!(buf_size = self.buf_size, "growing post pool");
                self.allocate(pd)
            }
        }
    }

    fn activate(&mut self, post: Post) {
        self.active.insert(post.id, post);
    }

    fn complete(&mut self, wr_id: u64) -> Option<Post> {
        self.active.remove(&wr_id)
    }

    fn release(&mut self, post: Post) {
        self.free.push(post);
    }

    fn total(&self) -> usize {
        self.free.len() + self.active.len()
    }
}

/// One opened device port.
pub struct RdmaDevice {
    attr: DeviceAttr,
    port: u8,
    fabric: Arc<Fabric>,
    pd: ProtectionDomain,
    send_cq: Arc<CompletionQueue>,
    recv_cq: Arc<CompletionQueue>,
    srq: Arc<SharedReceiveQueue>,
    send_posts: Mutex<PostPool>,
    recv_posts: Mutex<PostPool>,
    owners: DashMap<u32, Weak<dyn QpOwner>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RdmaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaDevice")
            .field("name", &self.attr.name)
            .field("port", &self.port)
            .field("queue_pairs", &self.owners.len())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Side {
    Send,
    Recv,
}

impl RdmaDevice {
    fn open(
        fabric: Arc<Fabric>,
        attr: DeviceAttr,
        port: u8,
        opts: &RdmaOptions,
    ) -> Result<Arc<Self>> {
        if attr.lid(port).is_none() {
            return Err(TransportError::Rdma {
                reason: format!("device {} has no port {port}", attr.name),
            });
        }
        let pd = ProtectionDomain::new(&attr.name);
        let send_cq = Arc::new(CompletionQueue::new(CQ_DEPTH));
        let recv_cq = Arc::new(CompletionQueue::new(CQ_DEPTH));
        let srq = SharedReceiveQueue::new(&fabric, recv_cq.clone());
        let send_posts = PostPool::new(&pd, opts.send_size + POST_OVERHEAD, opts.send_count);
        let mut recv_posts = PostPool::new(&pd, opts.recv_size + POST_OVERHEAD, opts.recv_count);
        for _ in 0..opts.recv_count {
            let post = recv_posts.get(&pd);
            srq.post_recv(post.id, post.mr.clone());
            recv_posts.activate(post);
        }

        let device = Arc::new(Self {
            attr,
            port,
            fabric,
            pd,
            send_cq: send_cq.clone(),
            recv_cq: recv_cq.clone(),
            srq,
            send_posts: Mutex::new(send_posts),
            recv_posts: Mutex::new(recv_posts),
            owners: DashMap::new(),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::with_capacity(2);
        for (side, cq) in [(Side::Send, send_cq), (Side::Recv, recv_cq)] {
            let weak = Arc::downgrade(&device);
            let name = match side {
                Side::Send => format!("rdma-send-{}", device.attr.name),
                Side::Recv => format!("rdma-recv-{}", device.attr.name),
            };
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || completion_loop(weak, cq, side))?;
            threads.push(handle);
        }
        *device.threads.lock() = threads;

        info!(
            device = %device.attr.name,
            port,
            recv_posted = opts.recv_count,
            "RDMA device opened"
        );
        Ok(device)
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.attr.name
    }

    /// Port number.
    pub fn port(&self) -> u8 {
        self.port
    }

    /// Largest message a send post can hold.
    pub fn max_send(&self) -> usize {
        self.send_posts.lock().buf_size - POST_OVERHEAD
    }

    /// Largest message a receive post can hold.
    pub fn max_recv(&self) -> usize {
        self.recv_posts.lock().buf_size - POST_OVERHEAD
    }

    /// Receive buffers currently posted on the shared receive queue.
    pub fn recv_posted(&self) -> usize {
        self.srq.posted()
    }

    /// Send posts allocated so far.
    pub fn send_posts_allocated(&self) -> usize {
        self.send_posts.lock().total()
    }

    /// Creates a queue pair in the INIT state.
    pub fn create_qp(&self) -> Result<Arc<QueuePair>> {
        let qp = self
            .fabric
            .create_qp(&self.attr, self.port, self.send_cq.clone(), self.srq.clone())?;
        qp.modify_to_init(self.port)?;
        Ok(qp)
    }

    pub(crate) fn register(&self, qp_num: u32, owner: Weak<dyn QpOwner>) {
        self.owners.insert(qp_num, owner);
    }

    pub(crate) fn unregister(&self, qp_num: u32) {
        self.owners.remove(&qp_num);
    }

    /// Copies `data` into a send post and posts it on `qp`.
    pub fn post_send(&self, qp: &QueuePair, data: &[u8]) -> Result<()> {
        let post = {
            let mut pool = self.send_posts.lock();
            if data.len() > pool.buf_size {
                return Err(TransportError::FrameTooLarge {
                    size: data.len(),
                    max_size: pool.buf_size,
                });
            }
            let post = pool.get(&self.pd);
            post.mr.write_at(0, data);
            pool.activate(post.clone());
            post
        };
        if let Err(e) = qp.post_send(post.id, &post.mr, data.len()) {
            let mut pool = self.send_posts.lock();
            pool.complete(post.id);
            pool.release(post);
            return Err(e);
        }
        Ok(())
    }

    fn owner(&self, qp_num: u32) -> Option<Arc<dyn QpOwner>> {
        self.owners.get(&qp_num).and_then(|w| w.upgrade())
    }

    fn on_send_completion(&self, entry: CompletionEntry) {
        {
            let mut pool = self.send_posts.lock();
            match pool.complete(entry.wr_id) {
                Some(post) => pool.release(post),
                None => warn!(wr_id = entry.wr_id, "send completion for unknown post"),
            }
        }
        let Some(owner) = self.owner(entry.qp_num) else {
            debug!(qp_num = entry.qp_num, "send completion for closed queue pair");
            return;
        };
        match entry.status {
            CompletionStatus::Success => owner.on_send_complete(),
            status => {
                error!(qp_num = entry.qp_num, ?status, "send failed");
                owner.on_qp_error(status);
            }
        }
    }

    fn on_recv_completion(&self, entry: CompletionEntry) {
        let Some(post) = self.recv_posts.lock().complete(entry.wr_id) else {
            warn!(wr_id = entry.wr_id, "receive completion for unknown post");
            return;
        };
        let data = match entry.status {
            CompletionStatus::Success => post.mr.read_at(0, entry.byte_len as usize),
            _ => None,
        };
        self.recv_posts.lock().activate(post.clone());
        self.srq.post_recv(post.id, post.mr);

        let Some(owner) = self.owner(entry.qp_num) else {
            debug!(qp_num = entry.qp_num, "message for closed queue pair dropped");
            return;
        };
        match data {
            Some(data) => owner.on_recv_complete(data),
            None => {
                error!(qp_num = entry.qp_num, status = ?entry.status, "receive failed");
                owner.on_qp_error(entry.status);
            }
        }
    }
}

impl Drop for RdmaDevice {
    fn drop(&mut self) {
        self.send_cq.shutdown();
        self.recv_cq.shutdown();
        let me = thread::current().id();
        for handle in self.threads.get_mut().drain(..) {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        debug!(device = %self.attr.name, port = self.port, "RDMA device closed");
    }
}

fn completion_loop(device: Weak<RdmaDevice>, cq: Arc<CompletionQueue>, side: Side) {
    while !cq.is_shut_down() {
        let Some(entry) = cq.wait(COMPLETION_WAIT) else {
            continue;
        };
        let Some(device) = device.upgrade() else {
            break;
        };
        match side {
            Side::Send => device.on_send_completion(entry),
            Side::Recv => device.on_recv_completion(entry),
        }
    }
}

/// Opened devices, keyed by name and port.
pub struct RdmaContext {
    fabric: Arc<Fabric>,
    devices: Mutex<HashMap<(String, u8), Arc<RdmaDevice>>>,
}

impl Default for RdmaContext {
    fn default() -> Self {
        Self::new(Arc::new(Fabric::default()))
    }
}

impl std::fmt::Debug for RdmaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaContext")
            .field("fabric", &self.fabric)
            .field("open", &self.devices.lock().len())
            .finish()
    }
}

impl RdmaContext {
    pub fn new(fabric: Arc<Fabric>) -> Self {
        Self {
            fabric,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the device port, opening it on first use. Without a name the
    /// first device of the fabric is used.
    pub fn get_device(
        &self,
        name: Option<&str>,
        port: u8,
        opts: &RdmaOptions,
    ) -> Result<Arc<RdmaDevice>> {
        let attr = self
            .fabric
            .device(name)
            .cloned()
            .ok_or_else(|| TransportError::DeviceNotFound {
                name: name.unwrap_or("<any>").to_string(),
            })?;
        let mut devices = self.devices.lock();
        if let Some(device) = devices.get(&(attr.name.clone(), port)) {
            return Ok(device.clone());
        }
        let key = (attr.name.clone(), port);
        let device = RdmaDevice::open(self.fabric.clone(), attr, port, opts)?;
        devices.insert(key, device.clone());
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathMtu;
    use crate::rdma_sim::{RtrAttrs, RtsAttrs};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        sends: AtomicUsize,
        received: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<CompletionStatus>>,
    }

    impl QpOwner for Recorder {
        fn on_send_complete(&self) {
            self.sends.fetch_add(1, Ordering::SeqCst);
        }
        fn on_recv_complete(&self, data: Vec<u8>) {
            self.received.lock().push(data);
        }
        fn on_qp_error(&self, status: CompletionStatus) {
            self.errors.lock().push(status);
        }
    }

    fn small() -> RdmaOptions {
        RdmaOptions {
            send_count: 2,
            recv_count: 4,
            send_size: 1024,
            recv_size: 1024,
            ..Default::default()
        }
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn connect(a: &QueuePair, b: &QueuePair) {
        for (x, y) in [(a, b), (b, a)] {
            x.modify_to_rtr(RtrAttrs {
                remote_qpn: y.qp_num(),
                remote_lid: y.lid(),
                rq_psn: 0,
                path_mtu: PathMtu::Mtu2048,
            })
            .unwrap();
            x.modify_to_rts(RtsAttrs {
                sq_psn: 0,
                timeout: 14,
                retry_cnt: 7,
                rnr_retry: 7,
            })
            .unwrap();
        }
    }

    #[test]
    fn test_get_device_caches_and_checks_name() {
        let ctx = RdmaContext::default();
        let a = ctx.get_device(None, 1, &small()).unwrap();
        let b = ctx.get_device(Some("sim0"), 1, &small()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "sim0");
        assert_eq!(a.port(), 1);
        assert_eq!(a.recv_posted(), 4);
        assert_eq!(a.max_send(), 1024);

        let other_port = ctx.get_device(None, 2, &small()).unwrap();
        assert!(!Arc::ptr_eq(&a, &other_port));
        assert_eq!(other_port.port(), 2);
        assert!(matches!(
            ctx.get_device(Some("mlx5_0"), 1, &small()),
            Err(TransportError::DeviceNotFound { .. })
        ));
        assert!(ctx.get_device(None, 9, &small()).is_err());
    }

    #[test]
    fn test_completions_route_to_owner() {
        let ctx = RdmaContext::default();
        let dev = ctx.get_device(None, 1, &small()).unwrap();
        let qa = dev.create_qp().unwrap();
        let qb = dev.create_qp().unwrap();
        connect(&qa, &qb);
        let ra = Arc::new(Recorder::default());
        let rb = Arc::new(Recorder::default());
        let wa: Weak<dyn QpOwner> = Arc::downgrade(&ra) as Weak<dyn QpOwner>;
        let wb: Weak<dyn QpOwner> = Arc::downgrade(&rb) as Weak<dyn QpOwner>;
        dev.register(qa.qp_num(), wa);
        dev.register(qb.qp_num(), wb);

        dev.post_send(&qa, b"first").unwrap();
        dev.post_send(&qa, b"second").unwrap();
        assert!(wait_until(|| rb.received.lock().len() == 2));
        assert!(wait_until(|| ra.sends.load(Ordering::SeqCst) == 2));
        assert_eq!(*rb.received.lock(), vec![b"first".to_vec(), b"second".to_vec()]);
        // Receive buffers are reposted after each completion.
        assert!(wait_until(|| dev.recv_posted() == 4));
    }

    #[test]
    fn test_send_pool_grows() {
        let ctx = RdmaContext::default();
        let dev = ctx.get_device(None, 1, &small()).unwrap();
        // A peer with no receive buffers leaves every send outstanding.
        let starved = RdmaOptions {
            recv_count: 0,
            ..small()
        };
        let peer = ctx.get_device(None, 2, &starved).unwrap();
        let qa = dev.create_qp().unwrap();
        let qb = peer.create_qp().unwrap();
        connect(&qa, &qb);
        for _ in 0..6 {
            dev.post_send(&qa, b"x").unwrap();
        }
        assert_eq!(dev.send_posts_allocated(), 6);
        assert!(matches!(
            dev.post_send(&qa, &vec![0u8; 1024 + POST_OVERHEAD + 1]),
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_error_completion_reported() {
        let ctx = RdmaContext::default();
        let dev = ctx.get_device(None, 1, &small()).unwrap();
        let qa = dev.create_qp().unwrap();
        let qb = dev.create_qp().unwrap();
        connect(&qa, &qb);
        let ra = Arc::new(Recorder::default());
        let wa: Weak<dyn QpOwner> = Arc::downgrade(&ra) as Weak<dyn QpOwner>;
        dev.register(qa.qp_num(), wa);
        qb.destroy();
        dev.post_send(&qa, b"lost").unwrap();
        assert!(wait_until(|| !ra.errors.lock().is_empty()));
        assert_eq!(ra.errors.lock()[0], CompletionStatus::RetryExceeded);
    }

    #[test]
    fn test_device_drop_joins_threads() {
        let ctx = RdmaContext::default();
        let dev = ctx.get_device(None, 1, &small()).unwrap();
        let weak = Arc::downgrade(&dev);
        drop(dev);
        drop(ctx);
        assert!(weak.upgrade().is_none());
    }
}
