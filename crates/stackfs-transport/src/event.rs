//! Readiness multiplexer backed by Linux epoll.
//!
//! Every descriptor is armed one-shot, so a readiness report for a slot is
//! delivered to at most one worker at a time. After the handler returns the
//! slot is re-armed with whatever interest it has then. Slots are recycled
//! through a free list; each reuse bumps the slot generation, and reports
//! whose generation no longer matches are dropped.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, TransportError};

/// Identity of one registration: slot index plus the generation it was issued with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    /// Index into the slot table.
    pub index: u32,
    /// Generation of the slot when this registration was made.
    pub generation: u32,
}

impl SlotId {
    fn token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

/// One readiness report handed to an [`EventHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Registered descriptor.
    pub fd: RawFd,
    /// Registration the report belongs to.
    pub slot: SlotId,
    /// Descriptor is readable.
    pub readable: bool,
    /// Descriptor is writable.
    pub writable: bool,
    /// Error or hang-up condition.
    pub errored: bool,
}

/// Receiver of readiness reports.
///
/// Calls for one slot never overlap. Handlers for different slots run
/// concurrently on different workers.
pub trait EventHandler: Send + Sync {
    /// Handles one readiness report.
    fn handle(&self, event: Readiness);
}

/// Event pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPoolConfig {
    /// Worker threads started by [`EventPool::start`].
    pub threads: usize,
    /// Upper bound on concurrently registered descriptors.
    pub max_slots: usize,
    /// Events fetched per `epoll_wait` call.
    pub events_per_wait: usize,
    /// Wait timeout; bounds how long a surplus worker takes to notice a shrink.
    pub poll_timeout_ms: i32,
}

impl Default for EventPoolConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            max_slots: 16384,
            events_per_wait: 64,
            poll_timeout_ms: 100,
        }
    }
}

struct Registration {
    fd: RawFd,
    handler: Weak<dyn EventHandler>,
    want_read: bool,
    want_write: bool,
}

#[derive(Default)]
struct SlotEntry {
    generation: u32,
    reg: Option<Registration>,
    in_flight: bool,
    pending_free: bool,
}

struct SlotTable {
    entries: Vec<SlotEntry>,
    free: Vec<u32>,
    live: usize,
}

struct WorkerSlot {
    handle: Option<JoinHandle<()>>,
    running: bool,
}

struct PoolInner {
    epfd: OwnedFd,
    config: EventPoolConfig,
    slots: Mutex<SlotTable>,
    workers: Mutex<Vec<WorkerSlot>>,
    target_threads: AtomicUsize,
    shutdown: AtomicBool,
}

/// Thread pool dispatching epoll readiness to registered handlers.
pub struct EventPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPool")
            .field("registered", &self.registered())
            .field("threads", &self.inner.target_threads.load(Ordering::Relaxed))
            .finish()
    }
}

fn interest_bits(want_read: bool, want_write: bool) -> u32 {
    let mut bits = libc::EPOLLONESHOT as u32;
    if want_read {
        bits |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if want_write {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn epoll_ctl(
    epfd: RawFd,
    op: libc::c_int,
    fd: RawFd,
    events: u32,
    token: u64,
) -> std::io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: token };
    // SAFETY: ev is a valid epoll_event for the duration of the call.
    let rc = unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl EventPool {
    /// Creates the epoll instance. No workers run until [`start`](Self::start)
    /// or [`dispatch`](Self::dispatch) is called.
    pub fn new(config: EventPoolConfig) -> Result<Self> {
        // SAFETY: epoll_create1 has no memory-safety preconditions.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: fd was just returned by epoll_create1 and is owned by nobody else.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        debug!(epfd = fd, max_slots = config.max_slots, "event pool created");
        Ok(Self {
            inner: Arc::new(PoolInner {
                epfd,
                target_threads: AtomicUsize::new(config.threads),
                config,
                slots: Mutex::new(SlotTable {
                    entries: Vec::new(),
                    free: Vec::new(),
                    live: 0,
                }),
                workers: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Registers `fd` with the given interest and returns its slot.
    pub fn register(
        &self,
        fd: RawFd,
        handler: Weak<dyn EventHandler>,
        want_read: bool,
        want_write: bool,
    ) -> Result<SlotId> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::PoolShutdown);
        }
        let mut guard = self.inner.slots.lock();
        let table = &mut *guard;
        let index = match table.free.pop() {
            Some(index) => index,
            None => {
                if table.entries.len() >= self.inner.config.max_slots {
                    warn!(max_slots = self.inner.config.max_slots, "event slots exhausted");
                    return Err(TransportError::SlotsExhausted {
                        max_slots: self.inner.config.max_slots,
                    });
                }
                table.entries.push(SlotEntry::default());
                (table.entries.len() - 1) as u32
            }
        };
        let entry = &mut table.entries[index as usize];
        entry.generation = entry.generation.wrapping_add(1);
        let slot = SlotId {
            index,
            generation: entry.generation,
        };
        if let Err(e) = epoll_ctl(
            self.inner.epfd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            interest_bits(want_read, want_write),
            slot.token(),
        ) {
            error!(fd, error = %e, "failed to add descriptor to epoll");
            table.free.push(index);
            return Err(e.into());
        }
        entry.reg = Some(Registration {
            fd,
            handler,
            want_read,
            want_write,
        });
        table.live += 1;
        trace!(fd, index, generation = slot.generation, "registered");
        Ok(slot)
    }

    /// Updates interest for `slot`. `None` leaves that direction unchanged.
    pub fn select_on(
        &self,
        slot: SlotId,
        want_read: Option<bool>,
        want_write: Option<bool>,
    ) -> Result<()> {
        let mut table = self.inner.slots.lock();
        let entry = table
            .entries
            .get_mut(slot.index as usize)
            .filter(|e| e.generation == slot.generation)
            .ok_or(TransportError::SlotNotFound {
                index: slot.index,
                generation: slot.generation,
            })?;
        let in_flight = entry.in_flight;
        let reg = entry.reg.as_mut().ok_or(TransportError::SlotNotFound {
            index: slot.index,
            generation: slot.generation,
        })?;
        if let Some(r) = want_read {
            reg.want_read = r;
        }
        if let Some(w) = want_write {
            reg.want_write = w;
        }
        // A running handler re-arms on return with the updated interest.
        if !in_flight {
            epoll_ctl(
                self.inner.epfd.as_raw_fd(),
                libc::EPOLL_CTL_MOD,
                reg.fd,
                interest_bits(reg.want_read, reg.want_write),
                slot.token(),
            )?;
        }
        Ok(())
    }

    /// Current interest of `slot`, if it is still registered.
    pub fn interest(&self, slot: SlotId) -> Option<(bool, bool)> {
        let table = self.inner.slots.lock();
        table
            .entries
            .get(slot.index as usize)
            .filter(|e| e.generation == slot.generation)
            .and_then(|e| e.reg.as_ref())
            .map(|r| (r.want_read, r.want_write))
    }

    /// Removes `slot`. The handler is not called again for it; a call already
    /// running elsewhere finishes, and the index is recycled only afterwards.
    pub fn unregister(&self, slot: SlotId) -> Result<()> {
        let mut table = self.inner.slots.lock();
        unregister_locked(&self.inner, &mut table, slot)
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        self.inner.slots.lock().live
    }

    /// Spawns the configured number of worker threads.
    pub fn start(&self) -> Result<()> {
        let n = self.inner.target_threads.load(Ordering::Acquire);
        self.reconfigure_threads(n)
    }

    /// Runs the dispatch loop on the calling thread until [`shutdown`](Self::shutdown).
    pub fn dispatch(&self) {
        run_loop(&self.inner, None);
    }

    /// Grows or shrinks the worker pool. New workers start immediately;
    /// surplus workers exit at their next wakeup.
    pub fn reconfigure_threads(&self, n: usize) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::PoolShutdown);
        }
        let mut workers = self.inner.workers.lock();
        let old = self.inner.target_threads.swap(n, Ordering::AcqRel);
        for index in 0..n {
            if index >= workers.len() {
                workers.push(WorkerSlot {
                    handle: None,
                    running: false,
                });
            }
            if workers[index].running {
                continue;
            }
            if let Some(done) = workers[index].handle.take() {
                let _ = done.join();
            }
            let inner = self.inner.clone();
            let handle = thread::Builder::new()
                .name(format!("stackfs-epoll-{index}"))
                .spawn(move || run_loop(&inner, Some(index)))?;
            workers[index] = WorkerSlot {
                handle: Some(handle),
                running: true,
            };
        }
        if n != old {
            info!(from = old, to = n, "event pool threads reconfigured");
        }
        Ok(())
    }

    /// Number of worker threads currently running.
    pub fn running_threads(&self) -> usize {
        self.inner
            .workers
            .lock()
            .iter()
            .filter(|w| w.running)
            .count()
    }

    /// Stops every worker and waits for them to exit.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .workers
            .lock()
            .iter_mut()
            .filter_map(|w| w.handle.take())
            .collect();
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        debug!("event pool shut down");
    }

    /// Delivers a synthetic readiness report for `slot`, exactly as if epoll
    /// had reported it. Used to exercise stale-generation handling.
    pub fn inject(&self, slot: SlotId, readable: bool, writable: bool) {
        let mut bits = 0u32;
        if readable {
            bits |= libc::EPOLLIN as u32;
        }
        if writable {
            bits |= libc::EPOLLOUT as u32;
        }
        handle_event(&self.inner, slot.token(), bits);
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unregister_locked(inner: &PoolInner, table: &mut SlotTable, slot: SlotId) -> Result<()> {
    let entry = table
        .entries
        .get_mut(slot.index as usize)
        .filter(|e| e.generation == slot.generation)
        .ok_or(TransportError::SlotNotFound {
            index: slot.index,
            generation: slot.generation,
        })?;
    let reg = entry.reg.take().ok_or(TransportError::SlotNotFound {
        index: slot.index,
        generation: slot.generation,
    })?;
    if let Err(e) = epoll_ctl(inner.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, reg.fd, 0, 0) {
        debug!(fd = reg.fd, error = %e, "epoll delete failed");
    }
    if entry.in_flight {
        entry.pending_free = true;
    } else {
        table.free.push(slot.index);
    }
    table.live -= 1;
    trace!(fd = reg.fd, index = slot.index, "unregistered");
    Ok(())
}

fn run_loop(inner: &Arc<PoolInner>, index: Option<usize>) {
    let cap = inner.config.events_per_wait.max(1);
    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; cap];
    debug!(worker = ?index, "event worker started");
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        if let Some(i) = index {
            if i >= inner.target_threads.load(Ordering::Acquire) {
                let mut workers = inner.workers.lock();
                if i >= inner.target_threads.load(Ordering::Acquire) {
                    if let Some(w) = workers.get_mut(i) {
                        w.running = false;
                    }
                    break;
                }
            }
        }
        // SAFETY: events holds `cap` initialized entries.
        let n = unsafe {
            libc::epoll_wait(
                inner.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                cap as libc::c_int,
                inner.config.poll_timeout_ms,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %err, "epoll_wait failed");
            thread::sleep(Duration::from_millis(10));
            continue;
        }
        for ev in &events[..n as usize] {
            let (bits, token) = (ev.events, ev.u64);
            handle_event(inner, token, bits);
        }
    }
    debug!(worker = ?index, "event worker exiting");
}

fn handle_event(inner: &PoolInner, token: u64, bits: u32) {
    let slot = SlotId::from_token(token);
    let (fd, handler) = {
        let mut table = inner.slots.lock();
        let Some(entry) = table.entries.get_mut(slot.index as usize) else {
            return;
        };
        if entry.generation != slot.generation {
            trace!(
                index = slot.index,
                stale = slot.generation,
                current = entry.generation,
                "stale event dropped"
            );
            return;
        }
        // Already being handled elsewhere; that call re-arms on return.
        if entry.in_flight {
            return;
        }
        let Some(reg) = entry.reg.as_ref() else {
            return;
        };
        let out = (reg.fd, reg.handler.clone());
        entry.in_flight = true;
        out
    };

    let alive = match handler.upgrade() {
        Some(h) => {
            h.handle(Readiness {
                fd,
                slot,
                readable: bits & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                errored: bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
            });
            true
        }
        None => false,
    };

    let mut table = inner.slots.lock();
    let table = &mut *table;
    let entry = &mut table.entries[slot.index as usize];
    entry.in_flight = false;
    if entry.pending_free {
        entry.pending_free = false;
        table.free.push(slot.index);
        return;
    }
    if !alive {
        debug!(fd, index = slot.index, "handler gone, dropping registration");
        let _ = unregister_locked(inner, table, slot);
        return;
    }
    if let Some(reg) = entry.reg.as_ref() {
        if let Err(e) = epoll_ctl(
            inner.epfd.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            reg.fd,
            interest_bits(reg.want_read, reg.want_write),
            slot.token(),
        ) {
            warn!(fd = reg.fd, error = %e, "failed to re-arm descriptor");
        }
    }
}
