//! Transport abstraction shared by the socket and RDMA carriers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::config::{TransportConfig, TransportKind};
use crate::error::{Result, TransportError};
use crate::event::EventPool;
use crate::ioq::BufferRef;
use crate::metrics::TransportMetrics;
use crate::name::PeerInfo;
use crate::protocol::ReceivedFrame;
use crate::rdma::RdmaTransport;
use crate::rdma_device::RdmaContext;
use crate::socket::SocketTransport;

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// No carrier, or torn down.
    Disconnected,
    /// Connect issued, or handshake still running.
    Connecting,
    /// Ready for `submit`; listeners are in this state while listening.
    Connected,
}

/// Events delivered to a transport's [`Notify`] target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportEvent {
    /// Connection is up. For a listener's accepted peers this is reported on
    /// the new child transport.
    ChildUp,
    /// Connection went down after having been up.
    ChildDown,
    /// A complete frame is ready for [`Transport::receive`].
    PollIn,
    /// The outbound queue drained after backing up.
    PollOut,
    /// The connection failed.
    PollErr,
}

/// A transport plus the event it reported.
#[derive(Clone)]
pub struct Notification {
    /// Transport the event concerns.
    pub transport: Arc<dyn Transport>,
    /// What happened.
    pub event: TransportEvent,
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("peer", &self.transport.peer_info().identifier)
            .field("event", &self.event)
            .finish()
    }
}

/// Receiver of transport events.
///
/// Called from event pool workers and RDMA completion threads, never with a
/// transport lock held. An error returned for [`TransportEvent::PollIn`]
/// disconnects the transport.
pub trait Notify: Send + Sync {
    /// Handles one event.
    fn notify(&self, transport: &Arc<dyn Transport>, event: TransportEvent) -> Result<()>;
}

impl Notify for Sender<Notification> {
    fn notify(&self, transport: &Arc<dyn Transport>, event: TransportEvent) -> Result<()> {
        self.send(Notification {
            transport: transport.clone(),
            event,
        })
        .map_err(|_| TransportError::NotifyFailed {
            reason: "notification channel closed".to_string(),
        })
    }
}

/// Adapts a closure into a [`Notify`] target.
pub struct NotifyFn<F>(pub F);

impl<F> Notify for NotifyFn<F>
where
    F: Fn(&Arc<dyn Transport>, TransportEvent) -> Result<()> + Send + Sync,
{
    fn notify(&self, transport: &Arc<dyn Transport>, event: TransportEvent) -> Result<()> {
        (self.0)(transport, event)
    }
}

/// Connection abstraction implemented by every carrier.
pub trait Transport: Send + Sync {
    /// Carrier kind.
    fn kind(&self) -> TransportKind;

    /// Starts a non-blocking connect. Completion is reported with
    /// [`TransportEvent::ChildUp`], failure with [`TransportEvent::PollErr`].
    fn connect(&self) -> Result<()>;

    /// Binds and listens. Each accepted peer is reported as a new transport
    /// with [`TransportEvent::ChildUp`].
    fn listen(&self) -> Result<()>;

    /// Tears the connection down. Queued writes are discarded. Idempotent.
    fn disconnect(&self) -> Result<()>;

    /// Sends one frame. Writes on one transport reach the peer in submission
    /// order. `refs` is kept alive until the frame has been handed to the
    /// carrier or discarded.
    fn submit(&self, header: Bytes, payload: Vec<Bytes>, refs: Option<BufferRef>) -> Result<()>;

    /// Takes the next complete frame; `Ok(None)` if none is ready yet.
    /// Frames announced before a teardown stay readable, after which
    /// [`TransportError::NotConnected`] is returned.
    fn receive(&self) -> Result<Option<ReceivedFrame>>;

    /// Lifecycle state.
    fn state(&self) -> ConnectionState;

    /// True for listening transports.
    fn is_listener(&self) -> bool;

    /// Remote side.
    fn peer_info(&self) -> PeerInfo;

    /// Local side.
    fn local_info(&self) -> PeerInfo;
}

/// Resources shared by every transport of one process.
#[derive(Clone)]
pub struct TransportContext {
    pool: Arc<EventPool>,
    rdma: Arc<RdmaContext>,
    metrics: Arc<TransportMetrics>,
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("pool", &self.pool)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl TransportContext {
    /// Context using `pool` and the default RDMA provider.
    pub fn new(pool: Arc<EventPool>) -> Self {
        Self::with_rdma(pool, Arc::new(RdmaContext::default()))
    }

    /// Context with an explicit RDMA provider.
    pub fn with_rdma(pool: Arc<EventPool>, rdma: Arc<RdmaContext>) -> Self {
        Self {
            pool,
            rdma,
            metrics: Arc::new(TransportMetrics::new()),
        }
    }

    /// Event pool.
    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    /// RDMA devices.
    pub fn rdma(&self) -> &Arc<RdmaContext> {
        &self.rdma
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }
}

/// Creates a transport of the configured kind.
pub fn init(
    ctx: &TransportContext,
    config: TransportConfig,
    notify: Arc<dyn Notify>,
) -> Result<Arc<dyn Transport>> {
    match config.kind {
        TransportKind::Socket => {
            let t: Arc<dyn Transport> = SocketTransport::new(ctx, config, notify);
            Ok(t)
        }
        TransportKind::Rdma => {
            let t: Arc<dyn Transport> = RdmaTransport::new(ctx, config, notify)?;
            Ok(t)
        }
    }
}

/// Per-transport FIFO of events waiting to be delivered.
///
/// Events are pushed while the transport lock is held, so their order
/// matches the order of the state changes behind them. Delivery happens
/// after the lock is released; whichever thread finds the outbox idle
/// delivers everything queued, including events raised by the callbacks it
/// runs, so one transport's events never overtake each other.
#[derive(Default)]
pub(crate) struct Outbox {
    state: Mutex<OutboxState>,
}

#[derive(Default)]
struct OutboxState {
    pending: VecDeque<TransportEvent>,
    draining: bool,
}

impl Outbox {
    pub(crate) fn push(&self, event: TransportEvent) {
        self.state.lock().pending.push_back(event);
    }

    pub(crate) fn extend(&self, events: impl IntoIterator<Item = TransportEvent>) {
        self.state.lock().pending.extend(events);
    }

    /// Delivers queued events. A refused `PollIn` disconnects the transport.
    pub(crate) fn drain<T: Transport + 'static>(&self, me: &Weak<T>, notify: &dyn Notify) {
        {
            let mut s = self.state.lock();
            if s.draining {
                return;
            }
            s.draining = true;
        }
        let transport: Option<Arc<dyn Transport>> = me.upgrade().map(|t| t as Arc<dyn Transport>);
        loop {
            let event = {
                let mut s = self.state.lock();
                match s.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        s.draining = false;
                        return;
                    }
                }
            };
            let Some(transport) = transport.as_ref() else {
                continue;
            };
            if let Err(e) = notify.notify(transport, event) {
                warn!(peer = %transport.peer_info(), ?event, error = %e, "notify failed");
                if event == TransportEvent::PollIn {
                    let _ = transport.disconnect();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPoolConfig;

    fn ctx() -> TransportContext {
        TransportContext::new(Arc::new(EventPool::new(EventPoolConfig::default()).unwrap()))
    }

    #[test]
    fn test_init_selects_kind() {
        let ctx = ctx();
        let (tx, _rx) = crossbeam_channel::unbounded::<Notification>();
        let notify: Arc<dyn Notify> = Arc::new(tx);
        let t = init(&ctx, TransportConfig::default(), notify.clone()).unwrap();
        assert_eq!(t.kind(), TransportKind::Socket);
        assert_eq!(t.state(), ConnectionState::Disconnected);

        let cfg = TransportConfig {
            kind: TransportKind::Rdma,
            ..Default::default()
        };
        let t = init(&ctx, cfg, notify).unwrap();
        assert_eq!(t.kind(), TransportKind::Rdma);
    }

    #[test]
    fn test_rdma_init_unknown_device() {
        let ctx = ctx();
        let (tx, _rx) = crossbeam_channel::unbounded::<Notification>();
        let mut cfg = TransportConfig {
            kind: TransportKind::Rdma,
            ..Default::default()
        };
        cfg.rdma.device_name = Some("nonexistent0".into());
        assert!(matches!(
            init(&ctx, cfg, Arc::new(tx)),
            Err(TransportError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_channel_notify_closed() {
        let ctx = ctx();
        let (tx, rx) = crossbeam_channel::unbounded::<Notification>();
        let t = init(&ctx, TransportConfig::default(), Arc::new(tx.clone())).unwrap();
        tx.notify(&t, TransportEvent::PollOut).unwrap();
        assert_eq!(rx.recv().unwrap().event, TransportEvent::PollOut);
        drop(rx);
        assert!(matches!(
            tx.notify(&t, TransportEvent::PollOut),
            Err(TransportError::NotifyFailed { .. })
        ));
    }

    #[test]
    fn test_notify_fn() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let ctx = ctx();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let notify = Arc::new(NotifyFn(
            move |_: &Arc<dyn Transport>, ev: TransportEvent| -> Result<()> {
                if ev == TransportEvent::ChildUp {
                    seen2.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            },
        ));
        let t = init(&ctx, TransportConfig::default(), notify.clone()).unwrap();
        notify.notify(&t, TransportEvent::ChildUp).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
