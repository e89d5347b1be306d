//! The sink endpoint lease: a priority-aware connection holder whose
//! transport dies automatically when the peer stops sending heartbeats.
//!
//! Life management: a live lease is held only by its watchdog timer
//! thread; everyone else keeps weak references. When the timer expires or
//! is cancelled, the thread drops the sole strong reference, and that drop
//! destroys the underlying transport. The transport is therefore destroyed
//! exactly once, on either expiry or explicit destruction, never on both.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use super::{EndpointRpc, SinkConnection, SinkEndpointRpc};
use crate::broker::SinkRef;
use crate::channel::FrameBufferingPolicy;
use crate::protocol::Transport;

/// An error surfaced to lease callers; no state changes on error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseError {
    /// The handle is stale, or the live lease outranks the caller.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
}

/// Builds the transport a lease guards, invoked once when the lease is
/// armed.
pub type ConnectionFactory = Box<dyn FnOnce() -> Arc<dyn SinkConnection> + Send>;

struct WatchdogState {
    deadline: Instant,
    cancelled: bool,
}

struct TimedConnection {
    handle: u64,
    priority: i32,
    period: Duration,
    transport: Arc<dyn SinkConnection>,
    state: Mutex<WatchdogState>,
    cond: Condvar,
}

impl TimedConnection {
    fn create(
        period: Duration,
        handle: u64,
        priority: i32,
        transport: Arc<dyn SinkConnection>,
    ) -> Weak<TimedConnection> {
        let connection = Arc::new(TimedConnection {
            handle,
            priority,
            period,
            transport,
            state: Mutex::new(WatchdogState {
                deadline: Instant::now() + period,
                cancelled: false,
            }),
            cond: Condvar::new(),
        });

        let weak = Arc::downgrade(&connection);
        let _ = std::thread::Builder::new()
            .name("mediabus-lease".into())
            .spawn(move || connection.watchdog());

        weak
    }

    fn keep_alive(&self) {
        let mut state = self.state.lock().unwrap();
        state.deadline = Instant::now() + self.period;
        self.cond.notify_all();
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled = true;
        self.cond.notify_all();
    }

    fn watchdog(self: Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.cancelled {
                break;
            }
            let now = Instant::now();
            if now >= state.deadline {
                log::info!("lease {:#x} expired, destroying transport", self.handle);
                break;
            }

            let timeout = state.deadline.saturating_duration_since(now);
            let (guard, _) = self.cond.wait_timeout(state, timeout).unwrap();
            state = guard;
        }
        // Falling out of the thread drops the only strong reference.
    }
}

impl Drop for TimedConnection {
    fn drop(&mut self) {
        self.transport.destroy();
    }
}

/// A single priority-arbitrated connection slot.
pub struct SinkLease {
    current: Mutex<Weak<TimedConnection>>,
    handle_gen: Mutex<u64>,
}

impl Default for SinkLease {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SinkLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkLease").finish()
    }
}

impl SinkLease {
    /// An empty lease slot with a randomly seeded handle generator.
    pub fn new() -> Self {
        let seed = uuid::Uuid::new_v4().as_u64_pair().0;
        SinkLease {
            current: Mutex::new(Weak::new()),
            handle_gen: Mutex::new(seed),
        }
    }

    /// Arms the lease: preempts a lower-priority lease (destroying its
    /// transport) or fails against an equal-or-higher one, then builds
    /// the new transport and starts its watchdog.
    pub fn create(
        &self,
        factory: ConnectionFactory,
        priority: i32,
        timeout: Duration,
    ) -> Result<u64, LeaseError> {
        let mut current = self.current.lock().unwrap();
        if let Some(connection) = current.upgrade() {
            if connection.priority >= priority {
                return Err(LeaseError::InvalidOperation("slot is busy"));
            }
            connection.cancel();
        }

        let handle = {
            let mut generator = self.handle_gen.lock().unwrap();
            *generator = generator.wrapping_add(1);
            *generator
        };

        *current = TimedConnection::create(timeout, handle, priority, factory());
        Ok(handle)
    }

    /// Heartbeats the lease, resetting its watchdog.
    pub fn keep_alive(&self, handle: u64) -> Result<(), LeaseError> {
        self.valid_connection(handle)?.keep_alive();
        Ok(())
    }

    /// Releases the lease; the watchdog destroys the transport.
    pub fn destroy(&self, handle: u64) -> Result<(), LeaseError> {
        let connection = self.valid_connection(handle)?;
        connection.cancel();
        *self.current.lock().unwrap() = Weak::new();
        Ok(())
    }

    /// Whether a lease with priority at least `priority` is live.
    pub fn is_busy(&self, priority: i32) -> bool {
        self.current
            .lock()
            .unwrap()
            .upgrade()
            .map(|c| c.priority >= priority)
            .unwrap_or(false)
    }

    fn valid_connection(&self, handle: u64) -> Result<Arc<TimedConnection>, LeaseError> {
        self.current
            .lock()
            .unwrap()
            .upgrade()
            .filter(|c| c.handle == handle)
            .ok_or(LeaseError::InvalidOperation("invalid handle"))
    }
}

/// The RPC-facing lease holder: connects a fixed local sink to remote
/// sources on demand, one leased connection at a time.
pub struct LeaseServer {
    lease: SinkLease,
    sink: SinkRef,
    transport: Transport,
    keep_alive_ms: u32,
}

impl LeaseServer {
    /// A server feeding the given sink.
    pub fn new(sink: SinkRef, transport: Transport, keep_alive_ms: u32) -> Self {
        LeaseServer {
            lease: SinkLease::new(),
            sink,
            transport,
            keep_alive_ms,
        }
    }

    /// The underlying lease slot.
    pub fn lease(&self) -> &SinkLease {
        &self.lease
    }
}

impl SinkEndpointRpc for LeaseServer {
    fn connect_by_object_ref(
        &self,
        source: Arc<dyn EndpointRpc>,
        priority: i32,
    ) -> Result<u64, LeaseError> {
        let sink = self.sink.clone();
        let transport = self.transport;
        let factory: ConnectionFactory = Box::new(move || {
            super::create_pull_connection_by_endpoint(
                source,
                sink,
                transport,
                None,
                FrameBufferingPolicy::Buffered,
            )
        });

        // Twice the heartbeat interval, so one lost heartbeat is survivable.
        let timeout = Duration::from_millis(2 * self.keep_alive_ms as u64);
        self.lease.create(factory, priority, timeout)
    }

    fn keep_alive(&self, handle: u64) -> Result<(), LeaseError> {
        self.lease.keep_alive(handle)
    }

    fn disconnect(&self, handle: u64) -> Result<(), LeaseError> {
        self.lease.destroy(handle)
    }

    fn keep_alive_milliseconds(&self) -> u32 {
        self.keep_alive_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Qos;
    use assert_matches::assert_matches;

    struct MockTransport {
        destroyed: Arc<Mutex<u32>>,
    }

    impl SinkConnection for MockTransport {
        fn request_qos(&self, _qos: &Qos) {}

        fn destroy(&self) {
            *self.destroyed.lock().unwrap() += 1;
        }
    }

    fn mock_factory() -> (ConnectionFactory, Arc<Mutex<u32>>) {
        let destroyed = Arc::new(Mutex::new(0));
        let counter = destroyed.clone();
        let factory: ConnectionFactory =
            Box::new(move || Arc::new(MockTransport { destroyed: counter }));
        (factory, destroyed)
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn equal_priority_is_rejected_higher_preempts() {
        let lease = SinkLease::new();

        let (factory, low_destroyed) = mock_factory();
        let low = lease
            .create(factory, 1, Duration::from_secs(30))
            .unwrap();

        let (factory, _) = mock_factory();
        assert_matches!(
            lease.create(factory, 1, Duration::from_secs(30)),
            Err(LeaseError::InvalidOperation(_))
        );

        let (factory, _) = mock_factory();
        let high = lease.create(factory, 2, Duration::from_secs(30)).unwrap();
        assert_ne!(low, high);

        // Preemption destroys the previous transport exactly once.
        wait_for(|| *low_destroyed.lock().unwrap() == 1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(*low_destroyed.lock().unwrap(), 1);

        assert!(lease.is_busy(1));
        assert!(lease.is_busy(2));
        assert!(!lease.is_busy(3));
    }

    #[test]
    fn stale_handle_is_invalid() {
        let lease = SinkLease::new();
        let (factory, _) = mock_factory();
        let handle = lease.create(factory, 1, Duration::from_secs(30)).unwrap();

        assert_matches!(
            lease.keep_alive(handle + 1),
            Err(LeaseError::InvalidOperation(_))
        );
        assert_matches!(
            lease.destroy(handle + 1),
            Err(LeaseError::InvalidOperation(_))
        );

        lease.destroy(handle).unwrap();
    }

    #[test]
    fn watchdog_expiry_destroys_transport_once() {
        let lease = SinkLease::new();
        let (factory, destroyed) = mock_factory();
        let _handle = lease
            .create(factory, 1, Duration::from_millis(100))
            .unwrap();

        wait_for(|| *destroyed.lock().unwrap() == 1);
        assert!(!lease.is_busy(0));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(*destroyed.lock().unwrap(), 1);
    }

    #[test]
    fn keep_alive_extends_the_lease() {
        let lease = SinkLease::new();
        let (factory, destroyed) = mock_factory();
        let handle = lease
            .create(factory, 1, Duration::from_millis(300))
            .unwrap();

        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(100));
            lease.keep_alive(handle).unwrap();
        }
        assert_eq!(*destroyed.lock().unwrap(), 0);

        wait_for(|| *destroyed.lock().unwrap() == 1);
    }

    #[test]
    fn explicit_destroy_destroys_transport_once() {
        let lease = SinkLease::new();
        let (factory, destroyed) = mock_factory();
        let handle = lease
            .create(factory, 1, Duration::from_secs(30))
            .unwrap();

        lease.destroy(handle).unwrap();
        wait_for(|| *destroyed.lock().unwrap() == 1);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(*destroyed.lock().unwrap(), 1);
        assert!(!lease.is_busy(0));
    }
}
