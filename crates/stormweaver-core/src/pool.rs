//! Connection pool.
//!
//! A single owner task holds every connection of every backend. Workers talk
//! to it over a request channel and receive [`PooledConnection`] guards; a
//! guard hands its connection back when dropped. Nothing else touches the
//! connection lists, so acquire/release is the only shared-mutation surface
//! and it is serialized by construction.
//!
//! ```text
//!  worker ──Acquire──▶ ┌────────────┐ ──spawn_blocking──▶ Driver::connect
//!  worker ◀─oneshot─── │ pool actor │ ◀──Opened──────────┘
//!  guard  ──Release──▶ └────────────┘
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{driver_for, Driver, DriverSession};
use crate::config::BackendConfig;
use crate::error::{WeaverError, WeaverResult};

/// Pause between consecutive connect attempts, multiplied by the attempt number
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Pool-assigned connection identifier, unique for the lifetime of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Point-in-time counters for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStats {
    pub backend: String,
    pub capacity: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub opening: usize,
    pub waiters: usize,
}

type AcquireReply = oneshot::Sender<WeaverResult<PooledConnection>>;

enum PoolRequest {
    Acquire {
        backend: String,
        reply: AcquireReply,
    },
    Release {
        backend: String,
        id: ConnectionId,
        session: Option<Box<dyn DriverSession>>,
        healthy: bool,
    },
    Opened {
        backend: String,
        result: Result<Box<dyn DriverSession>, String>,
    },
    Stats {
        reply: oneshot::Sender<Vec<BackendStats>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A connection checked out of the pool.
///
/// Exclusively owned by one worker until dropped or released. The session
/// itself is only reachable from inside the crate; scripts never see it.
pub struct PooledConnection {
    id: ConnectionId,
    backend: String,
    session: Option<Box<dyn DriverSession>>,
    healthy: bool,
    returned: bool,
    tx: mpsc::UnboundedSender<PoolRequest>,
}

impl PooledConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Flag the connection for eviction when it goes back to the pool.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Return the connection to the pool.
    pub fn release(mut self, healthy: bool) {
        self.healthy = self.healthy && healthy;
    }

    /// Move the session out, e.g. onto a blocking thread. A guard without a
    /// session is evicted on release.
    pub(crate) fn take_session(&mut self) -> Option<Box<dyn DriverSession>> {
        self.session.take()
    }

    pub(crate) fn restore_session(&mut self, session: Box<dyn DriverSession>) {
        self.session = Some(session);
    }

    /// Disarm the guard and hand its parts back to the pool actor.
    fn into_parts(mut self) -> (ConnectionId, Option<Box<dyn DriverSession>>) {
        self.returned = true;
        (self.id, self.session.take())
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        let session = self.session.take();
        let healthy = self.healthy && session.is_some();
        // The actor may already be gone at shutdown; the session is closed either way.
        let _ = self.tx.send(PoolRequest::Release {
            backend: std::mem::take(&mut self.backend),
            id: self.id,
            session,
            healthy,
        });
    }
}

/// Handle to the pool actor. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    tx: mpsc::UnboundedSender<PoolRequest>,
    cancel: CancellationToken,
}

impl ConnectionPool {
    /// Start a pool for the configured backends. Must be called from within a
    /// tokio runtime.
    pub fn start(backends: &[BackendConfig], cancel: CancellationToken) -> Self {
        let entries = backends
            .iter()
            .map(|b| (b.clone(), driver_for(&b.driver)))
            .collect();
        Self::with_drivers(entries, cancel)
    }

    /// Start a pool with explicit driver instances (lets callers keep a handle
    /// on a driver, e.g. to inspect simulator statistics).
    pub fn with_drivers(
        backends: Vec<(BackendConfig, Arc<dyn Driver>)>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut slots = HashMap::new();
        for (config, driver) in backends {
            info!(
                backend = %config.name,
                driver = driver.kind(),
                pool_size = config.pool_size,
                "Registering backend"
            );
            slots.insert(config.name.clone(), BackendSlot::new(&config, driver));
        }

        let actor = PoolActor {
            backends: slots,
            next_id: 1,
            tx: tx.downgrade(),
            closed: false,
        };
        tokio::spawn(actor.run(rx));

        Self { tx, cancel }
    }

    /// Check out a connection for `backend`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - `Cancelled` once the pool's cancellation token has fired
    /// - `PoolExhausted` when no connection was freed within `timeout`
    /// - `BackendUnavailable` when the backend is unknown or could not be
    ///   opened within its retry budget
    pub async fn acquire(&self, backend: &str, timeout: Duration) -> WeaverResult<PooledConnection> {
        if self.cancel.is_cancelled() {
            return Err(WeaverError::Cancelled);
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolRequest::Acquire {
                backend: backend.to_string(),
                reply,
            })
            .map_err(|_| unavailable(backend, "pool is shut down"))?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WeaverError::Cancelled),
            reply = tokio::time::timeout(timeout, rx) => match reply {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(unavailable(backend, "pool is shut down")),
                Err(_) => Err(WeaverError::PoolExhausted {
                    backend: backend.to_string(),
                    waited: timeout,
                }),
            },
        }
    }

    /// Counters for every backend, sorted by backend name.
    pub async fn stats(&self) -> Vec<BackendStats> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolRequest::Stats { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Close every idle connection and fail pending waiters. Connections still
    /// checked out are closed when their guards are dropped.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolRequest::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

fn unavailable(backend: &str, reason: impl Into<String>) -> WeaverError {
    WeaverError::BackendUnavailable {
        backend: backend.to_string(),
        reason: reason.into(),
    }
}

struct BackendSlot {
    driver: Arc<dyn Driver>,
    capacity: usize,
    retry_budget: u32,
    init_sql: Arc<Vec<String>>,
    idle: Vec<(ConnectionId, Box<dyn DriverSession>)>,
    checked_out: HashSet<ConnectionId>,
    opening: usize,
    waiters: VecDeque<AcquireReply>,
}

impl BackendSlot {
    fn new(config: &BackendConfig, driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            capacity: config.pool_size.max(1),
            retry_budget: config.retry_budget.max(1),
            init_sql: Arc::new(config.init_sql.clone()),
            idle: Vec::new(),
            checked_out: HashSet::new(),
            opening: 0,
            waiters: VecDeque::new(),
        }
    }

    fn open_count(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.opening
    }

    fn prune_waiters(&mut self) {
        self.waiters.retain(|w| !w.is_closed());
    }
}

struct PoolActor {
    backends: HashMap<String, BackendSlot>,
    next_id: u64,
    tx: mpsc::WeakUnboundedSender<PoolRequest>,
    closed: bool,
}

impl PoolActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolRequest>) {
        while let Some(request) = rx.recv().await {
            self.handle(request);
        }
        debug!("Pool actor exiting");
    }

    fn handle(&mut self, request: PoolRequest) {
        match request {
            PoolRequest::Acquire { backend, reply } => self.on_acquire(backend, reply),
            PoolRequest::Release {
                backend,
                id,
                session,
                healthy,
            } => self.on_release(backend, id, session, healthy),
            PoolRequest::Opened { backend, result } => self.on_opened(backend, result),
            PoolRequest::Stats { reply } => {
                let mut stats: Vec<BackendStats> = self
                    .backends
                    .iter()
                    .map(|(name, slot)| BackendStats {
                        backend: name.clone(),
                        capacity: slot.capacity,
                        idle: slot.idle.len(),
                        checked_out: slot.checked_out.len(),
                        opening: slot.opening,
                        waiters: slot.waiters.iter().filter(|w| !w.is_closed()).count(),
                    })
                    .collect();
                stats.sort_by(|a, b| a.backend.cmp(&b.backend));
                let _ = reply.send(stats);
            }
            PoolRequest::Shutdown { reply } => {
                self.closed = true;
                for (name, slot) in self.backends.iter_mut() {
                    let closed = slot.idle.len();
                    slot.idle.clear();
                    for waiter in slot.waiters.drain(..) {
                        let _ = waiter.send(Err(unavailable(name, "pool is shut down")));
                    }
                    debug!(backend = %name, closed, "Closed idle connections");
                }
                let _ = reply.send(());
            }
        }
    }

    fn on_acquire(&mut self, backend: String, reply: AcquireReply) {
        if self.closed {
            let _ = reply.send(Err(unavailable(&backend, "pool is shut down")));
            return;
        }
        let Some(slot) = self.backends.get_mut(&backend) else {
            let _ = reply.send(Err(unavailable(&backend, "unknown backend")));
            return;
        };
        slot.waiters.push_back(reply);
        self.pump(&backend);
    }

    fn on_release(
        &mut self,
        backend: String,
        id: ConnectionId,
        session: Option<Box<dyn DriverSession>>,
        healthy: bool,
    ) {
        let closed = self.closed;
        let Some(slot) = self.backends.get_mut(&backend) else {
            return;
        };
        if !slot.checked_out.remove(&id) {
            warn!(backend = %backend, connection = %id, "Release of a connection that is not checked out");
            return;
        }

        match session {
            Some(session) if healthy && !closed => slot.idle.push((id, session)),
            Some(session) => {
                debug!(backend = %backend, connection = %id, "Evicting connection");
                drop(session);
            }
            None => debug!(backend = %backend, connection = %id, "Connection abandoned"),
        }

        if !closed {
            self.pump(&backend);
        }
    }

    fn on_opened(&mut self, backend: String, result: Result<Box<dyn DriverSession>, String>) {
        let closed = self.closed;
        let Some(slot) = self.backends.get_mut(&backend) else {
            return;
        };
        slot.opening = slot.opening.saturating_sub(1);

        match result {
            Ok(session) if !closed => {
                let id = ConnectionId(self.next_id);
                self.next_id += 1;
                debug!(backend = %backend, connection = %id, "Opened connection");
                slot.idle.push((id, session));
            }
            Ok(_) => {}
            Err(reason) => {
                slot.prune_waiters();
                if let Some(waiter) = slot.waiters.pop_front() {
                    warn!(backend = %backend, reason = %reason, "Backend unavailable");
                    let _ = waiter.send(Err(unavailable(&backend, reason)));
                }
            }
        }

        if !closed {
            self.pump(&backend);
        }
    }

    /// Match idle connections with waiters, then open new connections for
    /// waiters that are still unserved.
    fn pump(&mut self, backend: &str) {
        let tx = self.tx.upgrade();
        let Some(slot) = self.backends.get_mut(backend) else {
            return;
        };
        slot.prune_waiters();

        while !slot.waiters.is_empty() && !slot.idle.is_empty() {
            let Some(tx) = tx.as_ref() else { return };
            let (Some(waiter), Some((id, session))) = (slot.waiters.pop_front(), slot.idle.pop())
            else {
                break;
            };
            slot.checked_out.insert(id);
            let guard = PooledConnection {
                id,
                backend: backend.to_string(),
                session: Some(session),
                healthy: true,
                returned: false,
                tx: tx.clone(),
            };
            if let Err(Ok(guard)) = waiter.send(Ok(guard)) {
                // Waiter gave up between pruning and now.
                let (id, session) = guard.into_parts();
                slot.checked_out.remove(&id);
                if let Some(session) = session {
                    slot.idle.push((id, session));
                }
            }
        }

        while slot.opening < slot.waiters.len() && slot.open_count() < slot.capacity {
            let Some(tx) = tx.clone() else { return };
            slot.opening += 1;
            let driver = Arc::clone(&slot.driver);
            let init_sql = Arc::clone(&slot.init_sql);
            let budget = slot.retry_budget;
            let name = backend.to_string();
            tokio::task::spawn_blocking(move || {
                let result = open_with_retry(driver.as_ref(), &init_sql, budget, &name);
                let _ = tx.send(PoolRequest::Opened {
                    backend: name,
                    result,
                });
            });
        }
    }
}

/// Open a session, retrying up to `budget` times, and run the backend's
/// connection init statements on it.
fn open_with_retry(
    driver: &dyn Driver,
    init_sql: &[String],
    budget: u32,
    backend: &str,
) -> Result<Box<dyn DriverSession>, String> {
    let mut last_error = String::from("no connect attempt made");

    for attempt in 1..=budget {
        match driver.connect() {
            Ok(mut session) => {
                let init = init_sql
                    .iter()
                    .try_for_each(|sql| session.execute(sql, &[]).map(|_| ()));
                match init {
                    Ok(()) => return Ok(session),
                    Err(e) => {
                        warn!(backend = %backend, attempt, error = %e.describe(), "Connection init failed");
                        last_error = format!("init statement failed: {}", e.describe());
                    }
                }
            }
            Err(e) => {
                warn!(backend = %backend, attempt, error = %e.describe(), "Connect failed");
                last_error = e.describe();
            }
        }
        if attempt < budget {
            std::thread::sleep(RETRY_BACKOFF * attempt);
        }
    }

    Err(format!("{} (after {} attempts)", last_error, budget))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimDriver, SqlValue};
    use crate::config::DriverConfig;
    use std::time::Instant;

    /// A 50ms acquire against an exhausted or unavailable backend must be
    /// answered within this bound.
    const FAILURE_REPORT_BOUND: Duration = Duration::from_millis(100);

    fn sim_backend(name: &str, pool_size: usize) -> (BackendConfig, Arc<SimDriver>) {
        let config = BackendConfig::new(
            name,
            DriverConfig::Sim {
                latency_ms: 0,
                refuse_connections: false,
            },
        )
        .with_pool_size(pool_size);
        (config, Arc::new(SimDriver::new(Duration::ZERO)))
    }

    fn pool_with(backends: Vec<(BackendConfig, Arc<SimDriver>)>) -> ConnectionPool {
        let entries = backends
            .into_iter()
            .map(|(c, d)| (c, d as Arc<dyn Driver>))
            .collect();
        ConnectionPool::with_drivers(entries, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_acquire_and_reuse() {
        let (config, driver) = sim_backend("main", 1);
        let pool = pool_with(vec![(config, Arc::clone(&driver))]);

        let conn = pool.acquire("main", Duration::from_secs(1)).await.unwrap();
        let first = conn.id();
        conn.release(true);

        let conn = pool.acquire("main", Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.id(), first, "healthy connection should be reused");
        assert_eq!(driver.stats().connects(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_release_evicts_and_reopens() {
        let (config, driver) = sim_backend("main", 1);
        let pool = pool_with(vec![(config, Arc::clone(&driver))]);

        let mut conn = pool.acquire("main", Duration::from_secs(1)).await.unwrap();
        let first = conn.id();
        conn.mark_unhealthy();
        drop(conn);

        let conn = pool.acquire("main", Duration::from_secs(1)).await.unwrap();
        assert_ne!(conn.id(), first);
        assert_eq!(driver.stats().connects(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let (config, _driver) = sim_backend("main", 1);
        let pool = pool_with(vec![(config, _driver)]);

        let _held = pool.acquire("main", Duration::from_secs(1)).await.unwrap();

        let start = Instant::now();
        let err = pool
            .acquire("main", Duration::from_millis(50))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, WeaverError::PoolExhausted { .. }), "got {err:?}");
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < FAILURE_REPORT_BOUND, "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_refused_backend_is_unavailable() {
        let (config, driver) = sim_backend("main", 2);
        driver.set_refuse_connections(true);
        let pool = pool_with(vec![(config.with_retry_budget(2), Arc::clone(&driver))]);

        let start = Instant::now();
        let err = pool
            .acquire("main", Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(
            matches!(
                err,
                WeaverError::BackendUnavailable { .. } | WeaverError::PoolExhausted { .. }
            ),
            "got {err:?}"
        );
        // Two attempts with one 10ms backoff; the refusal beats the timer.
        let elapsed = start.elapsed();
        assert!(elapsed < FAILURE_REPORT_BOUND, "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_backend_recovers_after_refusal() {
        let (config, driver) = sim_backend("main", 1);
        driver.set_refuse_connections(true);
        let pool = pool_with(vec![(config.with_retry_budget(1), Arc::clone(&driver))]);

        assert!(pool.acquire("main", Duration::from_millis(200)).await.is_err());

        driver.set_refuse_connections(false);
        let conn = pool.acquire("main", Duration::from_millis(200)).await;
        assert!(conn.is_ok(), "fresh acquire should get a fresh retry budget");
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let (config, driver) = sim_backend("main", 1);
        let pool = pool_with(vec![(config, driver)]);

        let err = pool
            .acquire("other", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WeaverError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_pool_fails_fast() {
        let (config, driver) = sim_backend("main", 1);
        let cancel = CancellationToken::new();
        let pool = ConnectionPool::with_drivers(vec![(config, driver as Arc<dyn Driver>)], cancel.clone());

        let _held = pool.acquire("main", Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("main", Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire must not hang after cancel")
            .unwrap();
        assert_eq!(result.unwrap_err(), WeaverError::Cancelled);

        let again = pool.acquire("main", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(again, WeaverError::Cancelled);
    }

    #[tokio::test]
    async fn test_init_sql_runs_on_open() {
        let (config, driver) = sim_backend("main", 1);
        let config = config.with_init_sql("SET something = 1");
        let pool = pool_with(vec![(config, Arc::clone(&driver))]);

        let _conn = pool.acquire("main", Duration::from_secs(1)).await.unwrap();
        assert_eq!(driver.stats().executed(), 1);
    }

    #[tokio::test]
    async fn test_failing_init_sql_makes_backend_unavailable() {
        let (config, driver) = sim_backend("main", 1);
        let config = config.with_init_sql("FAIL init").with_retry_budget(1);
        let pool = pool_with(vec![(config, driver)]);

        let err = pool.acquire("main", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, WeaverError::BackendUnavailable { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_stats_and_shutdown() {
        let (config, driver) = sim_backend("main", 3);
        let pool = pool_with(vec![(config, driver)]);

        let a = pool.acquire("main", Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire("main", Duration::from_secs(1)).await.unwrap();
        drop(a);

        // Release is asynchronous; stats are served after it by the same actor.
        let stats = pool.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].capacity, 3);
        assert_eq!(stats[0].checked_out, 1);
        assert_eq!(stats[0].idle, 1);

        pool.shutdown().await;
        drop(b);
        let err = pool.acquire("main", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, WeaverError::BackendUnavailable { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_connection_is_held_twice() {
        let (config, driver) = sim_backend("main", 3);
        let pool = pool_with(vec![(config, driver)]);
        let held = Arc::new(parking_lot::Mutex::new(HashSet::new()));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let held = Arc::clone(&held);
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let mut conn = pool.acquire("main", Duration::from_secs(5)).await.unwrap();
                    assert!(
                        held.lock().insert(conn.id()),
                        "{} handed out while already held",
                        conn.id()
                    );
                    let mut session = conn.take_session().unwrap();
                    session.execute("SELECT ?", &[SqlValue::Integer(1)]).unwrap();
                    conn.restore_session(session);
                    tokio::task::yield_now().await;
                    held.lock().remove(&conn.id());
                    conn.release(true);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = pool.stats().await;
        assert!(stats[0].idle <= 3);
    }
}
