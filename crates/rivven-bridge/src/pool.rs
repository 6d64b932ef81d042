//! Connection manager for rivven-bridge
//!
//! A bounded pool of backend sessions with:
//! - Semaphore-based admission (waiters park until a release or the timeout)
//! - Arena ownership: connections live in indexed slots, callers hold
//!   [`Lease`] tokens and check the connection out through the manager
//! - Lazy creation with optional warm-up and retry with exponential backoff
//! - Recycling of expired idle connections and validation of stale ones
//! - Metrics and observability
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_bridge::pool::{ConnectionManager, PoolConfig};
//!
//! let pool = ConnectionManager::new(provider, factory, PoolConfig::new(4)).await?;
//! let lease = pool.acquire(Duration::from_secs(1)).await?;
//! let conn = pool.checkout(&lease)?;
//! conn.query("SELECT 1", &[]).await?;
//! pool.release(lease).await;
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::config::ProviderConfig;
use crate::connection::{Connection, ConnectionFactory};
use crate::error::{Error, ErrorCategory, Result};

/// Retry policy for opening backend connections
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Backoff growth factor
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set max retries
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set max delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Set jitter factor
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given attempt (attempt 0 runs immediately)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        // Jitter is derived from the attempt number
        let jitter = capped * self.jitter_factor * ((attempt as f64 * 0.618_033_988_7) % 1.0);
        let total = (capped + jitter).min(self.max_delay.as_millis() as f64);

        Duration::from_millis(total as u64)
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections
    pub max_size: u32,
    /// Connections opened eagerly at startup
    pub min_idle: u32,
    /// Default acquire timeout
    pub acquire_timeout: Duration,
    /// Timeout for a single connect attempt
    pub connect_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Option<Duration>,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Option<Duration>,
    /// Idle connections not validated within this window are checked on acquire
    pub validation_interval: Duration,
    /// Connect retry policy
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            min_idle: 0,
            acquire_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
            idle_timeout: Some(Duration::from_secs(600)),  // 10 minutes
            validation_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Create a pool config with the given maximum size
    pub fn new(max_size: u32) -> Self {
        Self {
            max_size: max_size.max(1),
            ..Default::default()
        }
    }

    /// Set eager connections
    pub fn with_min_idle(mut self, min_idle: u32) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set validation interval
    pub fn with_validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed or discarded
    pub connections_closed: u64,
    /// Total number of successful acquisitions
    pub acquisitions: u64,
    /// Number of acquires that timed out
    pub exhausted_count: u64,
    /// Total wait time for leases (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of failed validations
    pub health_check_failures: u64,
    /// Number of connect retries
    pub retries: u64,
    /// Live connections right now
    pub open_connections: u32,
    /// Idle connections right now
    pub idle_connections: u32,
    /// Leases currently held
    pub in_use: u32,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub health_check_failures: AtomicU64,
    pub retries: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connect retry
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }
}

/// A live connection in its arena slot
struct Entry {
    conn: Arc<dyn Connection>,
    generation: u64,
    created_at: Instant,
    last_used: Instant,
    last_validated: Instant,
    leased: bool,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Entry>>,
    /// Slot indices of idle connections (LIFO)
    idle: Vec<usize>,
    next_generation: u64,
}

impl Arena {
    fn live(&self) -> u32 {
        self.slots.iter().filter(|s| s.is_some()).count() as u32
    }

    fn leased(&self) -> u32 {
        self.slots
            .iter()
            .flatten()
            .filter(|e| e.leased)
            .count() as u32
    }

    fn insert(&mut self, conn: Arc<dyn Connection>, leased: bool) -> (usize, u64) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let now = Instant::now();
        let entry = Entry {
            conn,
            generation,
            created_at: now,
            last_used: now,
            last_validated: now,
            leased,
        };

        let slot = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(entry);
                free
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        if !leased {
            self.idle.push(slot);
        }
        (slot, generation)
    }

    fn entry_mut(&mut self, slot: usize, generation: u64) -> Option<&mut Entry> {
        self.slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .filter(|e| e.generation == generation)
    }

    fn remove(&mut self, slot: usize, generation: u64) -> Option<Arc<dyn Connection>> {
        self.entry_mut(slot, generation)?;
        self.idle.retain(|&i| i != slot);
        self.slots[slot].take().map(|e| e.conn)
    }

    fn make_idle(&mut self, slot: usize, generation: u64) -> bool {
        match self.entry_mut(slot, generation) {
            Some(entry) => {
                entry.leased = false;
                entry.last_used = Instant::now();
                self.idle.push(slot);
                true
            }
            None => false,
        }
    }
}

struct Shared {
    arena: Mutex<Arena>,
    semaphore: Arc<Semaphore>,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
}

impl Shared {
    fn discard(&self, slot: usize, generation: u64) -> Option<Arc<dyn Connection>> {
        let conn = self.arena.lock().remove(slot, generation);
        if conn.is_some() {
            self.stats.record_closed();
        }
        conn
    }
}

/// An idle slot marked leased by `acquire` before its [`Lease`] exists.
///
/// Dropped armed (the acquire future was cancelled mid-validation), the
/// connection is discarded since its session state is unknown.
struct PendingSlot<'a> {
    shared: &'a Shared,
    slot: usize,
    generation: u64,
    armed: bool,
}

impl PendingSlot<'_> {
    fn disarm(mut self) -> (usize, u64) {
        self.armed = false;
        (self.slot, self.generation)
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        trace!(slot = self.slot, "Acquire cancelled, discarding connection");
        if let Some(conn) = self.shared.discard(self.slot, self.generation) {
            close_detached(conn);
        }
    }
}

/// Close a connection without awaiting, when a runtime is around
fn close_detached(conn: Arc<dyn Connection>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let _ = conn.close().await;
        });
    }
}

/// Token for one checked-out connection.
///
/// The connection itself stays owned by the pool; use
/// [`ConnectionManager::checkout`] to reach it. Dropping a lease idle returns
/// the connection, dropping it with a statement in flight discards it.
pub struct Lease {
    slot: usize,
    generation: u64,
    in_flight: AtomicBool,
    settled: bool,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Arena slot of the leased connection
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Generation of the leased connection
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mark a statement as sent on this connection
    pub fn begin_statement(&self) {
        self.in_flight.store(true, Ordering::Release);
    }

    /// Mark the current statement as fully consumed
    pub fn end_statement(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    /// Whether a statement is in flight
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.is_in_flight() || self.shared.shutdown.load(Ordering::Acquire) {
            trace!(slot = self.slot, "Discarding connection of dropped lease");
            if let Some(conn) = self.shared.discard(self.slot, self.generation) {
                close_detached(conn);
            }
        } else {
            self.shared.arena.lock().make_idle(self.slot, self.generation);
        }
    }
}

/// Bounded pool of backend sessions
pub struct ConnectionManager {
    provider: ProviderConfig,
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a connection manager, opening `min_idle` connections eagerly
    pub async fn new(
        provider: ProviderConfig,
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
    ) -> Result<Self> {
        let manager = Self {
            shared: Arc::new(Shared {
                arena: Mutex::new(Arena::default()),
                semaphore: Arc::new(Semaphore::new(config.max_size as usize)),
                stats: AtomicPoolStats::new(),
                shutdown: AtomicBool::new(false),
            }),
            provider,
            factory,
            config,
        };

        let warm = manager.config.min_idle.min(manager.config.max_size);
        if warm > 0 {
            let _permits = manager
                .shared
                .semaphore
                .acquire_many(warm)
                .await
                .map_err(|_| Error::pool_exhausted("pool is closed"))?;
            for _ in 0..warm {
                let conn = manager.open().await?;
                manager.shared.arena.lock().insert(conn, false);
            }
        }

        info!(
            target_url = %manager.provider.redacted_url(),
            max_size = manager.config.max_size,
            min_idle = warm,
            "Connection pool ready"
        );
        Ok(manager)
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Backend target
    pub fn provider_config(&self) -> &ProviderConfig {
        &self.provider
    }

    /// Acquire a lease with the configured default timeout
    pub async fn acquire_default(&self) -> Result<Lease> {
        self.acquire(self.config.acquire_timeout).await
    }

    /// Acquire a lease, waiting at most `timeout` for a free connection
    pub async fn acquire(&self, timeout: Duration) -> Result<Lease> {
        if self.is_closed() {
            return Err(Error::pool_exhausted("pool is closed"));
        }

        let start = Instant::now();
        let permit =
            match tokio::time::timeout(timeout, self.shared.semaphore.clone().acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(Error::pool_exhausted("pool is closed")),
                Err(_) => {
                    self.shared.stats.record_exhausted();
                    debug!(timeout_ms = timeout.as_millis() as u64, "Pool exhausted");
                    return Err(Error::pool_exhausted(format!(
                        "no connection available within {}ms",
                        timeout.as_millis()
                    )));
                }
            };

        loop {
            let (candidate, expired) = self.take_idle();
            for conn in expired {
                let _ = conn.close().await;
            }

            let (slot, generation) = match candidate {
                Some((pending, conn, needs_validation)) => {
                    if needs_validation {
                        if !conn.is_valid().await {
                            warn!(slot = pending.slot, "Idle connection failed validation, discarding");
                            self.shared.stats.record_health_check_failure();
                            let (slot, generation) = pending.disarm();
                            if let Some(conn) = self.shared.discard(slot, generation) {
                                let _ = conn.close().await;
                            }
                            continue;
                        }
                        if let Some(entry) = self
                            .shared
                            .arena
                            .lock()
                            .entry_mut(pending.slot, pending.generation)
                        {
                            entry.last_validated = Instant::now();
                        }
                    }
                    pending.disarm()
                }
                None => {
                    let conn = self.open().await?;
                    self.shared.arena.lock().insert(conn, true)
                }
            };

            let wait_ms = start.elapsed().as_millis() as u64;
            self.shared.stats.record_acquisition(wait_ms);
            trace!(slot, generation, wait_ms, "Lease acquired");

            return Ok(Lease {
                slot,
                generation,
                in_flight: AtomicBool::new(false),
                settled: false,
                shared: self.shared.clone(),
                _permit: permit,
            });
        }
    }

    /// Pop an idle connection, recycling expired ones along the way
    #[allow(clippy::type_complexity)]
    fn take_idle(
        &self,
    ) -> (
        Option<(PendingSlot<'_>, Arc<dyn Connection>, bool)>,
        Vec<Arc<dyn Connection>>,
    ) {
        let mut arena = self.shared.arena.lock();
        let mut expired = Vec::new();

        while let Some(slot) = arena.idle.pop() {
            let Some(entry) = arena.slots[slot].as_mut() else {
                continue;
            };
            let too_old = self
                .config
                .max_lifetime
                .is_some_and(|max| entry.created_at.elapsed() > max);
            let too_idle = self
                .config
                .idle_timeout
                .is_some_and(|max| entry.last_used.elapsed() > max);

            if too_old || too_idle {
                debug!(slot, too_old, too_idle, "Recycling idle connection");
                if let Some(entry) = arena.slots[slot].take() {
                    expired.push(entry.conn);
                    self.shared.stats.record_closed();
                }
                continue;
            }

            entry.leased = true;
            let needs_validation = entry.last_validated.elapsed() >= self.config.validation_interval;
            let pending = PendingSlot {
                shared: &self.shared,
                slot,
                generation: entry.generation,
                armed: true,
            };
            return (Some((pending, entry.conn.clone(), needs_validation)), expired);
        }

        (None, expired)
    }

    /// Open a connection, retrying connection-level failures with backoff
    async fn open(&self) -> Result<Arc<dyn Connection>> {
        let retry = &self.config.retry;
        let mut attempt = 0;

        loop {
            let delay = retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let result =
                match tokio::time::timeout(self.config.connect_timeout, self.factory.connect(&self.provider))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!(
                        "connect timed out after {}ms",
                        self.config.connect_timeout.as_millis()
                    ))),
                };

            match result {
                Ok(conn) => {
                    self.shared.stats.record_created();
                    debug!(attempt, provider = %self.factory.provider(), "Opened backend connection");
                    return Ok(Arc::from(conn));
                }
                Err(e) if is_transient(&e) && attempt < retry.max_retries => {
                    attempt += 1;
                    self.shared.stats.record_retry();
                    warn!(attempt, error = %e, "Connect failed, retrying");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Connect failed");
                    return Err(e);
                }
            }
        }
    }

    /// Reach the connection behind a lease
    pub fn checkout(&self, lease: &Lease) -> Result<Arc<dyn Connection>> {
        if !Arc::ptr_eq(&lease.shared, &self.shared) {
            return Err(Error::protocol("lease belongs to a different pool"));
        }
        let mut arena = self.shared.arena.lock();
        match arena.entry_mut(lease.slot, lease.generation) {
            Some(entry) if entry.leased => Ok(entry.conn.clone()),
            _ => Err(Error::protocol(format!(
                "stale lease for slot {} (generation {})",
                lease.slot, lease.generation
            ))),
        }
    }

    /// Return a lease, keeping its connection if it still answers
    pub async fn release(&self, mut lease: Lease) {
        if lease.is_in_flight() {
            self.invalidate(lease).await;
            return;
        }
        lease.settled = true;

        let conn = match self.checkout(&lease) {
            Ok(conn) => conn,
            Err(_) => return,
        };

        if self.is_closed() || !conn.is_valid().await {
            if !self.is_closed() {
                self.shared.stats.record_health_check_failure();
                warn!(slot = lease.slot, "Released connection is dead, discarding");
            }
            if let Some(conn) = self.shared.discard(lease.slot, lease.generation) {
                let _ = conn.close().await;
            }
            return;
        }

        let mut arena = self.shared.arena.lock();
        if let Some(entry) = arena.entry_mut(lease.slot, lease.generation) {
            entry.last_validated = Instant::now();
        }
        arena.make_idle(lease.slot, lease.generation);
        trace!(slot = lease.slot, "Lease released");
    }

    /// Close the connection behind a lease and open a replacement into the
    /// idle set
    pub async fn invalidate(&self, mut lease: Lease) {
        lease.settled = true;
        if let Some(conn) = self.shared.discard(lease.slot, lease.generation) {
            debug!(slot = lease.slot, "Invalidating connection");
            let _ = conn.close().await;
        }
        if self.is_closed() {
            return;
        }

        // The lease's permit is still held, so the replacement fits under max
        match self.open().await {
            Ok(conn) => {
                self.shared.arena.lock().insert(conn, false);
            }
            Err(e) => warn!(error = %e, "Could not replace invalidated connection"),
        }
    }

    /// Whether the pool has been shut down
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Snapshot pool statistics
    pub fn stats(&self) -> PoolStats {
        let mut stats = self.shared.stats.snapshot();
        let arena = self.shared.arena.lock();
        stats.open_connections = arena.live();
        stats.idle_connections = arena.idle.len() as u32;
        stats.in_use = arena.leased();
        stats
    }

    /// Average acquire wait
    pub fn avg_wait_time_ms(&self) -> f64 {
        self.shared.stats.avg_wait_time_ms()
    }

    /// Close all idle connections and refuse further acquires.
    ///
    /// Leased connections are closed when their lease comes back.
    pub async fn close(&self) -> Result<()> {
        for conn in self.begin_shutdown() {
            let _ = conn.close().await;
        }
        info!("Connection pool closed");
        Ok(())
    }

    /// Synchronous shutdown for drop paths
    pub fn shutdown_now(&self) {
        for conn in self.begin_shutdown() {
            close_detached(conn);
        }
    }

    fn begin_shutdown(&self) -> Vec<Arc<dyn Connection>> {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        self.shared.semaphore.close();

        let mut arena = self.shared.arena.lock();
        let idle: Vec<usize> = arena.idle.drain(..).collect();
        let closing: Vec<_> = idle
            .into_iter()
            .filter_map(|slot| arena.slots[slot].take().map(|e| e.conn))
            .collect();
        for _ in &closing {
            self.shared.stats.record_closed();
        }
        closing
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("provider", &self.provider)
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Failures worth another connect attempt
fn is_transient(error: &Error) -> bool {
    matches!(
        error.category(),
        ErrorCategory::Connection | ErrorCategory::Timeout
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_multiplier(2.0)
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_policy_jitter_is_bounded() {
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(0.5);

        for attempt in 1..8 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay <= policy.max_delay);
            assert!(delay >= Duration::from_millis(100));
        }
        assert_eq!(policy.delay_for_attempt(3), policy.delay_for_attempt(3));
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new(0)
            .with_min_idle(2)
            .with_acquire_timeout(Duration::from_secs(10))
            .with_idle_timeout(None)
            .with_retry(RetryPolicy::none());

        assert_eq!(config.max_size, 1);
        assert_eq!(config.min_idle, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.retry.max_retries, 0);
    }

    #[test]
    fn test_atomic_pool_stats() {
        let stats = AtomicPoolStats::new();

        stats.record_created();
        stats.record_created();
        stats.record_acquisition(100);
        stats.record_acquisition(200);
        stats.record_closed();
        stats.record_exhausted();
        stats.record_health_check_failure();
        stats.record_retry();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_created, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.acquisitions, 2);
        assert_eq!(snapshot.total_wait_time_ms, 300);
        assert_eq!(snapshot.exhausted_count, 1);
        assert_eq!(snapshot.health_check_failures, 1);
        assert_eq!(snapshot.retries, 1);

        assert!((stats.avg_wait_time_ms() - 150.0).abs() < 0.01);
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&Error::connection("refused")));
        assert!(is_transient(&Error::timeout("connect")));
        assert!(!is_transient(&Error::authentication("bad password")));
        assert!(!is_transient(&Error::config("bad url")));
    }
}
