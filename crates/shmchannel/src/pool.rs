//! Idle connection pools.
//!
//! Each destination has one [`ConnectionPool`], a stack of idle client
//! connections. A [`PoolRegistry`] owns the pools of one channel and runs a
//! sweeper thread that evicts connections idle for longer than the
//! staleness threshold.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::connection::DuplexConnection;

/// Shortest interval the sweeper runs at.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Idle connections to one destination, most recently returned first.
#[derive(Debug)]
pub struct ConnectionPool {
    destination: String,
    idle: Mutex<Vec<DuplexConnection>>,
}

impl ConnectionPool {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Take the most recently returned idle connection.
    pub fn obtain(&self) -> Option<DuplexConnection> {
        self.idle.lock().pop()
    }

    /// Park a connection that finished its transaction.
    pub fn return_to_pool(&self, connection: DuplexConnection) {
        connection.update_last_accessed();
        self.idle.lock().push(connection);
    }

    /// Close every idle connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.idle.lock());
        let count = drained.len();
        drop(drained);
        if count > 0 {
            tracing::debug!(destination = %self.destination, count, "flushed connection pool");
        }
        count
    }

    /// Close connections idle for longer than `threshold`.
    pub fn close_stale(&self, threshold: Duration) -> usize {
        let stale: Vec<DuplexConnection> = {
            let mut idle = self.idle.lock();
            let (stale, fresh) = std::mem::take(&mut *idle)
                .into_iter()
                .partition(|c| c.is_stale(threshold));
            *idle = fresh;
            stale
        };
        let count = stale.len();
        if count > 0 {
            tracing::debug!(destination = %self.destination, count, "evicted stale connections");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.idle.lock().is_empty()
    }
}

#[derive(Debug)]
struct RegistryShared {
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
    stale_after: Duration,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl RegistryShared {
    fn sweep(&self) -> usize {
        let pools: Vec<Arc<ConnectionPool>> = self.pools.lock().values().cloned().collect();
        pools
            .iter()
            .map(|pool| pool.close_stale(self.stale_after))
            .sum()
    }
}

/// The pools of one channel, keyed by destination.
#[derive(Debug)]
pub struct PoolRegistry {
    shared: Arc<RegistryShared>,
    sweeper: Option<JoinHandle<()>>,
}

impl PoolRegistry {
    /// A registry whose sweeper runs every `stale_after`.
    pub fn new(stale_after: Duration) -> Self {
        let mut registry = Self::without_sweeper(stale_after);
        let shared = registry.shared.clone();
        match std::thread::Builder::new()
            .name("shm-pool-sweeper".into())
            .spawn(move || run_sweeper(shared))
        {
            Ok(handle) => registry.sweeper = Some(handle),
            Err(e) => tracing::warn!(error = %e, "failed to spawn pool sweeper"),
        }
        registry
    }

    /// A registry that only sweeps when [`sweep`](Self::sweep) is called.
    pub fn without_sweeper(stale_after: Duration) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                pools: Mutex::new(HashMap::new()),
                stale_after,
                stopped: Mutex::new(false),
                wake: Condvar::new(),
            }),
            sweeper: None,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.shared.stale_after
    }

    /// The pool for `destination`, created on first use.
    pub fn lookup(&self, destination: &str) -> Arc<ConnectionPool> {
        self.shared
            .pools
            .lock()
            .entry(destination.to_owned())
            .or_insert_with(|| Arc::new(ConnectionPool::new(destination)))
            .clone()
    }

    /// Evict stale connections from every pool now.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    pub fn close_all(&self) {
        let pools: Vec<Arc<ConnectionPool>> =
            self.shared.pools.lock().values().cloned().collect();
        for pool in pools {
            pool.close_all();
        }
    }
}

fn run_sweeper(shared: Arc<RegistryShared>) {
    let interval = shared.stale_after.max(MIN_SWEEP_INTERVAL);
    let mut stopped = shared.stopped.lock();
    while !*stopped {
        let timed_out = shared.wake.wait_for(&mut stopped, interval).timed_out();
        if timed_out && !*stopped {
            MutexGuard::unlocked(&mut stopped, || {
                shared.sweep();
            });
        }
    }
    tracing::trace!("pool sweeper stopped");
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
        }
        self.close_all();
    }
}
