//! Outbound request concurrency limits
//!
//! A global semaphore caps simultaneous requests across the whole process;
//! a lazily-created semaphore per host keeps any single origin from being
//! hammered. Acquisition order is global first, then host, so permit
//! holders always make progress and waiters are served FIFO.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Combined global + per-host request limiter
pub struct HostLimiter {
    global: Arc<Semaphore>,
    hosts: StdMutex<HashMap<String, Arc<Semaphore>>>,
    per_host: usize,
}

/// Permit pair held for the duration of one HTTP request
///
/// Dropping it releases both slots. A task holds at most one of these at a
/// time; submission of new work never happens while holding one.
pub struct RequestPermit {
    _global: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

impl HostLimiter {
    /// Creates a limiter with the given caps; `per_host` of 0 means unlimited
    pub fn new(max_connections: usize, max_per_host: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_connections.max(1))),
            hosts: StdMutex::new(HashMap::new()),
            per_host: max_per_host,
        }
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let permits = if self.per_host == 0 {
            Semaphore::MAX_PERMITS
        } else {
            self.per_host
        };
        let mut hosts = self.hosts.lock().expect("host semaphore map poisoned");
        Arc::clone(
            hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(permits))),
        )
    }

    /// Waits for a request slot against the given host
    pub async fn acquire(&self, host: &str) -> RequestPermit {
        let host_semaphore = self.host_semaphore(host);
        let global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .expect("Semaphore closed");
        let host = host_semaphore
            .acquire_owned()
            .await
            .expect("Semaphore closed");
        RequestPermit {
            _global: global,
            _host: host,
        }
    }
}
