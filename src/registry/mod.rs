//! Task registry: dedup, dynamic growth and quiescence detection
//!
//! All work in a run is a task owned by this registry. Tasks are keyed by
//! (kind, key); submitting a key that already exists is a no-op, which is
//! what makes pings at-most-once per run. Any running task may submit more
//! work at any time; the registry counts submissions and completions and
//! wakes `await_quiescent` callers exactly when the two counters meet.
//!
//! The counter pair is correct under the race where a completing task
//! submits children just before finishing: both the child's submission and
//! the parent's completion go through the same mutex, and a task's body
//! runs its submissions before the registry records its completion, so the
//! counters can never transiently claim quiescence while work is pending.
//!
//! A task's failure never cancels peers; it is counted and surfaced in the
//! process exit status after the run drains.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Notify;

/// The kinds of work a run is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Fetch and process a feed document
    Feed,
    /// Fetch and process an entry page
    Entry,
    /// POST a publish notification to a WebSub hub
    WebSubPing,
    /// Discover a webmention endpoint and POST to it
    WebmentionPing,
    /// Ask the Wayback Machine to archive a target
    WaybackSave,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Feed => "feed",
            Self::Entry => "entry",
            Self::WebSubPing => "websub-ping",
            Self::WebmentionPing => "webmention-ping",
            Self::WaybackSave => "wayback-save",
        };
        f.write_str(name)
    }
}

/// Boxed task body; boxing breaks the recursive future types that arise
/// from tasks submitting tasks of their own kind
pub type TaskFuture = Pin<Box<dyn Future<Output = crate::Result<()>> + Send + 'static>>;

#[derive(Default)]
struct Counters {
    seen: HashSet<(TaskKind, String)>,
    submitted: u64,
    completed: u64,
    failed: u64,
}

/// Registry of every task in the current run
pub struct TaskRegistry {
    counters: StdMutex<Counters>,
    notify: Notify,
    cancelled: AtomicBool,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: StdMutex::new(Counters::default()),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Submits a task, spawning it unless its key was already submitted
    ///
    /// Returns true when the task was actually spawned. Duplicate keys and
    /// submissions after cancellation return false without side effects.
    pub fn submit(self: &Arc<Self>, kind: TaskKind, key: impl Into<String>, task: TaskFuture) -> bool {
        let key = key.into();

        if self.cancelled.load(Ordering::Acquire) {
            tracing::debug!("Dropping {} task for {} (cancelled)", kind, key);
            return false;
        }

        {
            let mut counters = self.counters.lock().expect("task counters poisoned");
            if !counters.seen.insert((kind, key.clone())) {
                tracing::debug!("Skipping already submitted {} task for {}", kind, key);
                return false;
            }
            counters.submitted += 1;
        }

        tracing::debug!("Submitted {} task for {}", kind, key);

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let result = task.await;
            registry.complete(kind, &key, result);
        });

        true
    }

    fn complete(&self, kind: TaskKind, key: &str, result: crate::Result<()>) {
        let quiescent = {
            let mut counters = self.counters.lock().expect("task counters poisoned");
            counters.completed += 1;
            if let Err(err) = &result {
                counters.failed += 1;
                tracing::warn!("{} task failed for {}: {}", kind, key, err);
            } else {
                tracing::debug!("Completed {} task for {}", kind, key);
            }
            counters.completed == counters.submitted
        };

        if quiescent {
            self.notify.notify_waiters();
        }
    }

    /// Waits until every transitively submitted task reached a terminal state
    ///
    /// Returns immediately when nothing was ever submitted.
    pub async fn await_quiescent(&self) {
        loop {
            // Register interest before checking, so a completion between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            {
                let counters = self.counters.lock().expect("task counters poisoned");
                if counters.submitted == counters.completed {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Stops admission of new tasks; in-flight tasks finish on their own
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        tracing::info!("Cancellation requested; no new tasks will be admitted");
    }

    /// True once `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Number of tasks that reported failure so far
    pub fn failures(&self) -> u64 {
        self.counters.lock().expect("task counters poisoned").failed
    }

    /// Number of tasks submitted so far (including completed ones)
    pub fn submitted(&self) -> u64 {
        self.counters
            .lock()
            .expect("task counters poisoned")
            .submitted
    }
}
