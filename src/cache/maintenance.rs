//! Background maintenance for the persistent search tier.
//!
//! Hit-count increments and row-cap checks are queued instead of being run
//! on the read and write paths. The queue is bounded: when it is full a task
//! is dropped and counted. Each task runs at most once, so hit counts are
//! eventually consistent and may undercount; they are statistics only.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::lock::mutex_lock;

const SOURCE: &str = "cache::maintenance";

const METRIC_QUEUE_LEN: &str = "chunk_cache_maintenance_queue_len";
const METRIC_DROPPED: &str = "chunk_cache_maintenance_dropped_total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceTask {
    /// A persistent row was served; bump its hit count.
    RecordHit { search_hash: String },
    /// A row was written; trim the table back to its cap if needed.
    EnforceCapacity,
}

/// Bounded FIFO of maintenance tasks with a wakeup for the worker.
pub struct MaintenanceQueue {
    queue: Mutex<VecDeque<MaintenanceTask>>,
    limit: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl MaintenanceQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueue a task without blocking. Returns false if the queue was full.
    pub fn publish(&self, task: MaintenanceTask) -> bool {
        let len = {
            let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
            if queue.len() >= self.limit {
                None
            } else {
                queue.push_back(task.clone());
                Some(queue.len())
            }
        };

        match len {
            Some(len) => {
                gauge!(METRIC_QUEUE_LEN).set(len as f64);
                debug!(task = ?task, queue_len = len, "Maintenance task enqueued");
                self.notify.notify_one();
                true
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_DROPPED).increment(1);
                warn!(task = ?task, limit = self.limit, "Maintenance queue full, task dropped");
                false
            }
        }
    }

    /// Drain up to `limit` tasks in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<MaintenanceTask> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let tasks: Vec<_> = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        tasks
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total tasks dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Resolves after the next publish (or immediately if one is pending).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// A batch of tasks merged into the statements to run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MaintenancePlan {
    /// Hit increments summed per hash.
    pub hit_increments: BTreeMap<String, u64>,
    /// Whether any write asked for a cap check.
    pub enforce_capacity: bool,
}

impl fmt::Display for MaintenancePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MaintenancePlan {{ hit_rows: {}, hits: {}, enforce_capacity: {} }}",
            self.hit_increments.len(),
            self.hit_increments.values().sum::<u64>(),
            self.enforce_capacity,
        )
    }
}

impl MaintenancePlan {
    pub fn from_tasks(tasks: Vec<MaintenanceTask>) -> Self {
        let mut plan = Self::default();
        for task in tasks {
            match task {
                MaintenanceTask::RecordHit { search_hash } => {
                    *plan.hit_increments.entry(search_hash).or_default() += 1;
                }
                MaintenanceTask::EnforceCapacity => plan.enforce_capacity = true,
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.hit_increments.is_empty() && !self.enforce_capacity
    }
}
