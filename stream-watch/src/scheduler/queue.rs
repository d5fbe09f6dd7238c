//! Work queue and batch dispatcher.
//!
//! Operations are queued per target key and executed in batches. Within a
//! batch, operations for the same key run sequentially in FIFO order inside
//! one task; different keys run concurrently. A `Stop` supersedes every
//! not-yet-executed operation queued before it for the same key.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::Result;
use crate::domain::TargetKey;

/// Kind of queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Start,
    Stop,
    RunOnce,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::RunOnce => "run_once",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deferred work carried by a queued operation.
pub type Action = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// An operation waiting in the queue.
pub struct QueuedOperation {
    pub id: Uuid,
    pub key: TargetKey,
    pub kind: OperationKind,
    action: Action,
}

impl QueuedOperation {
    pub fn new<F, Fut>(key: TargetKey, kind: OperationKind, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            key,
            kind,
            action: Box::new(move || action().boxed()),
        }
    }

    /// Execute the deferred work.
    pub async fn run(self) -> Result<()> {
        (self.action)().await
    }
}

impl std::fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

struct QueueState {
    pending: VecDeque<QueuedOperation>,
    accepting_starts: bool,
}

/// Multi-producer FIFO of per-target operations.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    draining: AtomicBool,
    drain_notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                accepting_starts: true,
            }),
            draining: AtomicBool::new(false),
            drain_notify: Notify::new(),
        }
    }

    /// Queue an operation.
    ///
    /// Returns `false` if the operation was rejected because the queue only
    /// accepts `Stop` operations (after [`WorkQueue::close_for_starts`]).
    pub fn enqueue(&self, op: QueuedOperation) -> bool {
        let mut state = self.state.lock();

        if op.kind != OperationKind::Stop && !state.accepting_starts {
            debug!(target_key = %op.key, kind = %op.kind, "Rejected operation, queue is closing");
            return false;
        }

        if op.kind == OperationKind::Stop {
            let before = state.pending.len();
            state
                .pending
                .retain(|queued| queued.key != op.key || queued.kind == OperationKind::Stop);
            let superseded = before - state.pending.len();
            if superseded > 0 {
                debug!(target_key = %op.key, superseded, "Stop superseded pending operations");
            }
        }

        trace!(target_key = %op.key, kind = %op.kind, id = %op.id, "Enqueued operation");
        state.pending.push_back(op);
        true
    }

    /// Remove up to `max` operations from the front of the queue.
    pub fn drain_batch(&self, max: usize) -> Vec<QueuedOperation> {
        let mut state = self.state.lock();
        let count = max.min(state.pending.len());
        state.pending.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Kinds of the operations pending for `key`, in queue order.
    pub fn pending_for(&self, key: &TargetKey) -> Vec<OperationKind> {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|op| &op.key == key)
            .map(|op| op.kind)
            .collect()
    }

    /// Stop accepting anything but `Stop` operations and drop the pending
    /// non-stop work. Returns the number of dropped operations.
    pub fn close_for_starts(&self) -> usize {
        let mut state = self.state.lock();
        state.accepting_starts = false;
        let before = state.pending.len();
        state
            .pending
            .retain(|op| op.kind == OperationKind::Stop);
        before - state.pending.len()
    }

    pub fn is_accepting_starts(&self) -> bool {
        self.state.lock().accepting_starts
    }

    /// Ask the dispatcher to exit once the queue is empty.
    pub fn request_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.drain_notify.notify_one();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters reported by a finished dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub batches: u64,
    pub executed: u64,
    pub failed: u64,
    pub panicked: u64,
}

impl DispatchStats {
    fn merge(&mut self, other: GroupOutcome) {
        self.executed += other.executed;
        self.failed += other.failed;
        self.panicked += other.panicked;
    }
}

#[derive(Debug, Default)]
struct GroupOutcome {
    executed: u64,
    failed: u64,
    panicked: u64,
}

/// Operations of one key taken from a batch, in FIFO order.
struct KeyGroup {
    key: TargetKey,
    ops: Vec<QueuedOperation>,
}

/// Group a batch by key, preserving first-seen key order and per-key FIFO.
fn group_by_key(batch: Vec<QueuedOperation>) -> Vec<KeyGroup> {
    let mut groups: Vec<KeyGroup> = Vec::new();
    for op in batch {
        match groups.iter_mut().find(|g| g.key == op.key) {
            Some(group) => group.ops.push(op),
            None => groups.push(KeyGroup {
                key: op.key.clone(),
                ops: vec![op],
            }),
        }
    }
    groups
}

async fn run_group(group: KeyGroup) -> GroupOutcome {
    let mut outcome = GroupOutcome::default();
    for op in group.ops {
        let (id, key, kind) = (op.id, op.key.clone(), op.kind);

        let result = AssertUnwindSafe(op.run()).catch_unwind().await;
        outcome.executed += 1;

        match result {
            Ok(Ok(())) => {
                trace!(target_key = %key, kind = %kind, id = %id, "Operation completed");
            }
            Ok(Err(e)) => {
                outcome.failed += 1;
                warn!(target_key = %key, kind = %kind, id = %id, error = %e, "Operation failed");
            }
            Err(_) => {
                outcome.panicked += 1;
                error!(target_key = %key, kind = %kind, id = %id, "Operation panicked");
            }
        }
    }
    outcome
}

/// Executes queued operations in bounded batches.
pub struct Dispatcher {
    queue: Arc<WorkQueue>,
    batch_size: usize,
    interval: Duration,
}

impl Dispatcher {
    pub fn new(queue: Arc<WorkQueue>, batch_size: usize, interval: Duration) -> Self {
        Self {
            queue,
            batch_size: batch_size.max(1),
            interval,
        }
    }

    /// Run until a drain is requested and the queue is empty.
    pub async fn run(self) -> DispatchStats {
        let mut stats = DispatchStats::default();
        info!(
            batch_size = self.batch_size,
            interval_ms = self.interval.as_millis() as u64,
            "Dispatcher started"
        );

        loop {
            let batch = self.queue.drain_batch(self.batch_size);
            if !batch.is_empty() {
                stats.batches += 1;
                self.execute_batch(batch, &mut stats).await;
            }

            if self.queue.is_draining() {
                if self.queue.is_empty() {
                    break;
                }
                // Drain without pausing between batches
                continue;
            }

            tokio::select! {
                _ = self.queue.drain_notify.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(
            batches = stats.batches,
            executed = stats.executed,
            failed = stats.failed,
            panicked = stats.panicked,
            "Dispatcher stopped"
        );
        stats
    }

    async fn execute_batch(&self, batch: Vec<QueuedOperation>, stats: &mut DispatchStats) {
        let groups = group_by_key(batch);
        debug!(groups = groups.len(), "Executing batch");

        let mut join_set = JoinSet::new();
        for group in groups {
            join_set.spawn(run_group(group));
        }

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(outcome) => stats.merge(outcome),
                Err(e) => {
                    stats.panicked += 1;
                    error!(error = %e, "Dispatch task failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::AtomicUsize;

    fn key(channel: &str) -> TargetKey {
        TargetKey::new("twitch", channel)
    }

    fn noop(channel: &str, kind: OperationKind) -> QueuedOperation {
        QueuedOperation::new(key(channel), kind, || async { Ok(()) })
    }

    fn recording(
        channel: &str,
        kind: OperationKind,
        log: &Arc<Mutex<Vec<String>>>,
        label: &str,
    ) -> QueuedOperation {
        let log = log.clone();
        let label = label.to_string();
        QueuedOperation::new(key(channel), kind, move || async move {
            log.lock().push(label);
            Ok(())
        })
    }

    #[test]
    fn test_stop_supersedes_pending_work() {
        let queue = WorkQueue::new();
        queue.enqueue(noop("a", OperationKind::Start));
        queue.enqueue(noop("b", OperationKind::Start));
        queue.enqueue(noop("a", OperationKind::RunOnce));
        queue.enqueue(noop("a", OperationKind::Stop));

        assert_eq!(queue.pending_for(&key("a")), vec![OperationKind::Stop]);
        assert_eq!(queue.pending_for(&key("b")), vec![OperationKind::Start]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_start_after_stop_is_kept() {
        let queue = WorkQueue::new();
        queue.enqueue(noop("a", OperationKind::Stop));
        queue.enqueue(noop("a", OperationKind::Start));

        assert_eq!(
            queue.pending_for(&key("a")),
            vec![OperationKind::Stop, OperationKind::Start]
        );
    }

    #[test]
    fn test_close_for_starts() {
        let queue = WorkQueue::new();
        queue.enqueue(noop("a", OperationKind::Start));
        queue.enqueue(noop("b", OperationKind::Stop));
        queue.enqueue(noop("c", OperationKind::RunOnce));

        assert_eq!(queue.close_for_starts(), 2);
        assert!(!queue.enqueue(noop("a", OperationKind::Start)));
        assert!(queue.enqueue(noop("a", OperationKind::Stop)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drain_batch_is_bounded_fifo() {
        let queue = WorkQueue::new();
        for i in 0..15 {
            queue.enqueue(noop(&format!("c{}", i), OperationKind::Start));
        }

        let batch = queue.drain_batch(10);
        assert_eq!(batch.len(), 10);
        assert_eq!(batch[0].key, key("c0"));
        assert_eq!(batch[9].key, key("c9"));
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_group_by_key_preserves_order() {
        let batch = vec![
            noop("a", OperationKind::Start),
            noop("b", OperationKind::Start),
            noop("a", OperationKind::RunOnce),
        ];
        let groups = group_by_key(batch);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, key("a"));
        assert_eq!(
            groups[0].ops.iter().map(|op| op.kind).collect::<Vec<_>>(),
            vec![OperationKind::Start, OperationKind::RunOnce]
        );
    }

    #[tokio::test]
    async fn test_dispatcher_runs_same_key_in_order() {
        let queue = Arc::new(WorkQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.enqueue(recording("a", OperationKind::Start, &log, "a1"));
        queue.enqueue(recording("a", OperationKind::RunOnce, &log, "a2"));
        queue.enqueue(recording("a", OperationKind::RunOnce, &log, "a3"));
        queue.request_drain();

        let stats = Dispatcher::new(queue.clone(), 10, Duration::from_millis(5))
            .run()
            .await;

        assert_eq!(*log.lock(), vec!["a1", "a2", "a3"]);
        assert_eq!(stats.executed, 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_survives_failures_and_panics() {
        let queue = Arc::new(WorkQueue::new());
        let done = Arc::new(AtomicUsize::new(0));

        queue.enqueue(QueuedOperation::new(
            key("a"),
            OperationKind::Start,
            || async { Err(Error::Other("boom".to_string())) },
        ));
        queue.enqueue(QueuedOperation::new(
            key("b"),
            OperationKind::Start,
            || async {
                let missing: Option<()> = None;
                missing.expect("operation bug");
                Ok(())
            },
        ));
        let counter = done.clone();
        queue.enqueue(QueuedOperation::new(key("c"), OperationKind::Start, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        queue.request_drain();

        let stats = Dispatcher::new(queue, 10, Duration::from_millis(5)).run().await;

        assert_eq!(stats.executed, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.panicked, 1);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_respects_batch_size() {
        let queue = Arc::new(WorkQueue::new());
        for i in 0..25 {
            queue.enqueue(noop(&format!("c{}", i), OperationKind::Start));
        }

        let handle = tokio::spawn(Dispatcher::new(queue.clone(), 10, Duration::from_secs(1)).run());

        // First batch runs immediately, then the dispatcher sleeps
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(queue.len(), 15);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.len(), 5);

        queue.request_drain();
        let stats = handle.await.unwrap();
        assert_eq!(stats.executed, 25);
        assert_eq!(stats.batches, 3);
    }

    #[tokio::test]
    async fn test_dispatcher_runs_different_keys_concurrently() {
        let queue = Arc::new(WorkQueue::new());
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        for channel in ["a", "b"] {
            let barrier = barrier.clone();
            queue.enqueue(QueuedOperation::new(key(channel), OperationKind::Start, move || async move {
                // Deadlocks unless both keys run at the same time
                barrier.wait().await;
                Ok(())
            }));
        }
        queue.request_drain();

        let stats = tokio::time::timeout(
            Duration::from_secs(5),
            Dispatcher::new(queue, 10, Duration::from_millis(5)).run(),
        )
        .await
        .unwrap();
        assert_eq!(stats.executed, 2);
    }
}
