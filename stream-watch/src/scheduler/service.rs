//! Watcher service.
//!
//! The `Watcher` is the top-level scheduler. It:
//!
//! - bootstraps targets from the persisted target list
//! - runs a fixed-period tick that turns due deadlines into queued work
//! - records a status column per tick and periodically writes the snapshot
//! - exposes the runtime control surface (add/remove/start/stop)
//! - on cancellation, persists the target list, stops every supervisor and
//!   drains the work queue
//!
//! Control calls only mutate the registry and enqueue work; they never wait
//! for the work to complete.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Local;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::WatcherConfig;
use crate::domain::{StreamStatus, Target, TargetKey};
use crate::reader::SharedReader;
use crate::registry::{StatusChange, TargetRegistry};
use crate::store::DurableStore;
use crate::{Error, Result};

use super::history::StatusHistory;
use super::queue::{DispatchStats, Dispatcher, OperationKind, QueuedOperation, WorkQueue};
use super::supervisor::{SupervisorConfig, SupervisorContext, TargetSupervisor};

type SupervisorMap = DashMap<TargetKey, Arc<TargetSupervisor>>;

/// Outcome of a watcher shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Targets written to the persisted target list.
    pub persisted_targets: usize,
    /// Targets in `Stopped` once shutdown finished.
    pub stopped_targets: usize,
    /// Queued operations discarded when the queue closed.
    pub dropped_operations: usize,
    /// Whether the dispatcher drained the queue within the timeout.
    pub drained: bool,
    pub dispatch: DispatchStats,
}

/// Supervises the registered targets.
pub struct Watcher {
    config: WatcherConfig,
    registry: Arc<TargetRegistry>,
    queue: Arc<WorkQueue>,
    supervisors: Arc<SupervisorMap>,
    ctx: SupervisorContext,
    history: Mutex<StatusHistory>,
    status_events: Mutex<broadcast::Receiver<StatusChange>>,
    last_snapshot: Mutex<Instant>,
    targets_dirty: AtomicBool,
    running: AtomicBool,
}

impl Watcher {
    /// Create a watcher using the system clock and a fresh cancellation token.
    pub fn new(
        config: WatcherConfig,
        reader: SharedReader,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self::with_clock(
            config,
            reader,
            store,
            Arc::new(SystemClock),
            CancellationToken::new(),
        )
    }

    /// Create a watcher with an injected clock and root cancellation token.
    pub fn with_clock(
        config: WatcherConfig,
        reader: SharedReader,
        store: Arc<dyn DurableStore>,
        clock: SharedClock,
        cancellation_token: CancellationToken,
    ) -> Self {
        let registry = Arc::new(TargetRegistry::new());
        let status_events = registry.subscribe();
        let last_snapshot = clock.now();

        let ctx = SupervisorContext {
            registry: registry.clone(),
            reader,
            store,
            clock,
            config: SupervisorConfig::from(&config),
            root_token: cancellation_token,
        };

        Self {
            history: Mutex::new(StatusHistory::new(config.history_limit)),
            config,
            registry,
            queue: Arc::new(WorkQueue::new()),
            supervisors: Arc::new(DashMap::new()),
            ctx,
            status_events: Mutex::new(status_events),
            last_snapshot: Mutex::new(last_snapshot),
            targets_dirty: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Get the root cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.root_token.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_closing(&self) -> bool {
        self.ctx.root_token.is_cancelled() || !self.queue.is_accepting_starts()
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    /// Register a target and queue its start.
    ///
    /// Returns `false` if the target already exists or the watcher is
    /// shutting down.
    pub fn add_stream(&self, website: &str, channel: &str) -> bool {
        self.add_target(Target::new(TargetKey::new(website, channel)))
    }

    /// Register a prepared target (e.g. with reader environment attached).
    pub fn add_target(&self, target: Target) -> bool {
        if self.is_closing() {
            debug!(target_key = %target.key, "Rejected add, watcher is shutting down");
            return false;
        }

        let key = target.key.clone();
        if !self.registry.add(target) {
            return false;
        }

        self.targets_dirty.store(true, Ordering::SeqCst);
        info!(website = %key.website, channel = %key.channel, "Added stream");
        self.enqueue_start(&key);
        true
    }

    /// Unregister a target and queue the teardown of its session.
    pub fn remove_stream(&self, website: &str, channel: &str) -> bool {
        let key = TargetKey::new(website, channel);
        if !self.registry.remove(&key) {
            return false;
        }

        self.targets_dirty.store(true, Ordering::SeqCst);
        info!(website = %key.website, channel = %key.channel, "Removed stream");

        let Some(supervisor) = self.existing_supervisor(&key) else {
            return true;
        };
        supervisor.cancel_work();

        let registry = self.registry.clone();
        let supervisors = self.supervisors.clone();
        self.queue.enqueue(QueuedOperation::new(
            key.clone(),
            OperationKind::Stop,
            move || async move {
                let result = supervisor.stop().await;
                // A re-added target keeps its supervisor
                if !registry.contains(supervisor.key()) {
                    supervisors.remove_if(supervisor.key(), |_, s| Arc::ptr_eq(s, &supervisor));
                }
                result
            },
        ));
        true
    }

    /// Queue a start for a registered target.
    pub fn start_stream(&self, website: &str, channel: &str) -> bool {
        let key = TargetKey::new(website, channel);
        if self.is_closing() || !self.registry.contains(&key) {
            return false;
        }
        self.enqueue_start(&key)
    }

    /// Cancel in-flight work for a registered target and queue its stop.
    pub fn stop_stream(&self, website: &str, channel: &str) -> bool {
        let key = TargetKey::new(website, channel);
        if !self.registry.contains(&key) {
            return false;
        }

        // A deadline left armed until the Stop runs could requeue a Start
        self.registry.update(&key, |t| {
            t.wait_deadline = None;
            t.next_read_at = None;
        });

        let supervisor = self.supervisor_for(&key);
        supervisor.cancel_work();
        self.enqueue_stop(supervisor)
    }

    /// Current status of a target; `NotFound` if it is not registered.
    pub fn status(&self, website: &str, channel: &str) -> StreamStatus {
        self.registry.status(&TargetKey::new(website, channel))
    }

    /// Point-in-time copy of all targets.
    pub fn targets(&self) -> Vec<Target> {
        self.registry.list()
    }

    fn existing_supervisor(&self, key: &TargetKey) -> Option<Arc<TargetSupervisor>> {
        self.supervisors.get(key).map(|entry| entry.value().clone())
    }

    fn supervisor_for(&self, key: &TargetKey) -> Arc<TargetSupervisor> {
        self.supervisors
            .entry(key.clone())
            .or_insert_with(|| Arc::new(TargetSupervisor::new(key.clone(), self.ctx.clone())))
            .value()
            .clone()
    }

    fn enqueue_start(&self, key: &TargetKey) -> bool {
        let supervisor = self.supervisor_for(key);
        self.queue.enqueue(QueuedOperation::new(
            key.clone(),
            OperationKind::Start,
            move || async move { supervisor.start().await },
        ))
    }

    fn enqueue_run_once(&self, key: &TargetKey) -> bool {
        let supervisor = self.supervisor_for(key);
        self.queue.enqueue(QueuedOperation::new(
            key.clone(),
            OperationKind::RunOnce,
            move || async move { supervisor.run_once().await },
        ))
    }

    fn enqueue_stop(&self, supervisor: Arc<TargetSupervisor>) -> bool {
        let key = supervisor.key().clone();
        self.queue.enqueue(QueuedOperation::new(
            key,
            OperationKind::Stop,
            move || async move { supervisor.stop().await },
        ))
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Load the persisted target list and queue a start for each target.
    ///
    /// Returns the number of targets added. Malformed lines are skipped and
    /// a store failure is treated as an empty list.
    pub async fn bootstrap(&self) -> usize {
        let lines = match self
            .ctx
            .store
            .read_lines(&self.config.config_folder, &self.config.targets_file)
            .await
        {
            Ok(lines) => lines,
            Err(e) => {
                warn!(error = %e, "Failed to read target list");
                Vec::new()
            }
        };

        let mut added = 0;
        for line in &lines {
            let Some(key) = TargetKey::parse_line(line) else {
                debug!(line = %line, "Skipping malformed target line");
                continue;
            };
            if self.add_target(Target::new(key)) {
                added += 1;
            }
        }

        // The list on disk already matches what was loaded
        self.targets_dirty.store(false, Ordering::SeqCst);
        info!(added, lines = lines.len(), "Loaded targets");
        added
    }

    /// Run a single tick.
    ///
    /// Queues starts for targets whose backoff elapsed and reads for running
    /// targets that are due, records a status column, and writes the
    /// snapshot when the snapshot interval has passed.
    pub async fn tick(&self) {
        self.drain_status_events();
        if self.ctx.root_token.is_cancelled() {
            return;
        }

        let now = self.ctx.clock.now();
        for key in self.registry.take_due_waits(now) {
            debug!(target_key = %key, "Backoff elapsed, restarting");
            self.enqueue_start(&key);
        }
        for key in self.registry.take_due_reads(now) {
            self.enqueue_run_once(&key);
        }

        let targets = self.registry.list();
        self.history.lock().record(Local::now(), &targets);

        let snapshot_due = {
            let mut last = self.last_snapshot.lock();
            if now.saturating_duration_since(*last) >= self.config.snapshot_interval() {
                *last = now;
                true
            } else {
                false
            }
        };

        if snapshot_due {
            self.write_snapshot().await;
            if self.targets_dirty.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.persist_targets().await {
                    self.targets_dirty.store(true, Ordering::SeqCst);
                    warn!(error = %e, "Failed to persist target list");
                }
            }
        }
    }

    fn drain_status_events(&self) {
        let mut events = self.status_events.lock();
        loop {
            match events.try_recv() {
                Ok(change) => info!(
                    website = %change.key.website,
                    channel = %change.key.channel,
                    from = %change.from,
                    to = %change.to,
                    "Status changed"
                ),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Watcher lagged {} status events", n);
                }
                Err(_) => break,
            }
        }
    }

    /// Write the status snapshot, replacing the previous one.
    ///
    /// Returns `false` if the store rejected the write.
    pub async fn write_snapshot(&self) -> bool {
        let lines = self.history.lock().render();
        match self
            .ctx
            .store
            .append(
                &self.config.status_folder,
                &self.config.status_file,
                &lines,
                true,
            )
            .await
        {
            Ok(()) => {
                debug!(rows = lines.len(), "Wrote status snapshot");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to write status snapshot");
                false
            }
        }
    }

    /// Rewrite the persisted target list from the registry.
    pub async fn persist_targets(&self) -> Result<usize> {
        let lines: Vec<String> = self
            .registry
            .keys()
            .iter()
            .map(TargetKey::to_line)
            .collect();
        self.ctx
            .store
            .append(
                &self.config.config_folder,
                &self.config.targets_file,
                &lines,
                true,
            )
            .await?;
        debug!(targets = lines.len(), "Persisted target list");
        Ok(lines.len())
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    /// Run the watcher until the cancellation token fires.
    pub async fn run(&self) -> Result<ShutdownReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Other("watcher is already running".to_string()));
        }

        info!(
            tick_ms = self.config.tick_period_ms,
            batch_size = self.config.dispatch_batch_size,
            "Starting watcher"
        );
        self.bootstrap().await;

        let dispatcher = Dispatcher::new(
            self.queue.clone(),
            self.config.dispatch_batch_size,
            self.config.dispatch_interval(),
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run());

        let period = self.config.tick_period();
        let token = self.ctx.root_token.clone();
        while !token.is_cancelled() {
            let started = tokio::time::Instant::now();

            if AssertUnwindSafe(self.tick()).catch_unwind().await.is_err() {
                error!("Watcher tick panicked, continuing with the next tick");
            }

            let wait = next_tick_wait(period, started.elapsed());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Watcher received cancellation signal");
        let report = self.shutdown(dispatcher_handle).await;
        self.running.store(false, Ordering::SeqCst);

        info!(
            persisted = report.persisted_targets,
            stopped = report.stopped_targets,
            dropped = report.dropped_operations,
            drained = report.drained,
            "Watcher stopped"
        );
        Ok(report)
    }

    async fn shutdown(&self, mut dispatcher: JoinHandle<DispatchStats>) -> ShutdownReport {
        info!("Shutting down watcher");
        let mut report = ShutdownReport {
            dropped_operations: self.queue.close_for_starts(),
            ..Default::default()
        };

        match self.persist_targets().await {
            Ok(count) => {
                self.targets_dirty.store(false, Ordering::SeqCst);
                report.persisted_targets = count;
            }
            Err(e) => warn!(error = %e, "Failed to persist target list on shutdown"),
        }

        self.ctx.root_token.cancel();
        let supervisors: Vec<Arc<TargetSupervisor>> = self
            .supervisors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for supervisor in &supervisors {
            self.enqueue_stop(supervisor.clone());
        }
        self.queue.request_drain();

        match tokio::time::timeout(self.config.shutdown_timeout(), &mut dispatcher).await {
            Ok(Ok(stats)) => {
                report.drained = true;
                report.dispatch = stats;
            }
            Ok(Err(e)) => error!(error = %e, "Dispatcher task failed"),
            Err(_) => {
                warn!(
                    timeout_secs = self.config.shutdown_timeout_secs,
                    "Dispatcher did not drain in time, aborting"
                );
                dispatcher.abort();
            }
        }

        // Anything the dispatcher did not get to is stopped inline
        for supervisor in &supervisors {
            let status = self.registry.status(supervisor.key());
            let pending = status.is_active() || supervisor.has_session().await;
            if pending {
                if let Err(e) = supervisor.stop().await {
                    warn!(target_key = %supervisor.key(), error = %e, "Failed to stop target");
                }
            }
        }

        report.stopped_targets = self
            .registry
            .list()
            .iter()
            .filter(|t| t.status == StreamStatus::Stopped)
            .count();

        self.drain_status_events();
        let targets = self.registry.list();
        self.history.lock().record(Local::now(), &targets);
        self.write_snapshot().await;

        report
    }
}

/// Time to sleep before the next tick so ticks stay on a fixed period.
///
/// A tick that overran its period gets no sleep at all.
fn next_tick_wait(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}
