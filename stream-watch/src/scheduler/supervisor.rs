//! Per-target supervisor.
//!
//! A `TargetSupervisor` owns one target's reader session and drives its
//! lifecycle:
//!
//! - `start`: open a session (`Running`) or arm the backoff (`Waiting`)
//! - `run_once`: perform one read; `max_fails` consecutive failures tear the
//!   session down and arm the backoff
//! - `stop`: cancel in-flight work, close the session, clear deadlines
//!
//! All operations on one supervisor are serialized by its session lock, so
//! a target never has two sessions open at once. Deadlines are armed in the
//! registry and collected by the watcher tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::clock::SharedClock;
use crate::config::WatcherConfig;
use crate::domain::{Observation, StreamStatus, TargetKey};
use crate::reader::{PageSession, ReadError, SharedReader};
use crate::registry::TargetRegistry;
use crate::store::DurableStore;

/// Upper bound on a session close before it is abandoned.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry and backoff policy for a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_fails: u32,
    pub backoff: Duration,
    pub retry_delay: Duration,
    pub read_interval: Duration,
    /// Folder receiving the observation log.
    pub metrics_folder: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&WatcherConfig::default())
    }
}

impl From<&WatcherConfig> for SupervisorConfig {
    fn from(config: &WatcherConfig) -> Self {
        Self {
            max_fails: config.max_fails,
            backoff: config.backoff(),
            retry_delay: config.retry_delay(),
            read_interval: config.read_interval(),
            metrics_folder: config.metrics_folder.clone(),
        }
    }
}

/// Shared collaborators handed to every supervisor.
#[derive(Clone)]
pub struct SupervisorContext {
    pub registry: Arc<TargetRegistry>,
    pub reader: SharedReader,
    pub store: Arc<dyn DurableStore>,
    pub clock: SharedClock,
    pub config: SupervisorConfig,
    /// Root cancellation token of the watcher.
    pub root_token: CancellationToken,
}

#[derive(Default)]
struct SessionSlot {
    session: Option<Box<dyn PageSession>>,
}

/// Lifecycle owner for a single target.
pub struct TargetSupervisor {
    key: TargetKey,
    ctx: SupervisorContext,
    slot: Mutex<SessionSlot>,
    /// Token of the current run; replaced on every start.
    work_token: parking_lot::Mutex<CancellationToken>,
}

impl TargetSupervisor {
    pub fn new(key: TargetKey, ctx: SupervisorContext) -> Self {
        let work_token = ctx.root_token.child_token();
        Self {
            key,
            ctx,
            slot: Mutex::new(SessionSlot::default()),
            work_token: parking_lot::Mutex::new(work_token),
        }
    }

    pub fn key(&self) -> &TargetKey {
        &self.key
    }

    /// Cancel whatever this supervisor is currently doing.
    ///
    /// Does not wait for the session lock, so it can be called from
    /// synchronous control paths; the next `start` installs a fresh token.
    pub fn cancel_work(&self) {
        self.work_token.lock().cancel();
    }

    pub async fn has_session(&self) -> bool {
        self.slot.lock().await.session.is_some()
    }

    fn renew_token(&self) -> CancellationToken {
        let token = self.ctx.root_token.child_token();
        *self.work_token.lock() = token.clone();
        token
    }

    fn current_token(&self) -> CancellationToken {
        self.work_token.lock().clone()
    }

    /// Open a session for the target.
    ///
    /// `Stopped`/`Waiting` become `Running` on success and `Waiting` (with
    /// the backoff armed) on failure. A target that is already running with
    /// an open session is left alone.
    pub async fn start(&self) -> Result<()> {
        if self.ctx.root_token.is_cancelled() {
            debug!(target_key = %self.key, "Skipping start, watcher is shutting down");
            return Ok(());
        }

        let mut slot = self.slot.lock().await;
        let Some(target) = self.ctx.registry.get(&self.key) else {
            debug!(target_key = %self.key, "Skipping start, target was removed");
            return Ok(());
        };
        if target.status == StreamStatus::Running && slot.session.is_some() {
            return Ok(());
        }

        self.teardown(&mut slot).await;
        let token = self.renew_token();

        let opened = tokio::select! {
            _ = token.cancelled() => {
                debug!(target_key = %self.key, "Start cancelled while opening");
                return Ok(());
            }
            result = self.ctx.reader.open(&target) => result,
        };

        match opened {
            Ok(mut session) => {
                if token.is_cancelled() || !self.ctx.registry.contains(&self.key) {
                    session.close().await;
                    return Ok(());
                }

                slot.session = Some(session);
                let now = self.ctx.clock.now();
                self.ctx.registry.update(&self.key, |t| {
                    t.consecutive_failures = 0;
                    t.wait_deadline = None;
                    t.next_read_at = Some(now);
                });
                self.ctx.registry.set_status(&self.key, StreamStatus::Running);
                info!(website = %self.key.website, channel = %self.key.channel, "Target running");
            }
            Err(e) => {
                if token.is_cancelled() {
                    return Ok(());
                }
                if e.transient {
                    warn!(
                        website = %self.key.website,
                        channel = %self.key.channel,
                        error = %e,
                        "Failed to open page"
                    );
                } else {
                    error!(
                        website = %self.key.website,
                        channel = %self.key.channel,
                        error = %e,
                        "Page cannot be opened until the reader setup changes"
                    );
                }
                self.enter_backoff(&mut slot).await;
            }
        }

        Ok(())
    }

    /// Perform one read of a running target.
    pub async fn run_once(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if self.ctx.registry.status(&self.key) != StreamStatus::Running {
            return Ok(());
        }

        let token = self.current_token();
        if token.is_cancelled() {
            return Ok(());
        }

        let outcome = {
            let Some(session) = slot.session.as_mut() else {
                return Ok(());
            };
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                outcome = read_observation(session.as_mut()) => outcome,
            }
        };

        match outcome {
            Ok(observation) => self.record(observation).await,
            Err(e) => {
                let mut failures = 0;
                self.ctx.registry.update(&self.key, |t| {
                    t.consecutive_failures += 1;
                    failures = t.consecutive_failures;
                });

                // Permanent failures skip the remaining attempts
                if failures >= self.ctx.config.max_fails || !e.transient {
                    warn!(
                        website = %self.key.website,
                        channel = %self.key.channel,
                        failures,
                        transient = e.transient,
                        error = %e,
                        "Giving up on reads, backing off"
                    );
                    self.enter_backoff(&mut slot).await;
                } else {
                    debug!(target_key = %self.key, failures, error = %e, "Read failed, retrying");
                    let at = self.ctx.clock.now() + self.ctx.config.retry_delay;
                    self.ctx.registry.arm_read(&self.key, at);
                }
            }
        }

        Ok(())
    }

    /// Stop the target: cancel work, close the session, clear deadlines.
    pub async fn stop(&self) -> Result<()> {
        self.cancel_work();

        let mut slot = self.slot.lock().await;
        self.teardown(&mut slot).await;
        self.ctx.registry.update(&self.key, |t| {
            t.wait_deadline = None;
            t.next_read_at = None;
            t.consecutive_failures = 0;
        });
        if self.ctx.registry.set_status(&self.key, StreamStatus::Stopped) {
            info!(website = %self.key.website, channel = %self.key.channel, "Target stopped");
        }
        Ok(())
    }

    async fn record(&self, observation: Observation) {
        let next = self.ctx.clock.now() + self.ctx.config.read_interval;
        let line = observation.to_csv_line();
        debug!(
            target_key = %self.key,
            viewers = observation.viewers,
            game = observation.game.as_deref().unwrap_or(""),
            "Observed"
        );

        self.ctx.registry.update(&self.key, |t| {
            t.consecutive_failures = 0;
            t.last_observation = Some(observation);
            t.next_read_at = Some(next);
        });

        if let Err(e) = self
            .ctx
            .store
            .append(
                &self.ctx.config.metrics_folder,
                &self.key.metrics_file_name(),
                &[line],
                false,
            )
            .await
        {
            warn!(target_key = %self.key, error = %e, "Failed to append observation");
        }
    }

    async fn enter_backoff(&self, slot: &mut SessionSlot) {
        self.teardown(slot).await;

        let deadline = self.ctx.clock.now() + self.ctx.config.backoff;
        self.ctx.registry.update(&self.key, |t| {
            t.wait_deadline = Some(deadline);
            t.next_read_at = None;
        });
        self.ctx.registry.set_status(&self.key, StreamStatus::Waiting);
        info!(
            website = %self.key.website,
            channel = %self.key.channel,
            backoff_secs = self.ctx.config.backoff.as_secs(),
            "Target waiting"
        );
    }

    async fn teardown(&self, slot: &mut SessionSlot) {
        let Some(mut session) = slot.session.take() else {
            return;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, session.close())
            .await
            .is_err()
        {
            warn!(target_key = %self.key, "Timed out closing session");
        }
    }
}

async fn read_observation(session: &mut dyn PageSession) -> std::result::Result<Observation, ReadError> {
    session.reload().await?;
    let viewers = session
        .read_viewers()
        .await
        .ok_or_else(|| ReadError::transient("viewer count unavailable"))?;
    let game = session.read_game().await;
    Ok(Observation::new(viewers, game))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FakeClock};
    use crate::domain::Target;
    use crate::test_support::{MemoryStore, ScriptedReader};

    struct Fixture {
        registry: Arc<TargetRegistry>,
        reader: ScriptedReader,
        store: Arc<MemoryStore>,
        clock: Arc<FakeClock>,
        root: CancellationToken,
        supervisor: Arc<TargetSupervisor>,
    }

    fn key() -> TargetKey {
        TargetKey::new("twitch", "gaules")
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(TargetRegistry::new());
        registry.add(Target::new(key()));
        let reader = ScriptedReader::new();
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FakeClock::new());
        let root = CancellationToken::new();
        let ctx = SupervisorContext {
            registry: registry.clone(),
            reader: Arc::new(reader.clone()),
            store: store.clone(),
            clock: clock.clone(),
            config: SupervisorConfig {
                retry_delay: Duration::from_secs(5),
                ..SupervisorConfig::default()
            },
            root_token: root.clone(),
        };
        Fixture {
            supervisor: Arc::new(TargetSupervisor::new(key(), ctx)),
            registry,
            reader,
            store,
            clock,
            root,
        }
    }

    #[tokio::test]
    async fn test_start_success_runs() {
        let f = fixture();
        f.supervisor.start().await.unwrap();

        assert_eq!(f.registry.status(&key()), StreamStatus::Running);
        assert!(f.supervisor.has_session().await);
        assert_eq!(f.reader.active(&key()), 1);
        // First read is due immediately
        assert_eq!(f.registry.take_due_reads(f.clock.now()), vec![key()]);
    }

    #[tokio::test]
    async fn test_failed_start_waits_with_backoff() {
        let f = fixture();
        f.reader.fail_open(&key(), true);
        f.supervisor.start().await.unwrap();

        let target = f.registry.get(&key()).unwrap();
        assert_eq!(target.status, StreamStatus::Waiting);
        assert_eq!(
            target.wait_deadline,
            Some(f.clock.now() + Duration::from_secs(300))
        );
        assert!(!f.supervisor.has_session().await);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_running() {
        let f = fixture();
        f.supervisor.start().await.unwrap();
        f.supervisor.start().await.unwrap();

        assert_eq!(f.reader.opens(&key()), 1);
        assert_eq!(f.reader.max_active(&key()), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_never_share_sessions() {
        let f = fixture();
        f.reader.set_open_delay(Duration::from_millis(20));

        let a = f.supervisor.clone();
        let b = f.supervisor.clone();
        let (ra, rb) = tokio::join!(a.start(), b.start());
        ra.unwrap();
        rb.unwrap();

        assert_eq!(f.reader.max_active(&key()), 1);
        assert_eq!(f.reader.active(&key()), 1);
    }

    #[tokio::test]
    async fn test_run_once_records_observation() {
        let f = fixture();
        f.supervisor.start().await.unwrap();
        f.supervisor.run_once().await.unwrap();

        let target = f.registry.get(&key()).unwrap();
        let observation = target.last_observation.unwrap();
        assert_eq!(observation.viewers, 100);
        assert_eq!(
            target.next_read_at,
            Some(f.clock.now() + Duration::from_secs(60))
        );

        let lines = f.store.lines("metrics", "twitch_gaules.csv");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(",100,Just Chatting"));
    }

    #[tokio::test]
    async fn test_max_fails_tears_down_and_waits() {
        let f = fixture();
        f.supervisor.start().await.unwrap();
        f.reader.fail_reads(&key(), true);

        f.supervisor.run_once().await.unwrap();
        f.supervisor.run_once().await.unwrap();
        let target = f.registry.get(&key()).unwrap();
        assert_eq!(target.status, StreamStatus::Running);
        assert_eq!(target.consecutive_failures, 2);
        assert_eq!(
            target.next_read_at,
            Some(f.clock.now() + Duration::from_secs(5))
        );

        f.supervisor.run_once().await.unwrap();
        let target = f.registry.get(&key()).unwrap();
        assert_eq!(target.status, StreamStatus::Waiting);
        assert!(target.wait_deadline.is_some());
        assert!(target.next_read_at.is_none());
        assert_eq!(f.reader.closes(), 1);
        assert_eq!(f.reader.active(&key()), 0);
    }

    #[tokio::test]
    async fn test_permanent_read_error_backs_off_at_once() {
        let f = fixture();
        f.supervisor.start().await.unwrap();
        f.reader.reject_reloads(&key(), true);

        f.supervisor.run_once().await.unwrap();

        let target = f.registry.get(&key()).unwrap();
        assert_eq!(target.status, StreamStatus::Waiting);
        assert_eq!(target.consecutive_failures, 1);
        assert_eq!(
            target.wait_deadline,
            Some(f.clock.now() + Duration::from_secs(300))
        );
        assert_eq!(f.reader.active(&key()), 0);
    }

    #[tokio::test]
    async fn test_permanent_open_error_still_waits() {
        let f = fixture();
        f.reader.fail_open(&key(), true);
        f.reader.set_permanent_failures(true);
        f.supervisor.start().await.unwrap();

        let target = f.registry.get(&key()).unwrap();
        assert_eq!(target.status, StreamStatus::Waiting);
        assert!(target.wait_deadline.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let f = fixture();
        f.supervisor.start().await.unwrap();

        f.reader.fail_reads(&key(), true);
        f.supervisor.run_once().await.unwrap();
        f.supervisor.run_once().await.unwrap();
        f.reader.fail_reads(&key(), false);
        f.supervisor.run_once().await.unwrap();

        assert_eq!(f.registry.get(&key()).unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_stop_closes_and_clears_deadlines() {
        let f = fixture();
        f.reader.fail_open(&key(), true);
        f.supervisor.start().await.unwrap();
        assert_eq!(f.registry.status(&key()), StreamStatus::Waiting);

        f.supervisor.stop().await.unwrap();
        let target = f.registry.get(&key()).unwrap();
        assert_eq!(target.status, StreamStatus::Stopped);
        assert!(target.wait_deadline.is_none());

        f.reader.fail_open(&key(), false);
        f.supervisor.start().await.unwrap();
        f.supervisor.stop().await.unwrap();
        assert_eq!(f.registry.status(&key()), StreamStatus::Stopped);
        assert_eq!(f.reader.active(&key()), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_open() {
        let f = fixture();
        f.reader.set_open_delay(Duration::from_secs(30));

        let supervisor = f.supervisor.clone();
        let handle = tokio::spawn(async move { supervisor.start().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.supervisor.stop().await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(f.registry.status(&key()), StreamStatus::Stopped);
        assert_eq!(f.reader.opens(&key()), 0);
    }

    #[tokio::test]
    async fn test_start_skipped_after_root_cancel() {
        let f = fixture();
        f.root.cancel();
        f.supervisor.start().await.unwrap();

        assert_eq!(f.registry.status(&key()), StreamStatus::Stopped);
        assert_eq!(f.reader.opens(&key()), 0);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_fail_read() {
        let f = fixture();
        f.store.set_fail_writes(true);
        f.supervisor.start().await.unwrap();
        f.supervisor.run_once().await.unwrap();

        let target = f.registry.get(&key()).unwrap();
        assert_eq!(target.status, StreamStatus::Running);
        assert!(target.last_observation.is_some());
    }
}
