//! In-memory collaborators for watcher tests.
//!
//! Used by the crate's own unit tests, and by integration tests when the
//! `test-utils` feature is enabled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{Target, TargetKey};
use crate::reader::{PageReader, PageSession, ReadError};
use crate::store::DurableStore;
use crate::{Error, Result};

#[derive(Default)]
struct ReaderState {
    fail_open: Mutex<HashSet<TargetKey>>,
    fail_reads: Mutex<HashSet<TargetKey>>,
    reject_reloads: Mutex<HashSet<TargetKey>>,
    permanent: AtomicBool,
    open_delay: Mutex<Duration>,
    viewers: AtomicU64,
    opens: Mutex<HashMap<TargetKey, usize>>,
    closes: AtomicUsize,
    active: Mutex<HashMap<TargetKey, usize>>,
    max_active: Mutex<HashMap<TargetKey, usize>>,
}

/// Page reader whose behaviour is toggled per key.
#[derive(Clone, Default)]
pub struct ScriptedReader {
    state: Arc<ReaderState>,
}

impl ScriptedReader {
    pub fn new() -> Self {
        let reader = Self::default();
        reader.state.viewers.store(100, Ordering::SeqCst);
        reader
    }

    pub fn fail_open(&self, key: &TargetKey, fail: bool) {
        toggle(&self.state.fail_open, key, fail);
    }

    pub fn fail_reads(&self, key: &TargetKey, fail: bool) {
        toggle(&self.state.fail_reads, key, fail);
    }

    /// Make the page refresh before each read fail with a permanent error.
    pub fn reject_reloads(&self, key: &TargetKey, reject: bool) {
        toggle(&self.state.reject_reloads, key, reject);
    }

    /// Report open failures as permanent instead of transient.
    pub fn set_permanent_failures(&self, permanent: bool) {
        self.state.permanent.store(permanent, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.state.open_delay.lock() = delay;
    }

    pub fn opens(&self, key: &TargetKey) -> usize {
        self.state.opens.lock().get(key).copied().unwrap_or(0)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn active(&self, key: &TargetKey) -> usize {
        self.state.active.lock().get(key).copied().unwrap_or(0)
    }

    pub fn max_active(&self, key: &TargetKey) -> usize {
        self.state.max_active.lock().get(key).copied().unwrap_or(0)
    }
}

fn toggle(set: &Mutex<HashSet<TargetKey>>, key: &TargetKey, on: bool) {
    let mut set = set.lock();
    if on {
        set.insert(key.clone());
    } else {
        set.remove(key);
    }
}

#[async_trait]
impl PageReader for ScriptedReader {
    async fn open(&self, target: &Target) -> std::result::Result<Box<dyn PageSession>, ReadError> {
        let delay = *self.state.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        *self.state.opens.lock().entry(target.key.clone()).or_default() += 1;
        if self.state.fail_open.lock().contains(&target.key) {
            return Err(if self.state.permanent.load(Ordering::SeqCst) {
                ReadError::permanent("no reader profile")
            } else {
                ReadError::transient("page did not load")
            });
        }

        let active = {
            let mut active = self.state.active.lock();
            let count = active.entry(target.key.clone()).or_default();
            *count += 1;
            *count
        };
        let mut max_active = self.state.max_active.lock();
        let max = max_active.entry(target.key.clone()).or_default();
        *max = (*max).max(active);

        Ok(Box::new(ScriptedSession {
            key: target.key.clone(),
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct ScriptedSession {
    key: TargetKey,
    state: Arc<ReaderState>,
    closed: bool,
}

#[async_trait]
impl PageSession for ScriptedSession {
    async fn reload(&mut self) -> std::result::Result<(), ReadError> {
        if self.state.reject_reloads.lock().contains(&self.key) {
            return Err(ReadError::permanent("page layout changed"));
        }
        Ok(())
    }

    async fn read_viewers(&mut self) -> Option<u64> {
        if self.state.fail_reads.lock().contains(&self.key) {
            None
        } else {
            Some(self.state.viewers.load(Ordering::SeqCst))
        }
    }

    async fn read_game(&mut self) -> Option<String> {
        Some("Just Chatting".to_string())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(count) = self.state.active.lock().get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Durable store kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<HashMap<(String, String), Vec<String>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines(folder: &str, file: &str, lines: &[&str]) -> Self {
        let store = Self::new();
        store.files.lock().insert(
            (folder.to_string(), file.to_string()),
            lines.iter().map(|l| l.to_string()).collect(),
        );
        store
    }

    pub fn lines(&self, folder: &str, file: &str) -> Vec<String> {
        self.files
            .lock()
            .get(&(folder.to_string(), file.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn append(
        &self,
        folder: &str,
        file: &str,
        lines: &[String],
        truncate_first: bool,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Other("disk full".to_string()));
        }
        let mut files = self.files.lock();
        let entry = files
            .entry((folder.to_string(), file.to_string()))
            .or_default();
        if truncate_first {
            entry.clear();
        }
        entry.extend(lines.iter().cloned());
        Ok(())
    }

    async fn read_lines(&self, folder: &str, file: &str) -> Result<Vec<String>> {
        Ok(self.lines(folder, file))
    }
}
