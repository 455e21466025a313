use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::Rng;

use super::parts::{EstimateKind, ProgressParts};
use super::progress::Progress;
use crate::Result;

/// Progress of several independent operations running in parallel.
///
/// Work may be submitted before its progress handle exists: `reserve` a slot
/// at submission time and `register` the handle once it is published. An
/// empty slot counts as not done.
pub struct CompositeProgress {
    subject: String,
    slots: Mutex<Vec<Option<Arc<dyn Progress>>>>,
    registered: Condvar,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl CompositeProgress {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            slots: Mutex::new(Vec::new()),
            registered: Condvar::new(),
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(250),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max.max(initial);
        self
    }

    /// Initial and capped wait used by `join`.
    pub fn backoff(&self) -> (Duration, Duration) {
        (self.backoff_initial, self.backoff_max)
    }

    /// Add an already-published sub-progress.
    pub fn add(&self, progress: Arc<dyn Progress>) -> usize {
        let mut slots = self.slots.lock();
        slots.push(Some(progress));
        self.registered.notify_all();
        slots.len() - 1
    }

    /// Reserve a slot for work whose progress handle is not published yet.
    pub fn reserve(&self) -> usize {
        let mut slots = self.slots.lock();
        slots.push(None);
        slots.len() - 1
    }

    pub fn register(&self, slot: usize, progress: Arc<dyn Progress>) {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(slot) {
            *entry = Some(progress);
        }
        self.registered.notify_all();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// True once at least one sub-progress is done.
    pub fn is_partially_done(&self) -> Result<bool> {
        for progress in self.snapshot().into_iter().flatten() {
            if progress.is_done()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// One part per slot; a slot counts as done once its progress is done.
    pub fn task_parts(&self) -> Result<ProgressParts> {
        let mut parts = Vec::new();
        for slot in self.snapshot() {
            match slot {
                Some(progress) => parts.push(progress.parts()?),
                None => parts.push(ProgressParts::default()),
            }
        }
        Ok(ProgressParts::count_of(parts))
    }

    fn snapshot(&self) -> Vec<Option<Arc<dyn Progress>>> {
        self.slots.lock().clone()
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        let doubled = (current * 2).min(self.backoff_max);
        let jitter_ms = doubled.as_millis().max(1) as u64;
        let wait = rand::thread_rng().gen_range(jitter_ms / 2..=jitter_ms);
        Duration::from_millis(wait.max(1))
    }
}

impl Progress for CompositeProgress {
    fn subject(&self) -> String {
        self.subject.clone()
    }

    fn parts(&self) -> Result<ProgressParts> {
        let mut parts = Vec::new();
        for slot in self.snapshot() {
            match slot {
                Some(progress) => parts.push(progress.parts()?),
                None => parts.push(ProgressParts::new(0, 0, 0, EstimateKind::Unknown)),
            }
        }
        Ok(ProgressParts::sum(parts))
    }

    fn is_started(&self) -> bool {
        self.snapshot().into_iter().flatten().any(|p| p.is_started())
    }

    fn is_done(&self) -> Result<bool> {
        for slot in self.snapshot() {
            match slot {
                Some(progress) if progress.is_done()? => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Joins every registered sub-progress. Slots that are still empty are
    /// re-checked after a randomized, capped exponential backoff, or sooner
    /// if a registration wakes us.
    fn join(&self) -> Result<()> {
        let mut backoff = self.backoff_initial;
        loop {
            let snapshot = self.snapshot();
            let mut pending = false;
            for slot in &snapshot {
                match slot {
                    Some(progress) => progress.join()?,
                    None => pending = true,
                }
            }
            if !pending {
                // Slots reserved while we were joining need another pass.
                if self.slots.lock().len() == snapshot.len() {
                    return Ok(());
                }
                continue;
            }

            let mut slots = self.slots.lock();
            if slots.iter().any(Option::is_none) {
                self.registered.wait_for(&mut slots, backoff);
            }
            backoff = self.next_backoff(backoff);
        }
    }
}
