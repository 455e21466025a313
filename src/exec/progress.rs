use parking_lot::{Condvar, Mutex};

use super::parts::{EstimateKind, ProgressParts};
use crate::error::{BindexError, TaskAbort};
use crate::Result;

/// Observable state of a (possibly asynchronous) operation.
pub trait Progress: Send + Sync {
    /// What the operation is working on.
    fn subject(&self) -> String;

    /// Current counters, or the abort that ended the operation.
    fn parts(&self) -> Result<ProgressParts>;

    /// Human-readable status line.
    fn status(&self) -> String {
        match self.parts() {
            Ok(parts) if parts.is_done() => format!("{}: done", self.subject()),
            Ok(parts) => format!("{}: {}", self.subject(), parts),
            Err(err) => format!("{}: {}", self.subject(), err),
        }
    }

    fn is_started(&self) -> bool;

    fn is_done(&self) -> Result<bool> {
        Ok(self.parts()?.is_done())
    }

    /// Block until the operation is done, or return its abort.
    fn join(&self) -> Result<()>;
}

type FinishHook = Box<dyn FnOnce(bool) + Send>;

struct SimpleState {
    done: u64,
    known: u64,
    total: u64,
    kind: EstimateKind,
    started: bool,
    status: Option<String>,
    abort: Option<TaskAbort>,
    finished: bool,
    hooks: Vec<FinishHook>,
}

impl SimpleState {
    fn parts(&self) -> ProgressParts {
        ProgressParts::new(self.done, self.known, self.total, self.kind)
    }

    fn reached_end(&self) -> bool {
        self.abort.is_some() || (self.kind == EstimateKind::Finalized && self.done == self.known)
    }
}

/// Progress of a single operation made of countable parts.
pub struct SimpleProgress {
    subject: String,
    state: Mutex<SimpleState>,
    cond: Condvar,
}

impl SimpleProgress {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            state: Mutex::new(SimpleState {
                done: 0,
                known: 0,
                total: 0,
                kind: EstimateKind::Unknown,
                started: false,
                status: None,
                abort: None,
                finished: false,
                hooks: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Mark the operation as started without adding any parts.
    pub fn start(&self) {
        self.state.lock().started = true;
    }

    /// Set the free-form status text shown by `status()`.
    pub fn enter_stage(&self, status: impl Into<String>) {
        let mut state = self.state.lock();
        state.started = true;
        state.status = Some(status.into());
    }

    /// Register `parts` more units of work. With `finalise`, no more parts
    /// may be added afterwards.
    pub fn add_part_known(&self, parts: u64, finalise: bool) -> Result<()> {
        let hooks = {
            let mut state = self.state.lock();
            if state.kind == EstimateKind::Finalized && parts > 0 {
                return Err(BindexError::InvalidState(format!(
                    "{}: parts added after the total was finalised",
                    self.subject
                )));
            }
            state.started = true;
            state.known += parts;
            if finalise {
                state.kind = EstimateKind::Finalized;
            }
            self.check_finished(&mut state)
        };
        run_hooks(hooks, true);
        Ok(())
    }

    /// Record a total estimate for work not yet registered.
    pub fn set_total_estimate(&self, total: u64) {
        let mut state = self.state.lock();
        if state.kind != EstimateKind::Finalized {
            state.kind = EstimateKind::LowerBound;
            state.total = total;
        }
    }

    pub fn add_part_done(&self) -> Result<()> {
        self.add_parts_done(1)
    }

    pub fn add_parts_done(&self, parts: u64) -> Result<()> {
        let hooks = {
            let mut state = self.state.lock();
            if state.done + parts > state.known {
                return Err(BindexError::InvalidState(format!(
                    "{}: {} parts done but only {} known",
                    self.subject,
                    state.done + parts,
                    state.known
                )));
            }
            state.done += parts;
            self.check_finished(&mut state)
        };
        run_hooks(hooks, true);
        Ok(())
    }

    /// Finish the operation: every known part is done and the total is final.
    pub fn complete(&self) {
        let hooks = {
            let mut state = self.state.lock();
            if state.abort.is_some() {
                return;
            }
            state.started = true;
            state.known = state.known.max(state.done);
            state.done = state.known;
            state.kind = EstimateKind::Finalized;
            self.check_finished(&mut state)
        };
        run_hooks(hooks, true);
    }

    /// End the operation with `abort`. Later aborts are ignored.
    pub fn abort(&self, abort: TaskAbort) {
        let hooks = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.started = true;
            state.abort = Some(abort);
            self.check_finished(&mut state)
        };
        run_hooks(hooks, false);
    }

    /// Run `hook` once the operation ends; the flag says whether it succeeded.
    /// Runs immediately if it already ended.
    pub fn on_finish(&self, hook: impl FnOnce(bool) + Send + 'static) {
        let ended = {
            let mut state = self.state.lock();
            if state.finished {
                Some(state.abort.is_none())
            } else {
                state.hooks.push(Box::new(hook));
                return;
            }
        };
        if let Some(ok) = ended {
            hook(ok);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().abort.is_some()
    }

    fn check_finished(&self, state: &mut SimpleState) -> Vec<FinishHook> {
        if state.finished || !state.reached_end() {
            return Vec::new();
        }
        state.finished = true;
        self.cond.notify_all();
        std::mem::take(&mut state.hooks)
    }
}

fn run_hooks(hooks: Vec<FinishHook>, ok: bool) {
    for hook in hooks {
        hook(ok);
    }
}

impl Progress for SimpleProgress {
    fn subject(&self) -> String {
        self.subject.clone()
    }

    fn parts(&self) -> Result<ProgressParts> {
        let state = self.state.lock();
        match &state.abort {
            Some(abort) => Err(abort.duplicate().into()),
            None => Ok(state.parts()),
        }
    }

    fn status(&self) -> String {
        let state = self.state.lock();
        if let Some(abort) = &state.abort {
            return format!("{}: {}", self.subject, abort);
        }
        let parts = state.parts();
        match &state.status {
            _ if parts.is_done() => format!("{}: done", self.subject),
            Some(status) => format!("{}: {} ({})", self.subject, status, parts),
            None if !state.started => format!("{}: waiting", self.subject),
            None => format!("{}: {}", self.subject, parts),
        }
    }

    fn is_started(&self) -> bool {
        self.state.lock().started
    }

    fn join(&self) -> Result<()> {
        let mut state = self.state.lock();
        while !state.finished {
            self.cond.wait(&mut state);
        }
        match &state.abort {
            Some(abort) => Err(abort.duplicate().into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_parts_accumulate() {
        let p = SimpleProgress::new("push block");
        assert!(!p.is_started());
        p.add_part_known(3, false).unwrap();
        p.add_part_done().unwrap();
        let parts = p.parts().unwrap();
        assert_eq!((parts.done, parts.known), (1, 3));
        assert_eq!(parts.kind, EstimateKind::Unknown);
        assert!(!p.is_done().unwrap());

        p.add_part_known(0, true).unwrap();
        p.add_parts_done(2).unwrap();
        assert!(p.is_done().unwrap());
        assert_eq!(p.status(), "push block: done");
    }

    #[test]
    fn test_more_done_than_known_is_invalid() {
        let p = SimpleProgress::new("x");
        p.add_part_known(1, false).unwrap();
        p.add_part_done().unwrap();
        assert!(matches!(p.add_part_done(), Err(BindexError::InvalidState(_))));
    }

    #[test]
    fn test_no_parts_after_finalise() {
        let p = SimpleProgress::new("x");
        p.add_part_known(2, true).unwrap();
        assert!(p.add_part_known(1, false).is_err());
    }

    #[test]
    fn test_join_waits_for_completion() {
        let p = Arc::new(SimpleProgress::new("pull"));
        let worker = {
            let p = p.clone();
            thread::spawn(move || {
                p.add_part_known(2, true).unwrap();
                p.add_part_done().unwrap();
                p.add_part_done().unwrap();
            })
        };
        p.join().unwrap();
        worker.join().unwrap();
        assert!(p.is_done().unwrap());
    }

    #[test]
    fn test_abort_surfaces_through_join_and_parts() {
        let p = SimpleProgress::new("pull");
        p.abort(TaskAbort::failed("block missing"));
        assert!(p.parts().is_err());
        let err = p.join().unwrap_err();
        assert!(err.to_string().contains("block missing"));
        assert!(p.status().contains("task aborted"));
    }

    #[test]
    fn test_hooks_run_once() {
        let p = SimpleProgress::new("x");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        p.on_finish(move |ok| {
            assert!(ok);
            c.fetch_add(1, Ordering::SeqCst);
        });
        p.complete();
        p.complete();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // registered after the end: runs immediately
        let c = calls.clone();
        p.on_finish(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_status_with_stage() {
        let p = SimpleProgress::new("merge");
        assert_eq!(p.status(), "merge: waiting");
        p.enter_stage("inflating");
        p.add_part_known(4, false).unwrap();
        assert_eq!(p.status(), "merge: inflating (0/4/??)");
    }
}
