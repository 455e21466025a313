use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{abort_from, Archiver, LiveArchiver, LiveTask, Reference};
use crate::config::ArchiverConfig;
use crate::error::TaskAbort;
use crate::exec::SimpleProgress;
use crate::Result;

type Job = Box<dyn FnOnce() + Send>;

/// Live pushes not yet finished, keyed by task id so that two pushes of
/// equal items are tracked separately.
#[derive(Default)]
struct Inserts {
    pending: HashSet<u64>,
    failed: Vec<TaskAbort>,
}

#[derive(Default)]
struct InsertTracker {
    inserts: Mutex<Inserts>,
    drained: Condvar,
}

impl InsertTracker {
    fn begin(&self, id: u64) {
        self.inserts.lock().pending.insert(id);
    }

    fn finish(&self, id: u64, failure: Option<TaskAbort>) {
        let mut inserts = self.inserts.lock();
        inserts.pending.remove(&id);
        if let Some(abort) = failure {
            inserts.failed.push(abort);
        }
        if inserts.pending.is_empty() {
            self.drained.notify_all();
        }
    }

    fn wait(&self) -> Result<()> {
        let mut inserts = self.inserts.lock();
        while !inserts.pending.is_empty() {
            self.drained.wait(&mut inserts);
        }
        let mut failed = std::mem::take(&mut inserts.failed);
        if failed.is_empty() {
            Ok(())
        } else {
            Err(failed.swap_remove(0).into())
        }
    }
}

/// Runs an archiver's pushes and pulls on a pool of worker threads.
pub struct ThreadedArchiver<T> {
    inner: Arc<dyn Archiver<T>>,
    jobs: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
    inserts: Arc<InsertTracker>,
    next_task: AtomicU64,
}

impl<T: Send + 'static> ThreadedArchiver<T> {
    pub fn new(inner: Arc<dyn Archiver<T>>, config: &ArchiverConfig) -> Self {
        let (tx, rx) = channel::unbounded::<Job>();
        let workers = (0..config.worker_threads.max(1))
            .map(|n| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("bindex-archiver-{}", n))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("failed to spawn archiver worker: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        debug!(workers = workers.len(), "archiver pool started");
        Self {
            inner,
            jobs: Some(tx),
            workers,
            inserts: Arc::new(InsertTracker::default()),
            next_task: AtomicU64::new(1),
        }
    }

    fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        if self.workers.is_empty() {
            return Err(job);
        }
        match &self.jobs {
            Some(tx) => tx.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }
}

impl<T: Send + 'static> Archiver<T> for ThreadedArchiver<T> {
    fn push(&self, item: &T) -> Result<Reference> {
        self.inner.push(item)
    }

    fn pull(&self, reference: &Reference) -> Result<T> {
        self.inner.pull(reference)
    }
}

impl<T: Send + 'static> LiveArchiver<T> for ThreadedArchiver<T> {
    fn push_live(&self, item: T, progress: Arc<SimpleProgress>) -> LiveTask<Reference> {
        let task = LiveTask::new(progress.clone());
        let slot = task.slot();
        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        self.inserts.begin(id);

        let inner = self.inner.clone();
        let inserts = self.inserts.clone();
        let job: Job = Box::new(move || {
            progress.enter_stage("pushing");
            let _ = progress.add_part_known(1, true);
            match inner.push(&item) {
                Ok(reference) => {
                    *slot.lock() = Some(reference);
                    inserts.finish(id, None);
                    progress.complete();
                }
                Err(err) => {
                    let abort = abort_from(format!("push task {} failed", id), err);
                    warn!(task = id, "live push failed: {}", abort);
                    inserts.finish(id, Some(abort.duplicate()));
                    progress.abort(abort);
                }
            }
        });

        if let Err(job) = self.submit(job) {
            // Pool is gone: run inline so the task still completes.
            job();
        }
        task
    }

    fn pull_live(&self, reference: Reference, progress: Arc<SimpleProgress>) -> LiveTask<T> {
        let task = LiveTask::new(progress.clone());
        let slot = task.slot();
        let inner = self.inner.clone();
        let job: Job = Box::new(move || {
            progress.enter_stage("pulling");
            let _ = progress.add_part_known(1, true);
            match inner.pull(&reference) {
                Ok(item) => {
                    *slot.lock() = Some(item);
                    progress.complete();
                }
                Err(err) => {
                    progress.abort(abort_from(format!("pull of {} failed", reference), err));
                }
            }
        });

        if let Err(job) = self.submit(job) {
            job();
        }
        task
    }

    fn wait_for_async_inserts(&self) -> Result<()> {
        self.inserts.wait()
    }
}

impl<T> Drop for ThreadedArchiver<T> {
    fn drop(&mut self) {
        // Closing the channel lets workers drain the queue and exit.
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("archiver worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchiver;
    use crate::exec::Progress;

    struct Flaky;

    impl Archiver<Vec<u8>> for Flaky {
        fn push(&self, item: &Vec<u8>) -> Result<Reference> {
            if item.is_empty() {
                Err(TaskAbort::failed("empty blocks are rejected").into())
            } else {
                Ok(Reference::digest(item))
            }
        }

        fn pull(&self, reference: &Reference) -> Result<Vec<u8>> {
            Err(TaskAbort::failed(format!("{} unavailable", reference)).into())
        }
    }

    fn pool(inner: Arc<dyn Archiver<Vec<u8>>>) -> ThreadedArchiver<Vec<u8>> {
        ThreadedArchiver::new(inner, &ArchiverConfig::default().with_worker_threads(3))
    }

    #[test]
    fn test_live_push_then_pull() {
        let memory = Arc::new(MemoryArchiver::new());
        let archiver = pool(memory.clone());

        let tasks: Vec<_> = (0..20u8)
            .map(|i| archiver.push_live(vec![i; 8], Arc::new(SimpleProgress::new(format!("push {i}")))))
            .collect();
        archiver.wait_for_async_inserts().unwrap();
        assert_eq!(memory.len(), 20);

        let refs: Vec<Reference> = tasks.into_iter().map(|t| t.join().unwrap()).collect();
        let pulled = archiver
            .pull_live(refs[3].clone(), Arc::new(SimpleProgress::new("pull")))
            .join()
            .unwrap();
        assert_eq!(pulled, vec![3u8; 8]);
    }

    #[test]
    fn test_wait_reports_first_failure_once() {
        let archiver = pool(Arc::new(Flaky));
        let ok = archiver.push_live(vec![1], Arc::new(SimpleProgress::new("ok")));
        let bad = archiver.push_live(Vec::new(), Arc::new(SimpleProgress::new("bad")));

        let err = archiver.wait_for_async_inserts().unwrap_err();
        assert!(err.to_string().contains("empty blocks are rejected"));
        assert!(ok.join().is_ok());
        assert!(bad.progress().is_aborted());
        assert!(bad.join().is_err());

        // failures are reported once
        archiver.wait_for_async_inserts().unwrap();
    }

    #[test]
    fn test_failed_pull_aborts_progress() {
        let archiver = pool(Arc::new(Flaky));
        let progress = Arc::new(SimpleProgress::new("pull"));
        let task = archiver.pull_live(Reference::digest(b"x"), progress.clone());
        assert!(task.join().is_err());
        assert!(progress.parts().is_err());
    }
}
