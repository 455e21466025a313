use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::parts::{EstimateKind, ProgressParts};
use super::progress::Progress;
use crate::Result;

struct Stages {
    completed: Vec<Arc<dyn Progress>>,
    current: Option<Arc<dyn Progress>>,
    sealed: bool,
}

impl Stages {
    fn all(&self) -> Vec<Arc<dyn Progress>> {
        self.completed
            .iter()
            .cloned()
            .chain(self.current.clone())
            .collect()
    }
}

/// Progress of an operation that runs in sequential stages. Only the
/// current stage is active; later stages may not exist yet.
pub struct ChainedProgress {
    subject: String,
    stages: Mutex<Stages>,
    changed: Condvar,
}

impl ChainedProgress {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            stages: Mutex::new(Stages {
                completed: Vec::new(),
                current: None,
                sealed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Start the next stage. The previous current stage is kept for
    /// aggregation.
    pub fn push_stage(&self, progress: Arc<dyn Progress>) {
        let mut stages = self.stages.lock();
        if let Some(previous) = stages.current.take() {
            stages.completed.push(previous);
        }
        stages.current = Some(progress);
        self.changed.notify_all();
    }

    /// No further stages will be pushed.
    pub fn seal(&self) {
        self.stages.lock().sealed = true;
        self.changed.notify_all();
    }

    pub fn current_progress(&self) -> Option<Arc<dyn Progress>> {
        self.stages.lock().current.clone()
    }

    pub fn stage_count(&self) -> usize {
        let stages = self.stages.lock();
        stages.completed.len() + usize::from(stages.current.is_some())
    }
}

impl Progress for ChainedProgress {
    fn subject(&self) -> String {
        self.subject.clone()
    }

    fn parts(&self) -> Result<ProgressParts> {
        let (all, sealed) = {
            let stages = self.stages.lock();
            (stages.all(), stages.sealed)
        };
        let mut parts = Vec::with_capacity(all.len() + 1);
        for stage in all {
            parts.push(stage.parts()?);
        }
        if !sealed {
            parts.push(ProgressParts::new(0, 0, 0, EstimateKind::Unknown));
        }
        Ok(ProgressParts::sum(parts))
    }

    fn status(&self) -> String {
        match self.current_progress() {
            Some(current) if !matches!(self.is_done(), Ok(true)) => {
                format!("{} [stage {}] {}", self.subject, self.stage_count(), current.status())
            }
            _ => match self.parts() {
                Ok(parts) if parts.is_done() => format!("{}: done", self.subject),
                Ok(parts) => format!("{}: {}", self.subject, parts),
                Err(err) => format!("{}: {}", self.subject, err),
            },
        }
    }

    fn is_started(&self) -> bool {
        self.stages.lock().current.is_some()
    }

    fn is_done(&self) -> Result<bool> {
        let (all, sealed) = {
            let stages = self.stages.lock();
            (stages.all(), stages.sealed)
        };
        if !sealed {
            return Ok(false);
        }
        for stage in all {
            if !stage.is_done()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn join(&self) -> Result<()> {
        // Stages only ever append, so the first `joined` stay joined.
        let mut joined = 0;
        loop {
            let all = self.stages.lock().all();
            for stage in &all[joined..] {
                stage.join()?;
            }
            joined = all.len();

            let mut stages = self.stages.lock();
            let count = stages.completed.len() + usize::from(stages.current.is_some());
            if count > joined {
                continue;
            }
            if stages.sealed {
                return Ok(());
            }
            self.changed.wait(&mut stages);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::SimpleProgress;
    use std::thread;
    use std::time::Duration;

    fn stage(known: u64, done: u64) -> Arc<SimpleProgress> {
        let p = Arc::new(SimpleProgress::new(format!("stage {known}")));
        p.add_part_known(known, true).unwrap();
        p.add_parts_done(done).unwrap();
        p
    }

    #[test]
    fn test_parts_span_completed_and_current() {
        let chain = ChainedProgress::new("flush");
        assert!(chain.current_progress().is_none());
        assert!(!chain.is_started());

        chain.push_stage(stage(2, 2));
        chain.push_stage(stage(3, 1));
        let parts = chain.parts().unwrap();
        assert_eq!((parts.done, parts.known), (3, 5));
        // unsealed: more stages may follow
        assert_eq!(parts.kind, EstimateKind::Unknown);

        chain.seal();
        assert_eq!(chain.parts().unwrap().finalized_total(), Some(5));
        assert!(!chain.is_done().unwrap());
        assert_eq!(chain.stage_count(), 2);
    }

    #[test]
    fn test_done_requires_seal() {
        let chain = ChainedProgress::new("flush");
        chain.push_stage(stage(1, 1));
        assert!(!chain.is_done().unwrap());
        chain.seal();
        assert!(chain.is_done().unwrap());
    }

    #[test]
    fn test_join_follows_new_stages() {
        let chain = Arc::new(ChainedProgress::new("flush"));
        let first = Arc::new(SimpleProgress::new("level 1"));
        chain.push_stage(first.clone());

        let joiner = {
            let chain = chain.clone();
            thread::spawn(move || chain.join())
        };

        first.complete();
        thread::sleep(Duration::from_millis(10));
        let second = Arc::new(SimpleProgress::new("level 0"));
        chain.push_stage(second.clone());
        second.complete();
        chain.seal();

        joiner.join().unwrap().unwrap();
        assert!(chain.is_done().unwrap());
    }
}
