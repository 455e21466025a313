use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::btree::{inflate_values, push_slots, Loader, SkeletonBTreeMap};
use super::node::{Child, Ghost, Node, NodeImage};
use crate::archive::{LiveArchiver, LiveTask, Reference};
use crate::error::BindexError;
use crate::exec::{
    ChainedProgress, CompositeProgress, Progress, SimpleProgress, Sweeper, TrackingSweeper,
};
use crate::Result;

/// Child indexes from the root down to a node.
type Path = Vec<usize>;

/// A node push in flight, with the path and size its ghost will take.
type PendingPush = ((Path, u64), LiveTask<Reference>);

fn node_at<'n, K, V>(root: &'n mut Child<K, V>, path: &[usize]) -> Result<&'n mut Node<K, V>> {
    let mut node = root.live_mut()?;
    for &i in path {
        node = node.children[i].live_mut()?;
    }
    Ok(node)
}

fn set_child<K, V>(root: &mut Child<K, V>, path: &[usize], replacement: Child<K, V>) -> Result<()> {
    match path.split_last() {
        None => *root = replacement,
        Some((&last, parent)) => node_at(root, parent)?.children[last] = replacement,
    }
    Ok(())
}

/// Record every changed node by depth. Unchanged subtrees become ghosts of
/// the blocks they came from.
fn collect_dirty<K, V>(node: &mut Node<K, V>, path: Path, levels: &mut Vec<Vec<Path>>) {
    for (i, child) in node.children.iter_mut().enumerate() {
        let clean = match child {
            Child::Live(live) => live.origin.clone().map(|origin| Ghost {
                reference: origin,
                size: live.size(),
            }),
            Child::Ghost(_) => continue,
        };
        match clean {
            Some(ghost) => *child = Child::Ghost(ghost),
            None => {
                if let Child::Live(live) = child {
                    let mut below = path.clone();
                    below.push(i);
                    collect_dirty(live, below, levels);
                }
            }
        }
    }
    let depth = path.len();
    if levels.len() <= depth {
        levels.resize_with(depth + 1, Vec::new);
    }
    levels[depth].push(path);
}

/// Gate for one level of background tasks: each task holds a handle until
/// its progress finishes.
struct LevelGate {
    stage: Arc<CompositeProgress>,
    sweeper: Arc<TrackingSweeper<usize>>,
}

impl LevelGate {
    fn open(
        subject: String,
        progress: &ChainedProgress,
        (initial, max): (Duration, Duration),
    ) -> Result<Self> {
        let stage = Arc::new(CompositeProgress::new(subject).with_backoff(initial, max));
        progress.push_stage(stage.clone());
        let sweeper = Arc::new(TrackingSweeper::new());
        sweeper.open()?;
        Ok(Self { stage, sweeper })
    }

    fn task_progress(&self, n: usize, subject: String) -> Result<Arc<SimpleProgress>> {
        let progress = Arc::new(SimpleProgress::new(subject));
        self.sweeper.acquire(n)?;
        let sweeper = self.sweeper.clone();
        progress.on_finish(move |_| {
            if let Err(err) = sweeper.release(&n) {
                warn!(task = n, error = %err, "releasing level task failed");
            }
        });
        self.stage.add(progress.clone());
        Ok(progress)
    }

    fn close_and_wait(&self) -> Result<()> {
        self.sweeper.close()?;
        self.sweeper.wait_cleared();
        trace!(stage = %self.stage.subject(), tasks = %self.stage.task_parts()?, "level settled");
        Ok(())
    }
}

/// Join every task, keeping the first failure.
fn join_all<T, R>(
    tasks: Vec<(T, LiveTask<R>)>,
    mut apply: impl FnMut(T, R) -> Result<()>,
) -> Result<()> {
    let mut first_error: Option<BindexError> = None;
    for (item, task) in tasks {
        let outcome = task.join().and_then(|result| apply(item, result));
        if let Err(err) = outcome {
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct PendingPull<K> {
    path: Path,
    ghost: Ghost,
    lower: Option<K>,
    upper: Option<K>,
}

impl<K, V> SkeletonBTreeMap<K, V>
where
    K: Ord + Clone + Debug,
{
    /// Deflate level by level from the leaves up. Each level's values are
    /// pushed first, then its nodes go through `archiver` in parallel; the
    /// next level starts only once every push of this one has finished.
    ///
    /// One stage per level is pushed onto `progress`, which is sealed on
    /// return. On failure the tree stays valid: nodes whose push failed are
    /// still live.
    pub fn flush(
        &mut self,
        archiver: &dyn LiveArchiver<NodeImage<K>>,
        progress: &ChainedProgress,
    ) -> Result<Reference> {
        let result = self.flush_levels(archiver, progress);
        progress.seal();
        result
    }

    fn flush_levels(
        &mut self,
        archiver: &dyn LiveArchiver<NodeImage<K>>,
        progress: &ChainedProgress,
    ) -> Result<Reference> {
        let root = match &mut self.root {
            Child::Ghost(ghost) => return Ok(ghost.reference.clone()),
            Child::Live(root) => root,
        };
        if let Some(origin) = root.origin.clone() {
            let size = root.size();
            self.root = Child::Ghost(Ghost {
                reference: origin.clone(),
                size,
            });
            return Ok(origin);
        }

        let mut levels = Vec::new();
        collect_dirty(root, Vec::new(), &mut levels);
        let depth_count = levels.len();

        for (depth, paths) in levels.into_iter().enumerate().rev() {
            let gate = self.level_gate(format!("flush level {}", depth), progress)?;
            let mut tasks = Vec::with_capacity(paths.len());
            // Pushes already queued are settled and joined even when a later
            // node of the level fails, so their nodes still become ghosts.
            let submitted = self.submit_level(paths, archiver, &gate, &mut tasks);
            let pushed = tasks.len();
            let settled = gate.close_and_wait();

            let root = &mut self.root;
            let joined = join_all(tasks, |(path, size), reference| {
                set_child(root, &path, Child::Ghost(Ghost { reference, size }))
            });
            submitted.and(settled).and(joined)?;
            debug!(container = %self.id, level = depth, nodes = pushed, "flushed level");
        }
        archiver.wait_for_async_inserts()?;

        match &self.root {
            Child::Ghost(ghost) => {
                info!(container = %self.id, root = %ghost.reference, levels = depth_count, "flushed tree");
                Ok(ghost.reference.clone())
            }
            Child::Live(_) => Err(BindexError::Internal(
                "root still live after flush".to_string(),
            )),
        }
    }

    fn level_gate(&self, subject: String, progress: &ChainedProgress) -> Result<LevelGate> {
        LevelGate::open(subject, progress, self.ctx.join_backoff)
    }

    /// Push the values of every node in `paths`, then queue the node itself.
    fn submit_level(
        &mut self,
        paths: Vec<Path>,
        archiver: &dyn LiveArchiver<NodeImage<K>>,
        gate: &LevelGate,
        tasks: &mut Vec<PendingPush>,
    ) -> Result<()> {
        for (n, path) in paths.into_iter().enumerate() {
            let node = node_at(&mut self.root, &path)?;
            push_slots(&*self.ctx.values, node.keys.iter().zip(node.vals.iter_mut()))?;
            let image = node.to_image(self.ctx.settings.node_min)?;
            let size = node.size();
            let task_progress = gate.task_progress(n, format!("push node {:?}", path))?;
            tasks.push(((path, size), archiver.push_live(image, task_progress)));
        }
        Ok(())
    }

    /// Load every node level by level from the root down, pulling each
    /// level's nodes through `archiver` in parallel, and then their values.
    pub fn inflate_live(
        &mut self,
        archiver: &dyn LiveArchiver<NodeImage<K>>,
        progress: &ChainedProgress,
    ) -> Result<()> {
        let result = self.inflate_levels(archiver, progress);
        progress.seal();
        result
    }

    fn inflate_levels(
        &mut self,
        archiver: &dyn LiveArchiver<NodeImage<K>>,
        progress: &ChainedProgress,
    ) -> Result<()> {
        let loader = Loader::new(&self.ctx, self.id);
        loader.ensure(&mut self.root, None, None, true)?;

        let mut level: Vec<Path> = vec![Vec::new()];
        let mut depth = 0;
        while !level.is_empty() {
            let mut next = Vec::new();
            let mut ghosts = Vec::new();
            for path in &level {
                let node = node_at(&mut self.root, path)?;
                inflate_values(&*self.ctx.values, node)?;
                for (i, child) in node.children.iter().enumerate() {
                    let mut below = path.clone();
                    below.push(i);
                    match child {
                        Child::Live(_) => next.push(below),
                        Child::Ghost(ghost) => ghosts.push(PendingPull {
                            path: below,
                            ghost: ghost.clone(),
                            lower: i.checked_sub(1).and_then(|j| node.keys.get(j)).cloned(),
                            upper: node.keys.get(i).cloned(),
                        }),
                    }
                }
            }

            if !ghosts.is_empty() {
                let gate = self.level_gate(format!("inflate level {}", depth + 1), progress)?;
                let mut tasks = Vec::with_capacity(ghosts.len());
                let mut submitted = Ok(());
                for (n, pending) in ghosts.into_iter().enumerate() {
                    let subject = format!("pull node {}", pending.ghost.reference);
                    match gate.task_progress(n, subject) {
                        Ok(task_progress) => {
                            let reference = pending.ghost.reference.clone();
                            tasks.push((pending, archiver.pull_live(reference, task_progress)));
                        }
                        Err(err) => {
                            submitted = Err(err);
                            break;
                        }
                    }
                }
                let pulled = tasks.len();
                let settled = gate.close_and_wait();

                let root = &mut self.root;
                let joined = join_all(tasks, |pending, image| {
                    let node = loader.build(
                        image,
                        pending.ghost.reference,
                        pending.ghost.size,
                        pending.lower.as_ref(),
                        pending.upper.as_ref(),
                        false,
                    )?;
                    set_child(root, &pending.path, Child::Live(Box::new(node)))?;
                    next.push(pending.path);
                    Ok(())
                });
                submitted.and(settled).and(joined)?;
                debug!(container = %self.id, level = depth + 1, nodes = pulled, "inflated level");
            }
            level = next;
            depth += 1;
        }
        Ok(())
    }
}
