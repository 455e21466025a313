//! Completion gates for asynchronous sub-operations.
//!
//! A sweeper is opened by the operation that spawns work, acquires one handle
//! per spawned unit, and is closed once nothing more will be spawned. It
//! becomes CLEARED when it is closed and every handle has been released.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use parking_lot::{Condvar, Mutex};

use crate::error::BindexError;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SweeperState {
    New,
    Open,
    Closed,
    Cleared,
}

impl fmt::Display for SweeperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweeperState::New => "NEW",
            SweeperState::Open => "OPEN",
            SweeperState::Closed => "CLOSED",
            SweeperState::Cleared => "CLEARED",
        };
        f.write_str(name)
    }
}

pub trait Sweeper<T>: Send + Sync {
    /// NEW -> OPEN
    fn open(&self) -> Result<()>;

    /// Register one in-flight unit. Only valid while OPEN.
    fn acquire(&self, handle: T) -> Result<usize>;

    /// Deregister one unit. Valid while OPEN or CLOSED.
    fn release(&self, handle: &T) -> Result<usize>;

    /// Forbid further acquires. Only valid while OPEN.
    fn close(&self) -> Result<()>;

    fn state(&self) -> SweeperState;

    fn size(&self) -> usize;

    /// Block until CLEARED.
    fn wait_cleared(&self);
}

/// What a sweeper holds: a bare count or a set of identities.
trait Holdings<T>: Send {
    fn add(&mut self, handle: T) -> Result<()>;
    fn remove(&mut self, handle: &T) -> Result<()>;
    fn len(&self) -> usize;
}

struct Count(usize);

impl<T> Holdings<T> for Count {
    fn add(&mut self, _handle: T) -> Result<()> {
        self.0 += 1;
        Ok(())
    }

    fn remove(&mut self, _handle: &T) -> Result<()> {
        if self.0 == 0 {
            return Err(BindexError::InvalidState(
                "release on a sweeper that holds nothing".to_string(),
            ));
        }
        self.0 -= 1;
        Ok(())
    }

    fn len(&self) -> usize {
        self.0
    }
}

struct Tracked<T>(HashSet<T>);

impl<T: Eq + Hash + fmt::Debug + Send> Holdings<T> for Tracked<T> {
    fn add(&mut self, handle: T) -> Result<()> {
        if self.0.contains(&handle) {
            return Err(BindexError::InvalidState(format!(
                "sweeper already holds {:?}",
                handle
            )));
        }
        self.0.insert(handle);
        Ok(())
    }

    fn remove(&mut self, handle: &T) -> Result<()> {
        if !self.0.remove(handle) {
            return Err(BindexError::InvalidState(format!(
                "sweeper does not hold {:?}",
                handle
            )));
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

struct Gate<H> {
    state: SweeperState,
    held: H,
}

struct SweepCore<H> {
    gate: Mutex<Gate<H>>,
    cleared: Condvar,
}

impl<H> SweepCore<H> {
    fn new(held: H) -> Self {
        Self {
            gate: Mutex::new(Gate {
                state: SweeperState::New,
                held,
            }),
            cleared: Condvar::new(),
        }
    }

    fn open(&self) -> Result<()> {
        let mut gate = self.gate.lock();
        if gate.state != SweeperState::New {
            return Err(misuse("open", gate.state));
        }
        gate.state = SweeperState::Open;
        Ok(())
    }

    fn acquire<T>(&self, handle: T) -> Result<usize>
    where
        H: Holdings<T>,
    {
        let mut gate = self.gate.lock();
        if gate.state != SweeperState::Open {
            return Err(misuse("acquire", gate.state));
        }
        gate.held.add(handle)?;
        Ok(gate.held.len())
    }

    fn release<T>(&self, handle: &T) -> Result<usize>
    where
        H: Holdings<T>,
    {
        let mut gate = self.gate.lock();
        if !matches!(gate.state, SweeperState::Open | SweeperState::Closed) {
            return Err(misuse("release", gate.state));
        }
        gate.held.remove(handle)?;
        let left = gate.held.len();
        if left == 0 && gate.state == SweeperState::Closed {
            gate.state = SweeperState::Cleared;
            self.cleared.notify_all();
        }
        Ok(left)
    }

    fn close<T>(&self) -> Result<()>
    where
        H: Holdings<T>,
    {
        let mut gate = self.gate.lock();
        if gate.state != SweeperState::Open {
            return Err(misuse("close", gate.state));
        }
        gate.state = if gate.held.len() == 0 {
            self.cleared.notify_all();
            SweeperState::Cleared
        } else {
            SweeperState::Closed
        };
        Ok(())
    }

    fn state(&self) -> SweeperState {
        self.gate.lock().state
    }

    fn wait_cleared(&self) {
        let mut gate = self.gate.lock();
        while gate.state != SweeperState::Cleared {
            self.cleared.wait(&mut gate);
        }
    }
}

fn misuse(op: &str, state: SweeperState) -> BindexError {
    BindexError::InvalidState(format!("{} on {} sweeper", op, state))
}

/// Sweeper that only counts in-flight units.
pub struct CountingSweeper {
    core: SweepCore<Count>,
}

impl CountingSweeper {
    pub fn new() -> Self {
        Self {
            core: SweepCore::new(Count(0)),
        }
    }

    pub fn open(&self) -> Result<()> {
        self.core.open()
    }

    pub fn close(&self) -> Result<()> {
        self.core.close::<()>()
    }

    pub fn state(&self) -> SweeperState {
        self.core.state()
    }

    pub fn size(&self) -> usize {
        self.core.gate.lock().held.0
    }

    pub fn wait_cleared(&self) {
        self.core.wait_cleared()
    }
}

impl Default for CountingSweeper {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Sweeper<T> for CountingSweeper {
    fn open(&self) -> Result<()> {
        CountingSweeper::open(self)
    }

    fn acquire(&self, handle: T) -> Result<usize> {
        self.core.acquire(handle)
    }

    fn release(&self, handle: &T) -> Result<usize> {
        self.core.release(handle)
    }

    fn close(&self) -> Result<()> {
        CountingSweeper::close(self)
    }

    fn state(&self) -> SweeperState {
        CountingSweeper::state(self)
    }

    fn size(&self) -> usize {
        CountingSweeper::size(self)
    }

    fn wait_cleared(&self) {
        CountingSweeper::wait_cleared(self)
    }
}

/// Sweeper that remembers which handles are in flight.
pub struct TrackingSweeper<T> {
    core: SweepCore<Tracked<T>>,
}

impl<T: Eq + Hash + Clone + fmt::Debug + Send> TrackingSweeper<T> {
    pub fn new() -> Self {
        Self {
            core: SweepCore::new(Tracked(HashSet::new())),
        }
    }

    /// Snapshot of the handles currently held.
    pub fn held(&self) -> Vec<T> {
        self.core.gate.lock().held.0.iter().cloned().collect()
    }

    pub fn is_held(&self, handle: &T) -> bool {
        self.core.gate.lock().held.0.contains(handle)
    }

    /// Release every held handle matching `done`, iterating over a snapshot so
    /// other threads may acquire and release meanwhile. Returns the count
    /// left afterwards.
    pub fn sweep(&self, mut done: impl FnMut(&T) -> bool) -> Result<usize> {
        let mut left = self.size();
        for handle in self.held() {
            if !done(&handle) {
                continue;
            }
            match self.core.release(&handle) {
                Ok(n) => left = n,
                // released by another thread since the snapshot
                Err(_) if !self.is_held(&handle) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(left)
    }
}

impl<T: Eq + Hash + Clone + fmt::Debug + Send> Default for TrackingSweeper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone + fmt::Debug + Send> Sweeper<T> for TrackingSweeper<T> {
    fn open(&self) -> Result<()> {
        self.core.open()
    }

    fn acquire(&self, handle: T) -> Result<usize> {
        self.core.acquire(handle)
    }

    fn release(&self, handle: &T) -> Result<usize> {
        self.core.release(handle)
    }

    fn close(&self) -> Result<()> {
        self.core.close::<T>()
    }

    fn state(&self) -> SweeperState {
        self.core.state()
    }

    fn size(&self) -> usize {
        self.core.gate.lock().held.0.len()
    }

    fn wait_cleared(&self) {
        self.core.wait_cleared()
    }
}
