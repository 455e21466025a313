//! Progress tracking and completion gating for asynchronous work.

mod chained;
mod composite;
mod parts;
mod progress;
mod sweeper;

pub use chained::ChainedProgress;
pub use composite::CompositeProgress;
pub use parts::{EstimateKind, ProgressParts};
pub use progress::{Progress, SimpleProgress};
pub use sweeper::{CountingSweeper, Sweeper, SweeperState, TrackingSweeper};
