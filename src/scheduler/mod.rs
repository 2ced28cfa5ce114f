pub mod dispatcher;
pub mod grab;
pub mod job;
pub mod processing;
pub mod queue;
pub mod sched;
pub mod stats;

pub use grab::{GrabItem, GrabQueue, WorkerHandle};
pub use job::{Job, JobStatus, MAX_TIMEOUT};
pub use processing::{Lease, ProcessingSet};
pub use queue::ReadyQueue;
pub use sched::{now, JobState, Outcome, Scheduler};
pub use stats::{FuncStat, FuncStats};
