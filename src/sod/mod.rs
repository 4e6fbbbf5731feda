//! Scan-on-demand: rescans of existing builds on a resizable worker pool.

pub mod pool;
pub mod queue;
pub mod task;

pub use pool::{CancelToken, ShutdownReport, Task, WorkerPool};
pub use queue::ScanOnDemandQueue;
pub use task::{BuildLocks, ScanTask, TaskOutcome};
