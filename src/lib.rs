//! Work-stealing, DAG-driven executor for fine-grained compute tiles.
//!
//! Compiled programs emit dispatches over a 3-D workgroup grid; the executor
//! fans each dispatch out across a fixed pool of worker threads, either as
//! statically partitioned slices or as dynamically work-stealing shards.
//! Between dispatches, plain tasks (calls, barriers, fences, waits) form a
//! dependency DAG: a task runs once every predecessor has retired, and
//! failures latch into the submission's scope, discarding everything
//! downstream while in-flight tiles drain.
//!
//! Quick start:
//!
//! ```no_run
//! use workgrid::{DispatchParams, Executor, Scope, Submission, Task};
//!
//! # fn main() -> anyhow::Result<()> {
//! let executor = Executor::create(4, 64 * 1024)?;
//! let scope = Scope::new("example");
//!
//! let dispatch = Task::dispatch(&scope, DispatchParams::default(), [8, 8, 1], |tile| {
//!     // Executes once per (x, y, z) in the 8x8x1 grid, on any worker.
//!     let _ = tile.workgroup_xyz;
//!     Ok(())
//! });
//!
//! let mut submission = Submission::new();
//! submission.enqueue(dispatch);
//! executor.submit(submission)?;
//! scope.wait()?;
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub use dispatch::{
    DispatchMode, DispatchParams, DispatchStatistics, TileContext, WorkgroupCountBuffer,
};

pub mod executor;
pub use executor::{Builder, Executor};

pub mod scope;
pub use scope::Scope;

pub mod status;
pub use status::{StatusCode, TaskError, TaskResult};

pub mod task;
pub use task::{AffinitySet, Submission, Task, TaskKind, TaskList, TaskPool, TaskRef, WaitHandle};

pub mod tuning;
