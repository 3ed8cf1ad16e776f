//! Dispatch tasks: fan-out of a 3-D workgroup grid into tile executions.
//!
//! A dispatch carries a tile closure and a workgroup grid `(Wx, Wy, Wz)`.
//! When a worker first picks it up the partitioner expands it, exactly once,
//! into children that each execute a portion of the grid: statically sized
//! slices or dynamically stealing shards, chosen by the submitter per
//! dispatch. The children set the dispatch as their completion task, so the
//! dispatch retires when the last child does.

use crate::scope::Scope;
use crate::status::{StatusLatch, TaskResult};
use crate::task::{self, Body, Submission, Task, TaskFlags, TaskRef};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

mod execute;
pub(crate) use execute::{execute_shard, execute_slice};

mod partition;
pub(crate) use partition::issue;

/// Closure executed once per tile.
pub type TileFn = dyn Fn(&mut TileContext<'_>) -> TaskResult + Send + Sync;

/// Everything a tile closure sees for one invocation.
pub struct TileContext<'a> {
    /// This tile's coordinates in the workgroup grid.
    pub workgroup_xyz: [u32; 3],

    pub workgroup_size: [u32; 3],

    pub workgroup_count: [u32; 3],

    /// Scratch memory owned by the executing worker, clipped to the amount
    /// the dispatch asked for. Contents are undefined on entry and do not
    /// survive across tiles on other workers.
    pub local_memory: &'a mut [u8],

    /// Statistics sink for this slice/shard; merged into the dispatch when
    /// the child finishes.
    pub statistics: &'a DispatchStatistics,
}

/// How the partitioner cuts a dispatch's grid across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// One shard per participating worker, dynamically reserving tile ranges
    /// from a shared counter. Best for skewed workloads.
    #[default]
    Sharded,

    /// Fixed-size 3-D slices statically assigned round-robin. Best for
    /// uniform workloads where locality matters more than balance.
    Sliced,
}

/// Submitter-chosen parameters of a dispatch.
#[derive(Debug, Clone)]
pub struct DispatchParams {
    pub workgroup_size: [u32; 3],

    /// Bytes of worker-local scratch each tile may touch. Dispatches asking
    /// for more than the executor provides fail with resource exhaustion.
    pub local_memory_size: usize,

    pub mode: DispatchMode,
}

impl Default for DispatchParams {
    fn default() -> Self {
        Self {
            workgroup_size: [1, 1, 1],
            local_memory_size: 0,
            mode: DispatchMode::default(),
        }
    }
}

/// Buffer an indirect dispatch reads its workgroup count from at issue time.
/// Predecessor tasks write it; the dependency edge orders the write before
/// the read.
#[derive(Debug, Default)]
pub struct WorkgroupCountBuffer([AtomicU32; 3]);

impl WorkgroupCountBuffer {
    pub fn new(workgroup_count: [u32; 3]) -> Arc<Self> {
        let buffer = Arc::new(Self::default());
        buffer.store(workgroup_count);
        buffer
    }

    pub fn store(&self, workgroup_count: [u32; 3]) {
        for (slot, value) in self.0.iter().zip(workgroup_count) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    pub fn load(&self) -> [u32; 3] {
        [
            self.0[0].load(Ordering::Relaxed),
            self.0[1].load(Ordering::Relaxed),
            self.0[2].load(Ordering::Relaxed),
        ]
    }
}

/// Counters aggregated per slice/shard, rolled up into the dispatch and then
/// into the scope. Extensible; everything here is monotonic and relaxed.
#[derive(Debug, Default)]
pub struct DispatchStatistics {
    tiles_executed: AtomicU64,
    slices_completed: AtomicU64,
    shards_completed: AtomicU64,
    shard_reservations: AtomicU64,
}

impl DispatchStatistics {
    pub fn tiles_executed(&self) -> u64 {
        self.tiles_executed.load(Ordering::Relaxed)
    }

    pub fn slices_completed(&self) -> u64 {
        self.slices_completed.load(Ordering::Relaxed)
    }

    pub fn shards_completed(&self) -> u64 {
        self.shards_completed.load(Ordering::Relaxed)
    }

    pub fn shard_reservations(&self) -> u64 {
        self.shard_reservations.load(Ordering::Relaxed)
    }

    pub(crate) fn record_tile(&self) {
        self.tiles_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_slice(&self) {
        self.slices_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shard(&self) {
        self.shards_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reservation(&self) {
        self.shard_reservations.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds this set of counters into `target`.
    pub(crate) fn merge_into(&self, target: &DispatchStatistics) {
        target
            .tiles_executed
            .fetch_add(self.tiles_executed(), Ordering::Relaxed);
        target
            .slices_completed
            .fetch_add(self.slices_completed(), Ordering::Relaxed);
        target
            .shards_completed
            .fetch_add(self.shards_completed(), Ordering::Relaxed);
        target
            .shard_reservations
            .fetch_add(self.shard_reservations(), Ordering::Relaxed);
    }
}

/// State shared between a dispatch and all of its children.
pub(crate) struct DispatchShared {
    pub(crate) closure: Box<TileFn>,
    pub(crate) workgroup_size: [u32; 3],
    pub(crate) local_memory_size: usize,

    /// First tile failure across all children; consumed when the dispatch
    /// retires.
    pub(crate) status: StatusLatch,

    pub(crate) statistics: DispatchStatistics,
}

pub(crate) enum WorkgroupCount {
    Direct([u32; 3]),
    Indirect(Arc<WorkgroupCountBuffer>),
}

pub(crate) struct DispatchBody {
    pub(crate) shared: Arc<DispatchShared>,
    pub(crate) workgroup_count: Mutex<WorkgroupCount>,
    pub(crate) mode: DispatchMode,
}

pub(crate) struct SliceBody {
    pub(crate) shared: Arc<DispatchShared>,
    pub(crate) workgroup_base: [u32; 3],

    /// Inclusive upper corner of this slice's tile cube.
    pub(crate) workgroup_range: [u32; 3],

    pub(crate) workgroup_count: [u32; 3],
}

/// Iteration state shared by every shard of one dispatch. `tile_index` is the
/// only mutable datum; overshooting reservations are harmless because each
/// shard rechecks against `tile_count`.
pub(crate) struct ShardState {
    pub(crate) tile_index: AtomicU32,
    pub(crate) tile_count: u32,
    pub(crate) tiles_per_reservation: u32,
    pub(crate) workgroup_count: [u32; 3],
}

pub(crate) struct ShardBody {
    pub(crate) shared: Arc<DispatchShared>,
    pub(crate) state: Arc<ShardState>,
}

impl Task {
    /// A dispatch over a literal workgroup grid.
    pub fn dispatch(
        scope: &Arc<Scope>,
        params: DispatchParams,
        workgroup_count: [u32; 3],
        closure: impl Fn(&mut TileContext<'_>) -> TaskResult + Send + Sync + 'static,
    ) -> TaskRef {
        Arc::new(Task::from_body(
            scope,
            Body::Dispatch(DispatchBody {
                shared: Arc::new(DispatchShared {
                    closure: Box::new(closure),
                    workgroup_size: params.workgroup_size,
                    local_memory_size: params.local_memory_size,
                    status: StatusLatch::new(),
                    statistics: DispatchStatistics::default(),
                }),
                workgroup_count: Mutex::new(WorkgroupCount::Direct(workgroup_count)),
                mode: params.mode,
            }),
        ))
    }

    /// A dispatch whose workgroup count is read from `workgroup_count_buffer`
    /// at issue time, after every dependency has retired.
    pub fn dispatch_indirect(
        scope: &Arc<Scope>,
        params: DispatchParams,
        workgroup_count_buffer: &Arc<WorkgroupCountBuffer>,
        closure: impl Fn(&mut TileContext<'_>) -> TaskResult + Send + Sync + 'static,
    ) -> TaskRef {
        let task = Arc::new(Task::from_body(
            scope,
            Body::Dispatch(DispatchBody {
                shared: Arc::new(DispatchShared {
                    closure: Box::new(closure),
                    workgroup_size: params.workgroup_size,
                    local_memory_size: params.local_memory_size,
                    status: StatusLatch::new(),
                    statistics: DispatchStatistics::default(),
                }),
                workgroup_count: Mutex::new(WorkgroupCount::Indirect(Arc::clone(
                    workgroup_count_buffer,
                ))),
                mode: params.mode,
            }),
        ));
        task.set_flag(TaskFlags::DISPATCH_INDIRECT);
        task
    }
}

/// Retires a dispatch after its last child did: merges the aggregated
/// statistics into the scope and consumes the status a tile may have latched.
///
/// Consuming the status here, rather than in the failing child, lets the
/// remaining children finish instead of tearing the shared dispatch state out
/// from under them; failures in a dispatch are rare enough that the extra
/// completed tiles are not worth fine-grained synchronization.
pub(crate) fn dispatch_retire(task: TaskRef, pending_submission: &mut Submission) {
    let status = {
        let Body::Dispatch(dispatch) = task.body() else {
            unreachable!("dispatch_retire on a non-dispatch task");
        };
        dispatch.shared.statistics.merge_into(task.scope().statistics());
        dispatch.shared.status.take()
    };
    task::retire(task, pending_submission, status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workgroup_count_buffer_roundtrip() {
        let buffer = WorkgroupCountBuffer::new([4, 2, 1]);
        assert_eq!(buffer.load(), [4, 2, 1]);

        buffer.store([0, 3, 3]);
        assert_eq!(buffer.load(), [0, 3, 3]);
    }

    #[test]
    fn test_statistics_merge_accumulates() {
        let source = DispatchStatistics::default();
        source.record_tile();
        source.record_tile();
        source.record_slice();

        let target = DispatchStatistics::default();
        target.record_tile();

        source.merge_into(&target);
        assert_eq!(target.tiles_executed(), 3);
        assert_eq!(target.slices_completed(), 1);
        assert_eq!(target.shards_completed(), 0);
    }

    #[test]
    fn test_indirect_dispatch_starts_flagged() {
        let scope = Scope::new("indirect");
        let buffer = WorkgroupCountBuffer::new([1, 1, 1]);
        let task = Task::dispatch_indirect(
            &scope,
            DispatchParams::default(),
            &buffer,
            |_ctx| Ok(()),
        );
        assert!(task.has_flag(TaskFlags::DISPATCH_INDIRECT));
        assert!(!task.has_flag(TaskFlags::DISPATCH_RETIRE));
    }
}
