//! Expansion of a dispatch into slice or shard children.
//!
//! Runs on the worker that first pops the dispatch, exactly once per
//! dispatch: the parent is flagged for retirement before any child exists,
//! so the next time it surfaces (readied by its last child) it retires
//! instead of partitioning again.

use crate::dispatch::{
    DispatchMode, ShardBody, ShardState, SliceBody, WorkgroupCount, dispatch_retire,
};
use crate::executor::{PostBatch, Shared};
use crate::status::TaskError;
use crate::task::{Body, Submission, Task, TaskFlags, TaskRef};
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use tracing::{debug, warn};

pub(crate) fn issue(
    task: TaskRef,
    executor: &Shared,
    pending_submission: &mut Submission,
    post_batch: &mut PostBatch<'_>,
) {
    // Mark the dispatch as issued; the next time it surfaces it is because
    // all children completed and it must retire.
    task.set_flag(TaskFlags::DISPATCH_RETIRE);

    let mode = {
        let Body::Dispatch(dispatch) = task.body() else {
            unreachable!("issue on a non-dispatch task");
        };
        dispatch.mode
    };
    match mode {
        DispatchMode::Sliced => issue_sliced(&task, executor, pending_submission, post_batch),
        DispatchMode::Sharded => issue_sharded(&task, executor, pending_submission, post_batch),
    }
}

/// Statically cuts the grid into 3-D slices and deals them round-robin to
/// workers from a randomized starting offset.
fn issue_sliced(
    task: &TaskRef,
    executor: &Shared,
    pending_submission: &mut Submission,
    post_batch: &mut PostBatch<'_>,
) {
    let Body::Dispatch(dispatch) = task.body() else {
        unreachable!("issue_sliced on a non-dispatch task");
    };

    // Fetch the workgroup count, directly or through the indirection buffer.
    // The dispatch being ready means whatever wrote that buffer has retired.
    let workgroup_count = match &*dispatch.workgroup_count.lock() {
        WorkgroupCount::Direct(value) => *value,
        WorkgroupCount::Indirect(buffer) => buffer.load(),
    };
    if workgroup_count.contains(&0) {
        // No workgroups to execute - bail early.
        dispatch_retire(Arc::clone(task), pending_submission);
        return;
    }

    let slices = slice_grid(workgroup_count, executor.cfg.tiles_per_slice);
    let worker_count = post_batch.worker_count();
    let slices_per_worker = (slices.len() / worker_count).max(1);
    let mut worker_index = post_batch.select_worker(task.affinity());

    debug!(
        scope = %task.scope().name(),
        ?workgroup_count,
        slices = slices.len(),
        "issuing sliced dispatch"
    );

    let mut issued = 0usize;
    let mut worker_slice_count = 0usize;
    for (workgroup_base, workgroup_range) in slices {
        let child = {
            let scope = Arc::clone(task.scope());
            let shared = Arc::clone(&dispatch.shared);
            executor.slice_pool.acquire_with(move || {
                Task::from_body(
                    &scope,
                    Body::DispatchSlice(SliceBody {
                        shared,
                        workgroup_base,
                        workgroup_range,
                        workgroup_count,
                    }),
                )
            })
        };
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                // Losing children shrinks the fan-out; the remaining slices
                // still cover their own ranges.
                warn!(?err, issued, "slice pool exhausted during partitioning");
                break;
            }
        };
        child.set_completion_task(task);
        post_batch.enqueue(worker_index % worker_count, child);
        issued += 1;

        worker_slice_count += 1;
        if worker_slice_count >= slices_per_worker {
            worker_index += 1;
            worker_slice_count = 0;
        }
    }

    // The dispatch retires when the last child does; with no children at all
    // (the pool gave us nothing) it must fail here or it would never retire.
    if issued == 0 {
        dispatch
            .shared
            .status
            .fail(TaskError::ResourceExhausted(
                "no slice records available for dispatch".into(),
            ));
        dispatch_retire(Arc::clone(task), pending_submission);
    }
}

/// One shard per participating worker, all pulling tile ranges from a shared
/// atomic counter.
fn issue_sharded(
    task: &TaskRef,
    executor: &Shared,
    pending_submission: &mut Submission,
    post_batch: &mut PostBatch<'_>,
) {
    let Body::Dispatch(dispatch) = task.body() else {
        unreachable!("issue_sharded on a non-dispatch task");
    };

    // Resolve the indirection once, converting the dispatch to a direct one;
    // everything downstream reads the literal value.
    if task.has_flag(TaskFlags::DISPATCH_INDIRECT) {
        let mut count = dispatch.workgroup_count.lock();
        let resolved = match &*count {
            WorkgroupCount::Indirect(buffer) => Some(buffer.load()),
            WorkgroupCount::Direct(_) => None,
        };
        if let Some(value) = resolved {
            *count = WorkgroupCount::Direct(value);
        }
        task.clear_flag(TaskFlags::DISPATCH_INDIRECT);
    }
    let workgroup_count = match &*dispatch.workgroup_count.lock() {
        WorkgroupCount::Direct(value) => *value,
        WorkgroupCount::Indirect(_) => unreachable!("indirection resolved above"),
    };

    let tile_count = workgroup_count[0] * workgroup_count[1] * workgroup_count[2];
    if tile_count == 0 {
        dispatch_retire(Arc::clone(task), pending_submission);
        return;
    }

    let worker_count = post_batch.worker_count();
    let shard_count = (tile_count as usize).min(worker_count);

    // Small grids are eagerly sliced up one tile at a time so late workers
    // can still steal; everything else amortizes the shared counter.
    let max_reservation = executor.cfg.max_tiles_per_shard_reservation;
    let tiles_per_reservation = if tile_count < worker_count as u32 * max_reservation {
        1
    } else {
        max_reservation
    };

    let state = Arc::new(ShardState {
        tile_index: AtomicU32::new(0),
        tile_count,
        tiles_per_reservation,
        workgroup_count,
    });

    debug!(
        scope = %task.scope().name(),
        ?workgroup_count,
        shard_count,
        tiles_per_reservation,
        "issuing sharded dispatch"
    );

    let mut worker_index = post_batch.select_worker(task.affinity());
    let mut issued = 0usize;
    for _ in 0..shard_count {
        let child = {
            let scope = Arc::clone(task.scope());
            let shared = Arc::clone(&dispatch.shared);
            let state = Arc::clone(&state);
            executor.shard_pool.acquire_with(move || {
                Task::from_body(&scope, Body::DispatchShard(ShardBody { shared, state }))
            })
        };
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                // Fewer shards just means less parallelism; the survivors
                // drain the whole grid through the shared counter.
                warn!(?err, issued, "shard pool exhausted during partitioning");
                break;
            }
        };
        child.set_completion_task(task);
        post_batch.enqueue(worker_index % worker_count, child);
        worker_index += 1;
        issued += 1;
    }

    if issued == 0 {
        dispatch
            .shared
            .status
            .fail(TaskError::ResourceExhausted(
                "no shard records available for dispatch".into(),
            ));
        dispatch_retire(Arc::clone(task), pending_submission);
    }
}

/// Cuts the grid into slice cubes of roughly `tiles_per_slice` tiles,
/// returned as `(base, inclusive range)` pairs in z-major order.
///
/// Slices per axis is `max(1, count / tiles)`; the final slice of each axis
/// absorbs the remainder so the cubes tile the grid exactly, without gaps or
/// overlap.
pub(crate) fn slice_grid(
    workgroup_count: [u32; 3],
    tiles_per_slice: [u32; 3],
) -> Vec<([u32; 3], [u32; 3])> {
    debug_assert!(workgroup_count.iter().all(|&c| c > 0));

    let slice_count = [
        (workgroup_count[0] / tiles_per_slice[0]).max(1),
        (workgroup_count[1] / tiles_per_slice[1]).max(1),
        (workgroup_count[2] / tiles_per_slice[2]).max(1),
    ];

    let axis_end = |axis: usize, slice: u32| -> u32 {
        if slice + 1 == slice_count[axis] {
            workgroup_count[axis] - 1
        } else {
            (slice + 1) * tiles_per_slice[axis] - 1
        }
    };

    let mut slices =
        Vec::with_capacity((slice_count[0] * slice_count[1] * slice_count[2]) as usize);
    for slice_z in 0..slice_count[2] {
        for slice_y in 0..slice_count[1] {
            for slice_x in 0..slice_count[0] {
                let workgroup_base = [
                    slice_x * tiles_per_slice[0],
                    slice_y * tiles_per_slice[1],
                    slice_z * tiles_per_slice[2],
                ];
                let workgroup_range = [
                    axis_end(0, slice_x),
                    axis_end(1, slice_y),
                    axis_end(2, slice_z),
                ];
                slices.push((workgroup_base, workgroup_range));
            }
        }
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;

    #[rstest]
    #[case::exact_fit([4, 4, 1], [2, 2, 1], 4)]
    #[case::single_slice([3, 2, 1], [8, 4, 2], 1)]
    #[case::remainder_x([5, 1, 1], [2, 1, 1], 2)]
    #[case::remainder_all([9, 5, 3], [4, 2, 2], 4)]
    #[case::unit_tiles([3, 3, 3], [1, 1, 1], 27)]
    fn test_slice_grid_covers_exactly(
        #[case] workgroup_count: [u32; 3],
        #[case] tiles_per_slice: [u32; 3],
        #[case] expected_slices: usize,
    ) {
        let slices = slice_grid(workgroup_count, tiles_per_slice);
        assert_eq!(slices.len(), expected_slices);

        // Every tile of the grid is covered by exactly one slice cube.
        let mut covered = HashSet::new();
        for (base, range) in &slices {
            for z in base[2]..=range[2] {
                for y in base[1]..=range[1] {
                    for x in base[0]..=range[0] {
                        assert!(
                            covered.insert((x, y, z)),
                            "tile ({x},{y},{z}) covered twice"
                        );
                    }
                }
            }
        }
        let total = workgroup_count[0] * workgroup_count[1] * workgroup_count[2];
        assert_eq!(covered.len() as u32, total);
    }

    #[test]
    fn test_slice_grid_last_slice_absorbs_remainder() {
        let slices = slice_grid([5, 1, 1], [2, 1, 1]);
        assert_eq!(
            slices,
            vec![([0, 0, 0], [1, 0, 0]), ([2, 0, 0], [4, 0, 0])]
        );
    }
}
