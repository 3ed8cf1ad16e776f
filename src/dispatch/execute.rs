//! Tile execution for slice and shard children.
//!
//! Children run on whichever worker popped them, borrow that worker's scratch
//! buffer, and accumulate statistics locally so the shared dispatch record is
//! touched once per child instead of once per tile. A failing tile aborts the
//! remaining tiles of its own child only: sibling children may already have
//! finished or still be running, and the failure reaches them only through
//! the dispatch retiring into a failed scope.

use crate::dispatch::{DispatchStatistics, ShardBody, SliceBody, TileContext};
use crate::status::{TaskError, TaskResult};
use crate::task::{self, Body, Submission, TaskRef};
use std::sync::atomic::Ordering;

pub(crate) fn execute_slice(
    task: TaskRef,
    local_memory: &mut [u8],
    pending_submission: &mut Submission,
) {
    let status = {
        let Body::DispatchSlice(slice) = task.body() else {
            unreachable!("execute_slice on a non-slice task");
        };
        run_slice(slice, local_memory)
    };
    task::retire(task, pending_submission, status);
}

fn run_slice(slice: &SliceBody, local_memory: &mut [u8]) -> TaskResult {
    let shared = &slice.shared;
    let local_memory = clip_local_memory(shared.local_memory_size, local_memory)?;

    // All statistics work stays local until the end; every shard and slice
    // hammering the shared counters would serialize them.
    let statistics = DispatchStatistics::default();

    let [base_x, base_y, base_z] = slice.workgroup_base;
    let [range_x, range_y, range_z] = slice.workgroup_range;
    'grid: for z in base_z..=range_z {
        for y in base_y..=range_y {
            for x in base_x..=range_x {
                let mut tile_context = TileContext {
                    workgroup_xyz: [x, y, z],
                    workgroup_size: shared.workgroup_size,
                    workgroup_count: slice.workgroup_count,
                    local_memory: &mut *local_memory,
                    statistics: &statistics,
                };
                match (shared.closure)(&mut tile_context) {
                    Ok(()) => statistics.record_tile(),
                    Err(err) => {
                        // Bail on the rest of this slice; an accelerator
                        // would run the full grid but there is no point
                        // finishing work nobody will observe.
                        shared.status.fail(err);
                        break 'grid;
                    }
                }
            }
        }
    }

    statistics.record_slice();
    statistics.merge_into(&shared.statistics);

    // The slice itself retires cleanly; a tile failure travels through the
    // dispatch status latch when the dispatch retires.
    Ok(())
}

pub(crate) fn execute_shard(
    task: TaskRef,
    local_memory: &mut [u8],
    pending_submission: &mut Submission,
) {
    let status = {
        let Body::DispatchShard(shard) = task.body() else {
            unreachable!("execute_shard on a non-shard task");
        };
        run_shard(shard, local_memory)
    };
    task::retire(task, pending_submission, status);
}

fn run_shard(shard: &ShardBody, local_memory: &mut [u8]) -> TaskResult {
    let shared = &shard.shared;
    let state = &shard.state;
    let local_memory = clip_local_memory(shared.local_memory_size, local_memory)?;

    let statistics = DispatchStatistics::default();
    let [count_x, count_y, _] = state.workgroup_count;
    let tile_count = state.tile_count;
    let tiles_per_reservation = state.tiles_per_reservation;

    // Reserve contiguous tile ranges until the grid is drained. Overshooting
    // the counter is fine; the range below clamps to the real tile count.
    let mut tile_base = state
        .tile_index
        .fetch_add(tiles_per_reservation, Ordering::Relaxed);
    'steal: while tile_base < tile_count {
        statistics.record_reservation();
        let tile_range = (tile_base + tiles_per_reservation).min(tile_count);
        for tile_index in tile_base..tile_range {
            let mut tile_context = TileContext {
                workgroup_xyz: decode_tile_index(tile_index, count_x, count_y),
                workgroup_size: shared.workgroup_size,
                workgroup_count: state.workgroup_count,
                local_memory: &mut *local_memory,
                statistics: &statistics,
            };
            match (shared.closure)(&mut tile_context) {
                Ok(()) => statistics.record_tile(),
                Err(err) => {
                    shared.status.fail(err);
                    break 'steal;
                }
            }
        }
        tile_base = state
            .tile_index
            .fetch_add(tiles_per_reservation, Ordering::Relaxed);
    }

    statistics.record_shard();
    statistics.merge_into(&shared.statistics);
    Ok(())
}

/// Maps the requested amount of worker-local memory, failing the child when
/// the worker's scratch buffer is too small. Clipping to the request keeps
/// one dispatch's memory use from leaking into another's tiles.
fn clip_local_memory(requested: usize, local_memory: &mut [u8]) -> Result<&mut [u8], TaskError> {
    if requested > local_memory.len() {
        return Err(TaskError::ResourceExhausted(format!(
            "dispatch requires {requested}B of local memory but only {}B is available per worker",
            local_memory.len()
        )));
    }
    Ok(&mut local_memory[..requested])
}

/// Linear tile index to `(x, y, z)`, x fastest.
pub(crate) fn decode_tile_index(tile_index: u32, count_x: u32, count_y: u32) -> [u32; 3] {
    let x = tile_index % count_x;
    let rest = tile_index / count_x;
    [x, rest % count_y, rest / count_y]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::origin(0, [0, 0, 0])]
    #[case::x_fastest(3, [3, 0, 0])]
    #[case::wraps_to_y(4, [0, 1, 0])]
    #[case::wraps_to_z(12, [0, 0, 1])]
    #[case::last(23, [3, 2, 1])]
    fn test_decode_tile_index_4x3x2(#[case] tile_index: u32, #[case] expected: [u32; 3]) {
        assert_eq!(decode_tile_index(tile_index, 4, 3), expected);
    }

    #[test]
    fn test_decode_covers_grid_once() {
        let mut seen = std::collections::HashSet::new();
        for tile_index in 0..4 * 3 * 2 {
            let [x, y, z] = decode_tile_index(tile_index, 4, 3);
            assert!(x < 4 && y < 3 && z < 2);
            assert!(seen.insert((x, y, z)));
        }
        assert_eq!(seen.len(), 24);
    }

    #[test]
    fn test_clip_local_memory() {
        let mut scratch = [0u8; 8];
        assert_eq!(clip_local_memory(4, &mut scratch).unwrap().len(), 4);
        assert_eq!(clip_local_memory(0, &mut scratch).unwrap().len(), 0);
        assert!(matches!(
            clip_local_memory(16, &mut scratch),
            Err(TaskError::ResourceExhausted(_))
        ));
    }
}
