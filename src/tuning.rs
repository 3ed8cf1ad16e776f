//! Process-wide scheduling defaults.
//!
//! These are the values the [`Builder`](crate::executor::Builder) starts
//! from; every one of them can be overridden per executor. They are split out
//! here so the trade-offs stay documented in one place.

/// Default tile dimensions of a slice on each axis `(x, y, z)`.
///
/// Larger slices amortize scheduling overhead and keep neighbouring tiles on
/// the same worker (better cache reuse along x, the fastest-moving axis);
/// smaller slices give the scheduler more units to balance. x is widest
/// because compiled tile closures usually walk memory along x.
pub const TILES_PER_SLICE: [u32; 3] = [8, 4, 2];

/// Upper bound on how many tiles a shard reserves from the shared grid per
/// atomic fetch-add.
///
/// A higher number reduces contention on the shared tile index and improves
/// locality; a lower number reduces worst-case latency when the grid is
/// skewed (coarser reservations mean a slow worker can strand more tiles
/// behind it). Small grids ignore this and fall back to one tile per
/// reservation so every worker gets a chance to participate.
pub const MAX_TILES_PER_SHARD_RESERVATION: u32 = 16;

/// Records a task pool reserves capacity for at a time.
pub const POOL_BLOCK_SIZE: usize = 64;

/// How many times a worker retries the steal loop before giving up and
/// parking. Fairly arbitrary; matches what other stealing schedulers use.
pub(crate) const MAX_STEAL_RETRIES: usize = 4;

/// Used wherever we rely on SmallVec to store entries on stack first.
/// Prevents most heap allocations for typical fan-outs.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;
