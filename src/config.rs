//! Global configuration constants for pqflash.
//!
//! All tuning parameters and layout limits are defined here. These are
//! compile-time constants; per-index values (dimension, chunk count, node
//! layout) come from the on-disk metadata sector at load time.

/// Size in bytes of one disk sector, the unit of all index I/O.
///
/// Node records are packed into sectors of this size and every read issued
/// through the aligned reader is a multiple of it.
pub const SECTOR_LEN: usize = 4096;

/// Maximum number of neighbors a graph vertex may carry.
///
/// A neighborhood record whose count exceeds this is treated as corruption.
pub const MAX_GRAPH_DEGREE: usize = 512;

/// Candidate multiplier for full-precision reorder refinement.
///
/// When a search requests reorder-data reranking, `3 * k` candidates are
/// fetched from the reorder region and re-sorted by exact distance.
pub const FULL_PRECISION_REORDER_MULTIPLIER: usize = 3;

/// Maximum number of outstanding sector reads per query scratch buffer.
///
/// Bounds the sector staging area of each scratch bundle and therefore the
/// effective beam width.
pub const MAX_N_SECTOR_READS: usize = 128;

/// Number of `u64` fields in the metadata block of sector 0, before the
/// inline medoid list.
pub const DISK_META_FIELDS: usize = 12;

/// Capacity of the id -> sector-offset LRU used by `get_vector_by_ids`.
pub const SECTOR_LRU_CAPACITY: usize = 65_536;

/// Beam width used by iterator workspaces when expanding between batches.
pub const ITERATOR_BEAM_WIDTH: usize = 4;

/// Per-batch increment of an iterator's accumulated emission slack.
pub const ITERATOR_ALPHA_STEP: f32 = 0.25;

/// Default `k` used for the warm-up sampler's probe searches.
pub const WARMUP_SAMPLE_K: usize = 1;
