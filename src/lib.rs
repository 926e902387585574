//! # pqflash
//!
//! Disk-resident approximate nearest neighbor search over a Vamana-style
//! proximity graph. Vertex adjacency lists and full-precision vectors live
//! on a block device in 4 KiB sectors; a product-quantized compression of
//! every vector stays in memory and prices the graph walk, while the
//! full-precision vectors fetched by the same sector reads provide exact
//! distances for the final ranking.
//!
//! The index is read-only: it is built elsewhere and loaded here from its
//! file family (`<prefix>_disk.index`, `<prefix>_pq_compressed.bin`,
//! `<prefix>_pq_pivots.bin`, plus metric-specific side files).
//!
//! ```no_run
//! use pqflash::{Metric, PQFlashIndex, SearchOptions};
//!
//! let index = PQFlashIndex::<f32>::open(Metric::L2, 4, "/data/my_index")?;
//! let query = vec![0.0f32; index.data_dim()];
//! let hits = index.cached_beam_search(&query, 10, 50, 4, SearchOptions::default())?;
//! for (id, dist) in hits {
//!     println!("{id}: {dist}");
//! }
//! # Ok::<(), pqflash::PqFlashError>(())
//! ```

mod binio;
/// Read-only exclusion bitmap consumed by filtered searches.
pub mod bitset;
/// In-memory caches of hot neighborhoods and vectors.
pub mod cache;
/// Compile-time constants: sector size, degree limits, tuning defaults.
pub mod config;
/// Distance metrics, exact kernels, and the vector element trait.
pub mod distance;
/// Error taxonomy.
pub mod error;
mod index;
/// Sector layout math and metadata parsing.
pub mod layout;
/// Product-quantization tables and scoring.
pub mod pq;
/// The aligned sector reader interface.
pub mod reader;
/// Per-worker scratch bundles and their bounded pool.
pub mod scratch;
mod search;
/// Query statistics and traversal logging.
pub mod stats;
mod warmup;

pub use bitset::BitsetView;
pub use config::{FULL_PRECISION_REORDER_MULTIPLIER, MAX_GRAPH_DEGREE, SECTOR_LEN};
pub use distance::{Metric, VectorElement};
pub use error::{PqFlashError, Result};
pub use index::PQFlashIndex;
pub use pq::FixedChunkPQTable;
pub use reader::{AlignedFileReader, AlignedRead, DirectFileReader, IoContext};
pub use search::{IteratorWorkspace, SearchOptions};
pub use stats::{QueryStats, TraversalLog};
