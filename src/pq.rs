//! Product-quantization tables and the query-time distance oracle.
//!
//! The pivot table covers the full dimension; chunk boundaries are
//! dimension offsets into it, so chunk widths may vary. For each query a
//! lookup table
//! of `n_chunks x 256` partial distances is materialized once into scratch;
//! scoring a candidate is then `n_chunks` table lookups and adds.

use crate::binio::{read_bin_section, read_bin_section_u32};
use crate::distance::Metric;
use crate::error::{PqFlashError, Result};
use std::fs::File;
use std::path::Path;

/// Number of sub-centroids per chunk; codes are single bytes.
pub const NUM_PQ_CENTROIDS: usize = 256;

/// Immutable PQ codebook: full-dimension pivot table, centering centroid,
/// and chunk boundaries.
#[derive(Debug, Clone)]
pub struct FixedChunkPQTable {
    ndims: usize,
    n_chunks: usize,
    /// `NUM_PQ_CENTROIDS x ndims`, row-major by centroid id.
    pivots: Vec<f32>,
    /// Global centering vector subtracted from the data at build time.
    centroid: Vec<f32>,
    /// `n_chunks + 1` monotone offsets; chunk `c` covers dims
    /// `[offsets[c], offsets[c+1])`.
    chunk_offsets: Vec<u32>,
}

impl FixedChunkPQTable {
    /// Load a pivot file: three concatenated bin sections (pivot matrix,
    /// centroid row, chunk offsets).
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PqFlashError::MissingFile(path.to_path_buf()),
            _ => PqFlashError::Io(e),
        })?;
        let mismatch = |reason: String| PqFlashError::FormatMismatch {
            file: path.display().to_string(),
            reason,
        };

        let (pivot_shape, pivots) = read_bin_section::<f32>(&mut file, path)?;
        if pivot_shape.rows != NUM_PQ_CENTROIDS {
            return Err(mismatch(format!(
                "pivot table has {} rows, expected {NUM_PQ_CENTROIDS}",
                pivot_shape.rows
            )));
        }
        let ndims = pivot_shape.cols;

        let (centroid_shape, centroid) = read_bin_section::<f32>(&mut file, path)?;
        if centroid_shape.rows * centroid_shape.cols != ndims {
            return Err(mismatch(format!(
                "centroid has {} values, expected {ndims}",
                centroid_shape.rows * centroid_shape.cols
            )));
        }

        let (offsets_shape, chunk_offsets) = read_bin_section_u32(&mut file, path)?;
        let n_offsets = offsets_shape.rows * offsets_shape.cols;
        if n_offsets < 2 {
            return Err(mismatch("chunk offset table too small".to_string()));
        }
        let table = Self {
            ndims,
            n_chunks: n_offsets - 1,
            pivots,
            centroid,
            chunk_offsets,
        };
        table.validate(path)?;
        Ok(table)
    }

    /// Build a table from raw parts. Exposed so hosts can train codebooks
    /// elsewhere and hand them in.
    pub fn from_parts(
        ndims: usize,
        pivots: Vec<f32>,
        centroid: Vec<f32>,
        chunk_offsets: Vec<u32>,
    ) -> Result<Self> {
        let table = Self {
            ndims,
            n_chunks: chunk_offsets.len().saturating_sub(1),
            pivots,
            centroid,
            chunk_offsets,
        };
        table.validate(Path::new("<memory>"))?;
        Ok(table)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let mismatch = |reason: String| PqFlashError::FormatMismatch {
            file: path.display().to_string(),
            reason,
        };
        if self.pivots.len() != NUM_PQ_CENTROIDS * self.ndims {
            return Err(mismatch("pivot table shape mismatch".to_string()));
        }
        if self.centroid.len() != self.ndims {
            return Err(mismatch("centroid length mismatch".to_string()));
        }
        if self.chunk_offsets.first() != Some(&0)
            || self.chunk_offsets.last() != Some(&(self.ndims as u32))
            || self.chunk_offsets.windows(2).any(|w| w[0] > w[1])
        {
            return Err(mismatch("chunk offsets not a monotone cover".to_string()));
        }
        Ok(())
    }

    #[inline]
    pub fn n_chunks(&self) -> usize {
        self.n_chunks
    }

    #[inline]
    pub fn ndims(&self) -> usize {
        self.ndims
    }

    /// Fill `dist_vec` (length `n_chunks * 256`, chunk-major) with partial
    /// distances from the preprocessed query to every sub-centroid.
    ///
    /// L2 entries are squared distances to the centered pivots; the dot
    /// metrics store negated partial dot products against the uncentered
    /// reconstruction (pivot + centroid), matching [`Self::inflate`].
    pub fn populate_chunk_distances(&self, query: &[f32], metric: Metric, dist_vec: &mut [f32]) {
        debug_assert_eq!(query.len(), self.ndims);
        debug_assert!(dist_vec.len() >= self.n_chunks * NUM_PQ_CENTROIDS);
        dist_vec[..self.n_chunks * NUM_PQ_CENTROIDS].fill(0.0);
        for chunk in 0..self.n_chunks {
            let table = &mut dist_vec[chunk * NUM_PQ_CENTROIDS..(chunk + 1) * NUM_PQ_CENTROIDS];
            let lo = self.chunk_offsets[chunk] as usize;
            let hi = self.chunk_offsets[chunk + 1] as usize;
            for d in lo..hi {
                let col = &self.pivots[d..];
                match metric {
                    Metric::L2 => {
                        let qd = query[d] - self.centroid[d];
                        for (b, slot) in table.iter_mut().enumerate() {
                            let diff = qd - col[b * self.ndims];
                            *slot += diff * diff;
                        }
                    }
                    Metric::InnerProduct | Metric::Cosine => {
                        let qd = query[d];
                        for (b, slot) in table.iter_mut().enumerate() {
                            *slot -= qd * (col[b * self.ndims] + self.centroid[d]);
                        }
                    }
                }
            }
        }
    }

    /// Reconstruct the full-precision approximation of a code.
    pub fn inflate(&self, code: &[u8], out: &mut [f32]) {
        debug_assert_eq!(code.len(), self.n_chunks);
        debug_assert_eq!(out.len(), self.ndims);
        for chunk in 0..self.n_chunks {
            let row = code[chunk] as usize * self.ndims;
            let lo = self.chunk_offsets[chunk] as usize;
            let hi = self.chunk_offsets[chunk + 1] as usize;
            for d in lo..hi {
                out[d] = self.pivots[row + d] + self.centroid[d];
            }
        }
    }
}

/// Gather the PQ codes of `ids` into a contiguous id-major scratch buffer.
///
/// `codes_all` is the resident `N x n_chunks` code matrix.
pub fn aggregate_codes(ids: &[u32], codes_all: &[u8], n_chunks: usize, out: &mut Vec<u8>) {
    out.clear();
    for &id in ids {
        let start = id as usize * n_chunks;
        out.extend_from_slice(&codes_all[start..start + n_chunks]);
    }
}

/// Score `n_ids` gathered codes against a populated lookup table.
///
/// Deterministic given a fixed table: plain per-chunk accumulation, with the
/// id-major code layout keeping the inner loop over a small stride so the
/// compiler can vectorize across ids.
pub fn lookup_pq_dists(dist_vec: &[f32], codes: &[u8], n_chunks: usize, out: &mut [f32]) {
    let n_ids = out.len();
    debug_assert!(codes.len() >= n_ids * n_chunks);
    out.fill(0.0);
    for chunk in 0..n_chunks {
        let table = &dist_vec[chunk * NUM_PQ_CENTROIDS..(chunk + 1) * NUM_PQ_CENTROIDS];
        for i in 0..n_ids {
            out[i] += table[codes[i * n_chunks + chunk] as usize];
        }
    }
}
