//! The disk-resident index: loading, the public search surface, and
//! vector gather.
//!
//! All load-time state (layout constants, PQ tables, medoids, norms) is
//! immutable afterwards; the only mutable state on the search path is the
//! sector-offset LRU, and the node caches are written exclusively by
//! warm-up under their own lock.

use crate::binio::read_bin;
use crate::bitset::BitsetView;
use crate::cache::{NodeCache, SectorLru};
use crate::config::{MAX_N_SECTOR_READS, SECTOR_LEN, SECTOR_LRU_CAPACITY};
use crate::distance::{promote_slice, Metric, VectorElement};
use crate::error::{PqFlashError, Result};
use crate::layout::{DiskIndexMeta, SectorLayout};
use crate::pq::FixedChunkPQTable;
use crate::reader::{AlignedFileReader, AlignedRead, DirectFileReader};
use crate::scratch::{ScratchParams, ScratchPool};
use crate::search::beam::{self, SearchOptions};
use crate::search::iter::{self, IteratorWorkspace};
use crate::search::range;
use crate::stats::QueryStats;
use crate::warmup::{self, StateController};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Disk-resident Vamana index with product-quantized in-memory routing.
///
/// Created by [`PQFlashIndex::load`] (or the [`PQFlashIndex::open`]
/// convenience over a plain file reader), queried concurrently from up to
/// `num_threads` workers, torn down by drop, which first joins any in-flight
/// asynchronous warm-up.
pub struct PQFlashIndex<T: VectorElement = f32> {
    pub(crate) reader: Arc<dyn AlignedFileReader>,
    pub(crate) metric: Metric,
    pub(crate) layout: SectorLayout,
    /// Resident PQ codes, `N x n_chunks`, immutable after load.
    pub(crate) pq_codes: Vec<u8>,
    pub(crate) n_chunks: usize,
    pub(crate) pq_table: FixedChunkPQTable,
    /// Present when the on-disk vectors are themselves PQ codes.
    pub(crate) disk_pq_table: Option<FixedChunkPQTable>,
    pub(crate) medoids: Vec<u32>,
    /// `num_medoids x dim` seed-selection vectors; empty with one medoid.
    pub(crate) centroid_data: Vec<f32>,
    /// Per-point norms for cosine rescaling; empty otherwise.
    pub(crate) base_norms: Vec<f32>,
    /// Inner-product query scale.
    pub(crate) max_base_norm: f32,
    pub(crate) cache: NodeCache,
    pub(crate) sector_lru: SectorLru,
    pub(crate) scratch_pool: ScratchPool<T>,
    pub(crate) scratch_params: ScratchParams,
    pub(crate) node_visit_counter: RwLock<Vec<AtomicU32>>,
    pub(crate) count_visited_nodes: AtomicBool,
    pub(crate) search_counter: AtomicU32,
    pub(crate) warmup_state: Arc<StateController>,
    pub(crate) warmup_handle: Mutex<Option<JoinHandle<()>>>,
    /// Back-reference to the owning `Arc`, needed to hand the sampler
    /// thread a strong handle. Set by `load` via `Arc::new_cyclic`.
    self_ref: Weak<PQFlashIndex<T>>,
}

impl<T: VectorElement> PQFlashIndex<T> {
    /// Open `<prefix>_disk.index` with the built-in positioned-read file
    /// reader and load the index.
    pub fn open(metric: Metric, num_threads: usize, index_prefix: &str) -> Result<Arc<Self>> {
        let disk_path = PathBuf::from(format!("{index_prefix}_disk.index"));
        let reader = Arc::new(DirectFileReader::open(&disk_path)?);
        Self::load(reader, metric, num_threads, index_prefix)
    }

    /// Load an index from its file family, serving sector reads through
    /// `reader` (already opened on `<prefix>_disk.index`).
    ///
    /// Fails without leaving partial state; on success every load-time
    /// field is immutable for the life of the index.
    pub fn load(
        reader: Arc<dyn AlignedFileReader>,
        metric: Metric,
        num_threads: usize,
        index_prefix: &str,
    ) -> Result<Arc<Self>> {
        let disk_file = format!("{index_prefix}_disk.index");

        // Sector 0: the metadata block.
        let mut sector0 = vec![0u8; SECTOR_LEN];
        let ctx = reader.register_thread();
        let meta_read = {
            let mut reqs = [AlignedRead::new(0, &mut sector0)];
            reader.read(&mut reqs, &ctx)
        };
        reader.deregister_thread(ctx);
        meta_read?;
        let meta = DiskIndexMeta::parse(&sector0, &disk_file)?;
        if meta.num_frozen > 0 {
            return Err(PqFlashError::FormatMismatch {
                file: disk_file,
                reason: format!("{} frozen points; streaming builds are not supported", meta.num_frozen),
            });
        }
        let num_points = meta.num_points as usize;
        let dim = meta.dim as usize;

        // In-memory PQ data.
        let pivots_path = PathBuf::from(format!("{index_prefix}_pq_pivots.bin"));
        let pq_table = FixedChunkPQTable::load(&pivots_path)?;
        if pq_table.ndims() != dim {
            return Err(PqFlashError::FormatMismatch {
                file: pivots_path.display().to_string(),
                reason: format!("pivots cover {} dims, index has {dim}", pq_table.ndims()),
            });
        }
        let n_chunks = pq_table.n_chunks();

        let codes_path = PathBuf::from(format!("{index_prefix}_pq_compressed.bin"));
        let (codes_shape, pq_codes) = read_bin::<u8>(&codes_path)?;
        if codes_shape.rows != num_points || codes_shape.cols != n_chunks {
            return Err(PqFlashError::FormatMismatch {
                file: codes_path.display().to_string(),
                reason: format!(
                    "code matrix is {}x{}, expected {num_points}x{n_chunks}",
                    codes_shape.rows, codes_shape.cols
                ),
            });
        }

        // Optional disk-side PQ for very high dimensional data.
        let disk_pivots_path = PathBuf::from(format!("{index_prefix}_disk_pq_pivots.bin"));
        let disk_pq_table = if disk_pivots_path.exists() {
            let table = FixedChunkPQTable::load(&disk_pivots_path)?;
            if table.ndims() != dim {
                return Err(PqFlashError::FormatMismatch {
                    file: disk_pivots_path.display().to_string(),
                    reason: "disk PQ pivots dimension mismatch".to_string(),
                });
            }
            Some(table)
        } else {
            None
        };
        let disk_bytes_per_point = match &disk_pq_table {
            Some(table) => table.n_chunks(),
            None => dim * T::BYTES,
        };

        let layout = SectorLayout::new(&meta, disk_bytes_per_point, &disk_file)?;
        if let Some(info) = &layout.reorder {
            if info.dims != dim || info.nvecs_per_sector == 0 {
                return Err(PqFlashError::FormatMismatch {
                    file: disk_file,
                    reason: "reorder region geometry mismatch".to_string(),
                });
            }
        }

        // Metric-specific rescaling state.
        let mut base_norms = Vec::new();
        if metric == Metric::Cosine {
            let norms_path = PathBuf::from(format!("{index_prefix}_sample_norms.bin"));
            let (shape, norms) = read_bin::<f32>(&norms_path)?;
            if shape.rows * shape.cols != num_points {
                return Err(PqFlashError::FormatMismatch {
                    file: norms_path.display().to_string(),
                    reason: format!(
                        "{} norms for {num_points} points",
                        shape.rows * shape.cols
                    ),
                });
            }
            base_norms = norms;
        }
        let mut max_base_norm = 1.0f32;
        if metric == Metric::InnerProduct {
            let norm_path = PathBuf::from(format!("{index_prefix}_max_base_norm.bin"));
            if norm_path.exists() {
                let (_, values) = read_bin::<f32>(&norm_path)?;
                if let Some(&v) = values.first() {
                    max_base_norm = v;
                }
            } else {
                tracing::debug!("no max_base_norm file, inner-product queries unscaled");
            }
        }

        let scratch_params = ScratchParams {
            num_points,
            dim,
            n_chunks,
            read_len_for_node: layout.read_len_for_node,
            disk_bytes_per_point,
        };
        let scratch_pool = ScratchPool::new(num_threads, scratch_params, Arc::clone(&reader));

        let mut index = Self {
            reader,
            metric,
            layout,
            pq_codes,
            n_chunks,
            pq_table,
            disk_pq_table,
            medoids: meta.medoids.clone(),
            centroid_data: Vec::new(),
            base_norms,
            max_base_norm,
            cache: NodeCache::new(disk_bytes_per_point),
            sector_lru: SectorLru::new(SECTOR_LRU_CAPACITY),
            scratch_pool,
            scratch_params,
            node_visit_counter: RwLock::new(Vec::new()),
            count_visited_nodes: AtomicBool::new(false),
            search_counter: AtomicU32::new(0),
            warmup_state: Arc::new(StateController::new()),
            warmup_handle: Mutex::new(None),
            self_ref: Weak::new(),
        };

        if index.medoids.len() > 1 {
            let centroids_path = PathBuf::from(format!("{index_prefix}_centroids.bin"));
            if centroids_path.exists() {
                let (shape, data) = read_bin::<f32>(&centroids_path)?;
                if shape.rows != index.medoids.len() || shape.cols != dim {
                    return Err(PqFlashError::FormatMismatch {
                        file: centroids_path.display().to_string(),
                        reason: format!(
                            "centroid matrix is {}x{}, expected {}x{dim}",
                            shape.rows,
                            shape.cols,
                            index.medoids.len()
                        ),
                    });
                }
                index.centroid_data = data;
            } else {
                index.centroid_data = index.medoid_vectors_as_centroids()?;
            }
        }

        tracing::info!(
            points = num_points,
            dim,
            chunks = n_chunks,
            medoids = index.medoids.len(),
            long_node = index.layout.is_long_node(),
            "loaded disk index"
        );
        Ok(Arc::new_cyclic(|weak| {
            index.self_ref = weak.clone();
            index
        }))
    }

    /// Seed-selection fallback: with several medoids but no centroid file,
    /// the medoids' own full-precision vectors serve as centroid data.
    fn medoid_vectors_as_centroids(&self) -> Result<Vec<f32>> {
        let dim = self.layout.dim;
        let mut data = vec![0.0f32; self.medoids.len() * dim];
        let mut guard = self.scratch_pool.acquire();
        let scratch = &mut *guard;
        let read_len = self.layout.read_len_for_node;
        for (i, &medoid) in self.medoids.iter().enumerate() {
            let buf = &mut scratch.sector_scratch[..read_len];
            let mut reqs = [AlignedRead::new(self.layout.node_sector_offset(medoid), buf)];
            self.reader.read(&mut reqs, &scratch.io_ctx)?;
            let node = self.layout.node_slice(reqs[0].buf, medoid);
            let vector_bytes = &node[..self.layout.disk_bytes_per_point];
            let out = &mut data[i * dim..(i + 1) * dim];
            match &self.disk_pq_table {
                Some(table) => table.inflate(vector_bytes, out),
                None => promote_slice::<T>(vector_bytes, out),
            }
        }
        Ok(data)
    }

    /// Top-k search. Returns at most `k` `(id, distance)` pairs, best
    /// first; distances are on the metric's user-facing scale.
    pub fn cached_beam_search(
        &self,
        query: &[T],
        k: usize,
        l_search: usize,
        beam_width: usize,
        opts: SearchOptions<'_>,
    ) -> Result<Vec<(u32, f32)>> {
        let count = !opts.for_tuning;
        let result = beam::cached_beam_search(self, query, k, l_search, beam_width, opts);
        if count && result.is_ok() {
            self.note_search();
        }
        result
    }

    /// All neighbors within `radius`, found by re-running the beam search
    /// with doubling list sizes until the in-range count stabilizes.
    pub fn range_search(
        &self,
        query: &[T],
        radius: f32,
        l_min: usize,
        l_max: usize,
        beam_width: usize,
        bitset: Option<BitsetView>,
        stats: Option<&mut QueryStats>,
    ) -> Result<Vec<(u32, f32)>> {
        range::range_search(self, query, radius, l_min, l_max, beam_width, bitset, stats)
    }

    /// Build a resumable streaming-search workspace.
    pub fn get_iterator_workspace(
        &self,
        query: &[T],
        ef: usize,
        for_tuning: bool,
        bitset: Option<BitsetView>,
    ) -> Result<IteratorWorkspace<T>> {
        iter::get_iterator_workspace(self, query, ef, for_tuning, bitset)
    }

    /// Yield up to `want` more results in increasing-distance order.
    pub fn iterator_next_batch(
        &self,
        workspace: &mut IteratorWorkspace<T>,
        want: usize,
    ) -> Result<Vec<(u32, f32)>> {
        iter::iterator_next_batch(self, workspace, want)
    }

    /// Read the full-precision vectors of arbitrary ids into `out`
    /// (`ids.len() * dim` elements), grouping disk reads by sector.
    pub fn get_vector_by_ids(&self, ids: &[u32], out: &mut [T]) -> Result<()> {
        let dim = self.layout.dim;
        if out.len() != ids.len() * dim {
            return Err(PqFlashError::InvalidArgument(format!(
                "output holds {} elements, need {}",
                out.len(),
                ids.len() * dim
            )));
        }
        let mut scratch = self.scratch_pool.acquire();

        // Serve coord-cache hits first; group the misses by sector.
        let mut by_sector: HashMap<u64, Vec<(usize, u32)>> = HashMap::new();
        for (pos, &id) in ids.iter().enumerate() {
            if id as u64 >= self.layout.num_points {
                return Err(PqFlashError::InvalidArgument(format!(
                    "id {id} out of range"
                )));
            }
            scratch
                .coord_bytes
                .resize(self.layout.disk_bytes_per_point, 0);
            if self.cache.copy_coord(id, &mut scratch.coord_bytes) {
                let bytes = std::mem::take(&mut scratch.coord_bytes);
                self.decode_to_output(&bytes, &mut scratch.coord_scratch, &mut out[pos * dim..(pos + 1) * dim]);
                scratch.coord_bytes = bytes;
            } else {
                let offset = match self.sector_lru.get(id) {
                    Some(offset) => offset,
                    None => {
                        let offset = self.layout.node_sector_offset(id);
                        self.sector_lru.put(id, offset);
                        offset
                    }
                };
                by_sector.entry(offset).or_default().push((pos, id));
            }
        }

        let read_len = self.layout.read_len_for_node;
        let groups: Vec<(u64, Vec<(usize, u32)>)> = by_sector.into_iter().collect();
        for batch in groups.chunks(MAX_N_SECTOR_READS) {
            let scratch = &mut *scratch;
            let mut reqs: Vec<AlignedRead<'_>> = Vec::with_capacity(batch.len());
            let mut remaining: &mut [u8] = &mut scratch.sector_scratch[..];
            for (offset, _) in batch {
                let (slot, rest) = remaining.split_at_mut(read_len);
                remaining = rest;
                reqs.push(AlignedRead::new(*offset, slot));
            }
            self.reader.read(&mut reqs, &scratch.io_ctx)?;
            for (i, (_, members)) in batch.iter().enumerate() {
                for &(pos, id) in members {
                    let node = self.layout.node_slice(&reqs[i].buf, id);
                    let bytes = self.layout.vector_bytes(node);
                    self.decode_to_output(
                        bytes,
                        &mut scratch.coord_scratch,
                        &mut out[pos * dim..(pos + 1) * dim],
                    );
                }
            }
        }
        Ok(())
    }

    fn decode_to_output(&self, bytes: &[u8], float_scratch: &mut [f32], out: &mut [T]) {
        match &self.disk_pq_table {
            Some(table) => {
                table.inflate(bytes, float_scratch);
                for (slot, &v) in out.iter_mut().zip(float_scratch.iter()) {
                    *slot = T::from_f32(v);
                }
            }
            None => {
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = T::read_le(&bytes[i * T::BYTES..]);
                }
            }
        }
    }

    /// Populate the node caches with the given ids (idempotent).
    pub fn load_cache_list(&self, ids: &[u32]) -> Result<()> {
        warmup::load_cache_list(self, ids)
    }

    /// Pick `num_nodes` cache candidates breadth-first from the medoids
    /// and populate the caches with them. Returns the picked ids.
    pub fn cache_bfs_levels(&self, num_nodes: usize) -> Result<Vec<u32>> {
        warmup::cache_bfs_levels(self, num_nodes)
    }

    /// Start the asynchronous sample-query warm-up task.
    pub fn async_generate_cache_list_from_sample_queries(
        &self,
        sample_bin: &Path,
        l_search: usize,
        beam_width: usize,
        num_nodes_to_cache: usize,
    ) -> Result<()> {
        let strong = self.self_ref.upgrade().ok_or_else(|| {
            PqFlashError::InvalidArgument("index is not held in an Arc".into())
        })?;
        warmup::start_async_sampler(
            &strong,
            sample_bin,
            l_search,
            beam_width,
            num_nodes_to_cache,
        )
    }

    /// Stop the asynchronous warm-up task, blocking until it has settled.
    pub fn destroy_cache_async_task(&self) {
        warmup::destroy_cache_async_task(self)
    }

    #[inline]
    pub fn num_points(&self) -> u64 {
        self.layout.num_points
    }

    #[inline]
    pub fn data_dim(&self) -> usize {
        self.layout.dim
    }

    #[inline]
    pub fn max_degree(&self) -> usize {
        self.layout.max_degree
    }

    #[inline]
    pub fn medoids(&self) -> &[u32] {
        &self.medoids
    }

    #[inline]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Number of non-tuning caller searches served since load. A range
    /// search counts once regardless of its internal doubling rounds, and
    /// the warm-up sampler's probe searches are not counted.
    pub fn search_count(&self) -> u32 {
        self.search_counter.load(Ordering::Relaxed)
    }

    /// Number of nodes currently resident in the warm-up caches.
    pub fn cached_node_count(&self) -> usize {
        self.cache.len()
    }

    /// Approximate resident memory of the in-memory structures.
    pub fn memory_footprint(&self) -> usize {
        self.pq_codes.len()
            + self.centroid_data.len() * 4
            + self.base_norms.len() * 4
            + self.cache.memory_bytes()
            + self.scratch_pool.memory_bytes(self.scratch_params)
    }

    /// Seed selection: the single medoid, or the medoid whose centroid
    /// vector is exactly closest to the preprocessed query.
    pub(crate) fn choose_seed(&self, query_float: &[f32]) -> u32 {
        if self.medoids.len() == 1 {
            return self.medoids[0];
        }
        let dim = self.layout.dim;
        let mut best = self.medoids[0];
        let mut best_dist = f32::INFINITY;
        for (i, &medoid) in self.medoids.iter().enumerate() {
            let row = &self.centroid_data[i * dim..(i + 1) * dim];
            let d = self.metric.full_distance(query_float, row);
            if d < best_dist {
                best_dist = d;
                best = medoid;
            }
        }
        best
    }

    /// Exact internal distance of a node from its on-disk vector bytes,
    /// with cosine base-norm rescaling applied.
    pub(crate) fn rescore(
        &self,
        id: u32,
        vector_bytes: &[u8],
        query_float: &[f32],
        coord_scratch: &mut [f32],
    ) -> f32 {
        match &self.disk_pq_table {
            Some(table) => table.inflate(vector_bytes, coord_scratch),
            None => promote_slice::<T>(vector_bytes, coord_scratch),
        }
        let mut d = self.metric.full_distance(query_float, coord_scratch);
        if self.metric == Metric::Cosine {
            d /= self.base_norms[id as usize];
        }
        d
    }

    /// Map an internal distance to the metric's user-facing scale.
    #[inline]
    pub(crate) fn emitted_distance(&self, internal: f32) -> f32 {
        match self.metric {
            Metric::InnerProduct => -internal * self.max_base_norm,
            Metric::L2 | Metric::Cosine => internal,
        }
    }

    pub(crate) fn note_search(&self) {
        self.search_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump a node's visit counter while the warm-up sampler is recording.
    pub(crate) fn note_visit(&self, id: u32) {
        if self.count_visited_nodes.load(Ordering::Relaxed) {
            let counters = self.node_visit_counter.read();
            if let Some(counter) = counters.get(id as usize) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl<T: VectorElement> Drop for PQFlashIndex<T> {
    fn drop(&mut self) {
        self.destroy_cache_async_task();
    }
}
