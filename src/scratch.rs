//! Per-worker scratch bundles and the bounded pool that hands them out.
//!
//! Every buffer a query needs is preallocated at load time, sized by the
//! index geometry, and recycled through a bounded channel. Acquiring blocks
//! while all bundles are in use; releasing resets positions and clears the
//! visited set without freeing memory. This keeps the hot path free of
//! allocation and lets external thread pools drive the engine without any
//! thread-local state.

use crate::config::{MAX_GRAPH_DEGREE, MAX_N_SECTOR_READS};
use crate::distance::VectorElement;
use crate::pq::NUM_PQ_CENTROIDS;
use crate::reader::{AlignedFileReader, IoContext};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Generation-based visited set.
///
/// `clear()` bumps a generation counter instead of zeroing the array, so
/// per-query reset is O(1); a full memset happens only every 65534 clears.
#[derive(Debug)]
pub struct VisitedSet {
    data: Vec<u16>,
    generation: u16,
}

impl VisitedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u16; capacity],
            generation: 1,
        }
    }

    /// Reset the set without deallocating.
    pub fn clear(&mut self) {
        if self.generation == u16::MAX {
            self.data.fill(0);
            self.generation = 1;
        } else {
            self.generation += 1;
        }
    }

    /// Mark `id` visited. Returns true if it was not previously visited.
    #[inline]
    pub fn insert(&mut self, id: u32) -> bool {
        let slot = &mut self.data[id as usize];
        if *slot == self.generation {
            false
        } else {
            *slot = self.generation;
            true
        }
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.data[id as usize] == self.generation
    }
}

/// Geometry needed to size a scratch bundle.
#[derive(Debug, Clone, Copy)]
pub struct ScratchParams {
    pub num_points: usize,
    pub dim: usize,
    pub n_chunks: usize,
    pub read_len_for_node: usize,
    pub disk_bytes_per_point: usize,
}

/// Preallocated buffers for one in-flight query.
pub struct QueryScratch<T: VectorElement> {
    /// Sector staging area; each beam round carves disjoint node-read
    /// slots out of it, so its contents are only valid within a round.
    pub sector_scratch: Vec<u8>,
    /// Next free node-read slot within `sector_scratch`.
    pub sector_idx: usize,
    /// Query in its source element type.
    pub query: Vec<T>,
    /// Preprocessed float query driving all distance computation.
    pub query_float: Vec<f32>,
    /// Per-query PQ lookup table, `n_chunks x 256` chunk-major.
    pub pq_dists: Vec<f32>,
    /// Batch scoring output, one slot per enqueued neighbor.
    pub dist_scratch: Vec<f32>,
    /// Gathered PQ codes for a batch of ids.
    pub pq_coord_scratch: Vec<u8>,
    /// Decoded full-precision vector of the node being rescored.
    pub coord_scratch: Vec<f32>,
    /// Raw on-disk vector bytes copied out of the node cache.
    pub coord_bytes: Vec<u8>,
    /// Parsed neighbor ids of the node being expanded.
    pub nbr_scratch: Vec<u32>,
    /// Neighbor ids surviving the visited filter, awaiting scoring.
    pub id_scratch: Vec<u32>,
    pub visited: VisitedSet,
    /// Reader registration for the worker holding this bundle.
    pub io_ctx: IoContext,
}

impl<T: VectorElement> QueryScratch<T> {
    fn new(params: ScratchParams, io_ctx: IoContext) -> Self {
        Self {
            sector_scratch: vec![0u8; MAX_N_SECTOR_READS * params.read_len_for_node],
            sector_idx: 0,
            query: vec![T::default(); params.dim],
            query_float: vec![0.0; params.dim],
            pq_dists: vec![0.0; params.n_chunks * NUM_PQ_CENTROIDS],
            dist_scratch: vec![0.0; MAX_GRAPH_DEGREE],
            pq_coord_scratch: Vec::with_capacity(params.n_chunks * MAX_GRAPH_DEGREE),
            coord_scratch: vec![0.0; params.dim],
            coord_bytes: Vec::with_capacity(params.disk_bytes_per_point),
            nbr_scratch: Vec::with_capacity(MAX_GRAPH_DEGREE),
            id_scratch: Vec::with_capacity(MAX_GRAPH_DEGREE),
            visited: VisitedSet::new(params.num_points),
            io_ctx,
        }
    }

    /// Per-query reset: positions back to zero, visited cleared, capacity
    /// untouched.
    pub fn reset(&mut self) {
        self.sector_idx = 0;
        self.visited.clear();
    }
}

/// Bounded pool of scratch bundles, one per permitted concurrent query.
pub struct ScratchPool<T: VectorElement> {
    tx: Sender<QueryScratch<T>>,
    rx: Receiver<QueryScratch<T>>,
    reader: Arc<dyn AlignedFileReader>,
    capacity: usize,
}

impl<T: VectorElement> ScratchPool<T> {
    /// Build `capacity` bundles, registering each with the reader.
    pub fn new(capacity: usize, params: ScratchParams, reader: Arc<dyn AlignedFileReader>) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            let ctx = reader.register_thread();
            tx.send(QueryScratch::new(params, ctx))
                .expect("freshly built channel cannot be full");
        }
        Self {
            tx,
            rx,
            reader,
            capacity,
        }
    }

    /// Take a bundle, blocking until one is free.
    pub fn acquire(&self) -> ScratchGuard<'_, T> {
        let scratch = self
            .rx
            .recv()
            .expect("scratch channel closed while pool alive");
        ScratchGuard {
            scratch: Some(scratch),
            tx: &self.tx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes held by all bundles; queries add nothing beyond this plus
    /// their frontier.
    pub fn memory_bytes(&self, params: ScratchParams) -> usize {
        let per_bundle = MAX_N_SECTOR_READS * params.read_len_for_node
            + params.dim * (T::BYTES + 4 + 4)
            + params.n_chunks * NUM_PQ_CENTROIDS * 4
            + MAX_GRAPH_DEGREE * (4 + 4 + 4 + params.n_chunks)
            + params.num_points * 2;
        per_bundle * self.capacity
    }
}

impl<T: VectorElement> Drop for ScratchPool<T> {
    fn drop(&mut self) {
        while let Ok(scratch) = self.rx.try_recv() {
            self.reader.deregister_thread(scratch.io_ctx);
        }
    }
}

/// RAII handle returning its bundle to the pool, reset, on drop.
pub struct ScratchGuard<'a, T: VectorElement> {
    scratch: Option<QueryScratch<T>>,
    tx: &'a Sender<QueryScratch<T>>,
}

impl<T: VectorElement> Deref for ScratchGuard<'_, T> {
    type Target = QueryScratch<T>;

    fn deref(&self) -> &Self::Target {
        self.scratch.as_ref().unwrap()
    }
}

impl<T: VectorElement> DerefMut for ScratchGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.scratch.as_mut().unwrap()
    }
}

impl<T: VectorElement> Drop for ScratchGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(mut scratch) = self.scratch.take() {
            scratch.reset();
            // Receiver side only closes when the pool is dropped, which
            // cannot happen while a guard borrows it.
            let _ = self.tx.send(scratch);
        }
    }
}
