//! Beam search engine: best-first graph walk with batched sector reads.
//!
//! Each round picks the best unexpanded frontier candidates, resolves their
//! neighborhoods (node cache first, one batched sector read for the rest),
//! rescores the expanded nodes against the full-precision vectors that came
//! along in the same sectors, and admits PQ-scored neighbors back into the
//! bounded frontier. The beam is the unit of I/O overlap: a query runs on
//! one thread with up to `beam_width` outstanding reads.

use crate::bitset::BitsetView;
use crate::config::{FULL_PRECISION_REORDER_MULTIPLIER, MAX_N_SECTOR_READS, SECTOR_LEN};
use crate::distance::{preprocess_query, promote_slice, Metric, VectorElement};
use crate::error::{PqFlashError, Result};
use crate::index::PQFlashIndex;
use crate::pq::{aggregate_codes, lookup_pq_dists};
use crate::reader::{AlignedRead, IoContext};
use crate::scratch::{QueryScratch, VisitedSet};
use crate::search::pool::{Candidate, CandidatePool};
use crate::stats::{QueryStats, TraversalLog};
use ordered_float::OrderedFloat;
use std::collections::BinaryHeap;
use std::time::Instant;

/// Optional knobs of a beam search. Mandatory parameters (`k`, `l_search`,
/// `beam_width`) stay positional on the call itself.
#[derive(Default)]
pub struct SearchOptions<'a> {
    /// Re-rank the final candidates against the full-precision reorder
    /// region, when the index carries one.
    pub use_reorder: bool,
    /// Exclusion bitmap: set ids are traversed for navigation but never
    /// emitted.
    pub bitset: Option<BitsetView>,
    /// Admissible-fraction threshold below which the graph walk is replaced
    /// by a brute-force sector sweep. Negative disables the check.
    pub filter_ratio: Option<f32>,
    /// Parameter-tuning probe: skips search and visit accounting so tuning
    /// runs do not skew warm-up sampling.
    pub for_tuning: bool,
    pub stats: Option<&'a mut QueryStats>,
    pub traversal: Option<&'a mut TraversalLog>,
}

pub(crate) fn cached_beam_search<T: VectorElement>(
    index: &PQFlashIndex<T>,
    query: &[T],
    k: usize,
    l_search: usize,
    beam_width: usize,
    opts: SearchOptions<'_>,
) -> Result<Vec<(u32, f32)>> {
    if k == 0 {
        return Err(PqFlashError::InvalidArgument("k must be positive".into()));
    }
    if l_search < k {
        return Err(PqFlashError::InvalidArgument(format!(
            "search list size {l_search} must be at least k = {k}"
        )));
    }
    if beam_width == 0 {
        return Err(PqFlashError::InvalidArgument(
            "beam width must be positive".into(),
        ));
    }
    if query.len() != index.layout.dim {
        return Err(PqFlashError::InvalidArgument(format!(
            "query has {} dimensions, index has {}",
            query.len(),
            index.layout.dim
        )));
    }

    let SearchOptions {
        use_reorder,
        bitset,
        filter_ratio,
        for_tuning,
        stats,
        mut traversal,
    } = opts;

    let t_start = Instant::now();
    let mut local = QueryStats::default();
    let result = run_search(
        index,
        query,
        k,
        l_search,
        beam_width,
        use_reorder,
        bitset.as_ref(),
        filter_ratio,
        for_tuning,
        &mut local,
        &mut traversal,
    );
    local.total_us = t_start.elapsed().as_micros() as u64;
    if let Some(sink) = stats {
        sink.accumulate(&local);
    }
    if let (Some(log), Ok(res)) = (traversal, result.as_ref()) {
        log.top_results = res.clone();
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn run_search<T: VectorElement>(
    index: &PQFlashIndex<T>,
    query: &[T],
    k: usize,
    l_search: usize,
    beam_width: usize,
    use_reorder: bool,
    bitset: Option<&BitsetView>,
    filter_ratio: Option<f32>,
    for_tuning: bool,
    stats: &mut QueryStats,
    traversal: &mut Option<&mut TraversalLog>,
) -> Result<Vec<(u32, f32)>> {
    let mut guard = index.scratch_pool.acquire();
    let scratch = &mut *guard;

    scratch.query.clear();
    scratch.query.extend_from_slice(query);
    for (slot, v) in scratch.query_float.iter_mut().zip(query) {
        *slot = v.to_f32();
    }
    if !preprocess_query(index.metric, &mut scratch.query_float, index.max_base_norm) {
        tracing::warn!("zero-norm query under cosine metric, returning empty result");
        return Ok(Vec::new());
    }

    // A mostly-filtered graph degenerates under traversal; sweep instead.
    if let (Some(bs), Some(ratio)) = (bitset, filter_ratio) {
        if ratio >= 0.0 {
            let admissible = 1.0 - bs.count() as f32 / index.layout.num_points as f32;
            if admissible < ratio {
                return brute_force_beam_search(index, scratch, k, beam_width, bs, stats);
            }
        }
    }

    index
        .pq_table
        .populate_chunk_distances(&scratch.query_float, index.metric, &mut scratch.pq_dists);

    let QueryScratch {
        sector_scratch,
        sector_idx,
        query_float,
        pq_dists,
        dist_scratch,
        pq_coord_scratch,
        coord_scratch,
        coord_bytes,
        nbr_scratch,
        id_scratch,
        visited,
        io_ctx,
        ..
    } = scratch;

    let seed = index.choose_seed(query_float);
    let mut pool = CandidatePool::new(l_search);
    let mut full_retset: Vec<(u32, f32)> = Vec::with_capacity(2 * l_search);
    let mut topl_full: BinaryHeap<OrderedFloat<f32>> = BinaryHeap::with_capacity(l_search + 1);

    visited.insert(seed);
    aggregate_codes(&[seed], &index.pq_codes, index.n_chunks, pq_coord_scratch);
    lookup_pq_dists(pq_dists, pq_coord_scratch, index.n_chunks, &mut dist_scratch[..1]);
    stats.n_cmps += 1;
    pool.insert(seed, dist_scratch[0]);

    let beam = beam_width.min(MAX_N_SECTOR_READS);
    if beam < beam_width {
        tracing::warn!(beam_width, clamped = beam, "beam width clamped");
    }
    let read_len = index.layout.read_len_for_node;
    let mut batch: Vec<Candidate> = Vec::with_capacity(beam);
    let mut frontier: Vec<(u32, u64)> = Vec::with_capacity(beam);

    loop {
        let Some(best_pending) = pool.best_unexpanded() else {
            break;
        };
        // Early stop: nothing pending can displace the L-th exact distance.
        // Sound only for L2, where PQ error keeps the approximation close;
        // the negated-dot metrics skip it.
        if index.metric == Metric::L2 && topl_full.len() >= l_search {
            if OrderedFloat(best_pending) > *topl_full.peek().unwrap() {
                break;
            }
        }

        pool.take_unexpanded(beam, &mut batch);
        stats.n_hops += 1;
        frontier.clear();

        for cand in &batch {
            if !for_tuning {
                index.note_visit(cand.id);
            }
            if index.cache.copy_node(cand.id, nbr_scratch, coord_bytes) {
                stats.n_cache_hits += 1;
                expand_node(
                    index,
                    cand.id,
                    coord_bytes,
                    nbr_scratch,
                    query_float,
                    coord_scratch,
                    id_scratch,
                    pq_coord_scratch,
                    dist_scratch,
                    pq_dists,
                    visited,
                    &mut pool,
                    &mut full_retset,
                    &mut topl_full,
                    l_search,
                    bitset,
                    stats,
                    traversal,
                );
            } else {
                frontier.push((cand.id, index.layout.node_sector_offset(cand.id)));
            }
        }

        if frontier.is_empty() {
            continue;
        }
        *sector_idx = 0;
        let mut reqs: Vec<AlignedRead<'_>> = Vec::with_capacity(frontier.len());
        let mut remaining: &mut [u8] = &mut sector_scratch[..];
        for &(_, offset) in frontier.iter() {
            let (slot, rest) = remaining.split_at_mut(read_len);
            remaining = rest;
            reqs.push(AlignedRead::new(offset, slot));
            *sector_idx += 1;
        }
        read_batch(index, &mut reqs, io_ctx, read_len, stats)?;

        for (i, &(id, offset)) in frontier.iter().enumerate() {
            let node = index.layout.node_slice(&reqs[i].buf, id);
            index.layout.parse_neighborhood(node, offset, nbr_scratch)?;
            let vector_bytes = index.layout.vector_bytes(node);
            expand_node(
                index,
                id,
                vector_bytes,
                nbr_scratch,
                query_float,
                coord_scratch,
                id_scratch,
                pq_coord_scratch,
                dist_scratch,
                pq_dists,
                visited,
                &mut pool,
                &mut full_retset,
                &mut topl_full,
                l_search,
                bitset,
                stats,
                traversal,
            );
        }
    }

    sort_by_distance(&mut full_retset);
    if use_reorder && index.layout.reorder.is_some() {
        reorder_refine(
            index,
            sector_scratch,
            sector_idx,
            io_ctx,
            query_float,
            coord_scratch,
            &mut full_retset,
            k,
            stats,
        )?;
    }

    Ok(full_retset
        .iter()
        .take(k)
        .map(|&(id, d)| (id, index.emitted_distance(d)))
        .collect())
}

/// Rescore an expanded node exactly, then score and admit its unvisited
/// neighbors. The node's full-precision bytes come from the same sector
/// read (or cache entry) that produced its adjacency list, so the disk I/O
/// pays for itself twice.
#[allow(clippy::too_many_arguments)]
fn expand_node<T: VectorElement>(
    index: &PQFlashIndex<T>,
    node_id: u32,
    vector_bytes: &[u8],
    nbrs: &[u32],
    query_float: &[f32],
    coord_scratch: &mut [f32],
    id_scratch: &mut Vec<u32>,
    pq_coord_scratch: &mut Vec<u8>,
    dist_scratch: &mut [f32],
    pq_dists: &[f32],
    visited: &mut VisitedSet,
    pool: &mut CandidatePool,
    full_retset: &mut Vec<(u32, f32)>,
    topl_full: &mut BinaryHeap<OrderedFloat<f32>>,
    l_search: usize,
    bitset: Option<&BitsetView>,
    stats: &mut QueryStats,
    traversal: &mut Option<&mut TraversalLog>,
) {
    let full = index.rescore(node_id, vector_bytes, query_float, coord_scratch);
    if bitset.map_or(true, |b| !b.is_set(node_id)) {
        full_retset.push((node_id, full));
        topl_full.push(OrderedFloat(full));
        if topl_full.len() > l_search {
            topl_full.pop();
        }
    }

    id_scratch.clear();
    for &nbr in nbrs {
        if visited.insert(nbr) {
            id_scratch.push(nbr);
        }
    }
    if let Some(log) = traversal.as_deref_mut() {
        log.record_expansion(node_id, id_scratch);
    }
    if id_scratch.is_empty() {
        return;
    }
    aggregate_codes(id_scratch, &index.pq_codes, index.n_chunks, pq_coord_scratch);
    let n = id_scratch.len();
    lookup_pq_dists(pq_dists, pq_coord_scratch, index.n_chunks, &mut dist_scratch[..n]);
    stats.n_cmps += n as u32;
    for (i, &nbr) in id_scratch.iter().enumerate() {
        pool.insert(nbr, dist_scratch[i]);
    }
}

fn read_batch<T: VectorElement>(
    index: &PQFlashIndex<T>,
    reqs: &mut [AlignedRead<'_>],
    io_ctx: &IoContext,
    read_len: usize,
    stats: &mut QueryStats,
) -> Result<()> {
    let t_io = Instant::now();
    index.reader.read(reqs, io_ctx)?;
    stats.io_us += t_io.elapsed().as_micros() as u64;
    stats.n_ios += reqs.len() as u32;
    stats.n_4k += (reqs.len() * read_len / SECTOR_LEN) as u32;
    Ok(())
}

fn sort_by_distance(items: &mut [(u32, f32)]) {
    items.sort_unstable_by_key(|&(id, d)| (OrderedFloat(d), id));
}

/// Re-rank the best `3k` candidates against the full-precision reorder
/// region, then keep that ordering.
#[allow(clippy::too_many_arguments)]
fn reorder_refine<T: VectorElement>(
    index: &PQFlashIndex<T>,
    sector_scratch: &mut [u8],
    sector_idx: &mut usize,
    io_ctx: &IoContext,
    query_float: &[f32],
    coord_scratch: &mut [f32],
    cands: &mut Vec<(u32, f32)>,
    k: usize,
    stats: &mut QueryStats,
) -> Result<()> {
    let n = (FULL_PRECISION_REORDER_MULTIPLIER * k).min(cands.len());
    cands.truncate(n);
    let dims = index.layout.reorder.as_ref().unwrap().dims;

    let mut refined: Vec<(u32, f32)> = Vec::with_capacity(n);
    let mut i = 0;
    while i < n {
        // One batch of distinct reorder sectors.
        let mut offsets: Vec<u64> = Vec::new();
        let mut members: Vec<(u32, usize, usize)> = Vec::new();
        while i < n {
            let (offset, within) = index.layout.reorder_location(cands[i].0).unwrap();
            let slot = match offsets.iter().position(|&o| o == offset) {
                Some(s) => s,
                None if offsets.len() < MAX_N_SECTOR_READS => {
                    offsets.push(offset);
                    offsets.len() - 1
                }
                None => break,
            };
            members.push((cands[i].0, slot, within));
            i += 1;
        }

        *sector_idx = 0;
        let mut reqs: Vec<AlignedRead<'_>> = Vec::with_capacity(offsets.len());
        let mut remaining: &mut [u8] = &mut sector_scratch[..];
        for &offset in &offsets {
            let (slot, rest) = remaining.split_at_mut(SECTOR_LEN);
            remaining = rest;
            reqs.push(AlignedRead::new(offset, slot));
            *sector_idx += 1;
        }
        read_batch(index, &mut reqs, io_ctx, SECTOR_LEN, stats)?;

        for &(id, slot, within) in &members {
            let bytes = &reqs[slot].buf[within..within + dims * 4];
            promote_slice::<f32>(bytes, coord_scratch);
            let mut dist = index.metric.full_distance(query_float, coord_scratch);
            if index.metric == Metric::Cosine {
                dist /= index.base_norms[id as usize];
            }
            stats.n_cmps += 1;
            refined.push((id, dist));
        }
    }

    sort_by_distance(&mut refined);
    *cands = refined;
    Ok(())
}

/// Exhaustive sweep used when a bitset filters out almost everything: walk
/// every admissible id in order, still batching sector reads in beams so a
/// single query cannot monopolize the reader.
pub(crate) fn brute_force_beam_search<T: VectorElement>(
    index: &PQFlashIndex<T>,
    scratch: &mut QueryScratch<T>,
    k: usize,
    beam_width: usize,
    bitset: &BitsetView,
    stats: &mut QueryStats,
) -> Result<Vec<(u32, f32)>> {
    stats.used_brute_force = true;
    let layout = &index.layout;
    let num_points = layout.num_points as u32;
    let read_len = layout.read_len_for_node;
    let beam = beam_width.min(MAX_N_SECTOR_READS);

    let QueryScratch {
        sector_scratch,
        sector_idx,
        query_float,
        coord_scratch,
        io_ctx,
        ..
    } = scratch;

    // Max-heap of the k best (distance, id) pairs seen so far.
    let mut heap: BinaryHeap<(OrderedFloat<f32>, u32)> = BinaryHeap::with_capacity(k + 1);
    let mut next_id: u32 = 0;

    while next_id < num_points {
        // Gather up to `beam` sector runs containing admissible ids.
        let mut groups: Vec<(u64, u32, u32)> = Vec::with_capacity(beam);
        while groups.len() < beam && next_id < num_points {
            if bitset.is_set(next_id) {
                next_id += 1;
                continue;
            }
            if layout.is_long_node() {
                groups.push((layout.node_sector_offset(next_id), next_id, next_id + 1));
                next_id += 1;
            } else {
                let per = layout.nnodes_per_sector as u32;
                let first = (next_id / per) * per;
                let last = (first + per).min(num_points);
                groups.push((layout.node_sector_offset(next_id), next_id, last));
                next_id = last;
            }
        }
        if groups.is_empty() {
            break;
        }

        *sector_idx = 0;
        let mut reqs: Vec<AlignedRead<'_>> = Vec::with_capacity(groups.len());
        let mut remaining: &mut [u8] = &mut sector_scratch[..];
        for &(offset, _, _) in &groups {
            let (slot, rest) = remaining.split_at_mut(read_len);
            remaining = rest;
            reqs.push(AlignedRead::new(offset, slot));
            *sector_idx += 1;
        }
        read_batch(index, &mut reqs, io_ctx, read_len, stats)?;

        for (g, &(_, first, last)) in groups.iter().enumerate() {
            for id in first..last {
                if bitset.is_set(id) {
                    continue;
                }
                let node = layout.node_slice(&reqs[g].buf, id);
                let dist =
                    index.rescore(id, layout.vector_bytes(node), query_float, coord_scratch);
                stats.n_cmps += 1;
                heap.push((OrderedFloat(dist), id));
                if heap.len() > k {
                    heap.pop();
                }
            }
        }
    }

    Ok(heap
        .into_sorted_vec()
        .into_iter()
        .map(|(d, id)| (id, index.emitted_distance(d.0)))
        .collect())
}
