//! Resumable streaming search: results in increasing-distance order
//! across multiple `next_batch` calls.
//!
//! An iterator does not hold a scratch bundle between calls (a bundle is
//! borrowed per call for sector staging only), so everything that must
//! survive the batch boundary lives in the workspace: the preprocessed
//! query, its PQ lookup table, an owned visited bitmap sized to the point
//! count, the unexpanded frontier, the exact-scored backlog, and the
//! accumulated emission slack.

use crate::bitset::BitsetView;
use crate::config::{ITERATOR_ALPHA_STEP, ITERATOR_BEAM_WIDTH};
use crate::distance::{preprocess_query, VectorElement};
use crate::error::{PqFlashError, Result};
use crate::index::PQFlashIndex;
use crate::pq::{aggregate_codes, lookup_pq_dists, NUM_PQ_CENTROIDS};
use crate::reader::AlignedRead;
use crate::scratch::QueryScratch;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

type MinHeapEntry = Reverse<(OrderedFloat<f32>, u32)>;

/// Heap-allocated state of one streaming search.
pub struct IteratorWorkspace<T: VectorElement> {
    /// Raw query in its source element type, kept for refinement paths.
    #[allow(dead_code)]
    pub(crate) query: Vec<T>,
    pub(crate) query_float: Vec<f32>,
    pub(crate) pq_dists: Vec<f32>,
    /// Owned visited bitmap; the pooled visited sets cannot be used because
    /// an iterator outlives any single scratch borrow.
    pub(crate) visited: Vec<bool>,
    /// PQ-scored unexpanded candidates.
    pub(crate) to_visit: BinaryHeap<MinHeapEntry>,
    /// Exactly-scored candidates awaiting emission.
    pub(crate) backlog: BinaryHeap<MinHeapEntry>,
    pub(crate) ef: usize,
    pub(crate) bitset: Option<BitsetView>,
    pub(crate) for_tuning: bool,
    /// Emission slack accumulated across batches; relaxes how far ahead of
    /// the unexpanded frontier the backlog may be drained.
    pub(crate) accumulative_alpha: f32,
    pub(crate) initial_search_done: bool,
    /// Zero-norm cosine query: every batch is empty.
    pub(crate) always_empty: bool,
}

pub(crate) fn get_iterator_workspace<T: VectorElement>(
    index: &PQFlashIndex<T>,
    query: &[T],
    ef: usize,
    for_tuning: bool,
    bitset: Option<BitsetView>,
) -> Result<IteratorWorkspace<T>> {
    if ef == 0 {
        return Err(PqFlashError::InvalidArgument("ef must be positive".into()));
    }
    if query.len() != index.layout.dim {
        return Err(PqFlashError::InvalidArgument(format!(
            "query has {} dimensions, index has {}",
            query.len(),
            index.layout.dim
        )));
    }

    let mut query_float: Vec<f32> = query.iter().map(|v| v.to_f32()).collect();
    let always_empty = !preprocess_query(index.metric, &mut query_float, index.max_base_norm);
    let mut pq_dists = vec![0.0f32; index.n_chunks * NUM_PQ_CENTROIDS];
    if !always_empty {
        index
            .pq_table
            .populate_chunk_distances(&query_float, index.metric, &mut pq_dists);
    }
    if !for_tuning {
        index.note_search();
    }

    Ok(IteratorWorkspace {
        query: query.to_vec(),
        query_float,
        pq_dists,
        visited: vec![false; index.layout.num_points as usize],
        to_visit: BinaryHeap::new(),
        backlog: BinaryHeap::new(),
        ef,
        bitset,
        for_tuning,
        accumulative_alpha: 0.0,
        initial_search_done: false,
        always_empty,
    })
}

pub(crate) fn iterator_next_batch<T: VectorElement>(
    index: &PQFlashIndex<T>,
    ws: &mut IteratorWorkspace<T>,
    want: usize,
) -> Result<Vec<(u32, f32)>> {
    let mut out = Vec::with_capacity(want);
    if ws.always_empty || want == 0 {
        return Ok(out);
    }
    let mut guard = index.scratch_pool.acquire();
    let scratch = &mut *guard;

    if !ws.initial_search_done {
        let seed = index.choose_seed(&ws.query_float);
        ws.visited[seed as usize] = true;
        aggregate_codes(
            &[seed],
            &index.pq_codes,
            index.n_chunks,
            &mut scratch.pq_coord_scratch,
        );
        lookup_pq_dists(
            &ws.pq_dists,
            &scratch.pq_coord_scratch,
            index.n_chunks,
            &mut scratch.dist_scratch[..1],
        );
        ws.to_visit
            .push(Reverse((OrderedFloat(scratch.dist_scratch[0]), seed)));

        // Initial search: expand until ef exact candidates are banked.
        while ws.backlog.len() < ws.ef && !ws.to_visit.is_empty() {
            expand_round(index, ws, scratch)?;
        }
        ws.initial_search_done = true;
    }

    while out.len() < want {
        // Top up the backlog: expand every pending candidate that could
        // still beat the next banked result, widened by the accumulated
        // slack so later batches prefetch more per round. Emission itself
        // never runs ahead of the unexpanded frontier, which keeps the
        // emitted distances non-decreasing across batch boundaries.
        loop {
            let expand = match (ws.backlog.peek(), ws.to_visit.peek()) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(Reverse((banked, _))), Some(Reverse((pending, _)))) => {
                    pending.0 <= banked.0 + ws.accumulative_alpha * banked.0.abs()
                }
            };
            if !expand {
                break;
            }
            expand_round(index, ws, scratch)?;
        }
        match ws.backlog.pop() {
            Some(Reverse((dist, id))) => out.push((id, index.emitted_distance(dist.0))),
            None => break,
        }
    }

    ws.accumulative_alpha = (ws.accumulative_alpha + ITERATOR_ALPHA_STEP).min(1.0);
    Ok(out)
}

/// Expand one beam of the iterator's frontier.
fn expand_round<T: VectorElement>(
    index: &PQFlashIndex<T>,
    ws: &mut IteratorWorkspace<T>,
    scratch: &mut QueryScratch<T>,
) -> Result<()> {
    let IteratorWorkspace {
        query_float,
        pq_dists,
        visited,
        to_visit,
        backlog,
        bitset,
        for_tuning,
        ..
    } = ws;
    let QueryScratch {
        sector_scratch,
        sector_idx,
        dist_scratch,
        pq_coord_scratch,
        coord_scratch,
        coord_bytes,
        nbr_scratch,
        id_scratch,
        io_ctx,
        ..
    } = scratch;

    let mut batch_ids: Vec<u32> = Vec::with_capacity(ITERATOR_BEAM_WIDTH);
    for _ in 0..ITERATOR_BEAM_WIDTH {
        match to_visit.pop() {
            Some(Reverse((_, id))) => batch_ids.push(id),
            None => break,
        }
    }

    let mut frontier: Vec<(u32, u64)> = Vec::with_capacity(batch_ids.len());
    for &id in &batch_ids {
        if !*for_tuning {
            index.note_visit(id);
        }
        if index.cache.copy_node(id, nbr_scratch, coord_bytes) {
            expand_one(
                index,
                id,
                coord_bytes,
                nbr_scratch,
                query_float,
                pq_dists,
                coord_scratch,
                id_scratch,
                pq_coord_scratch,
                dist_scratch,
                visited,
                to_visit,
                backlog,
                bitset.as_ref(),
            );
        } else {
            frontier.push((id, index.layout.node_sector_offset(id)));
        }
    }

    if frontier.is_empty() {
        return Ok(());
    }
    let read_len = index.layout.read_len_for_node;
    *sector_idx = 0;
    let mut reqs: Vec<AlignedRead<'_>> = Vec::with_capacity(frontier.len());
    let mut remaining: &mut [u8] = &mut sector_scratch[..];
    for &(_, offset) in &frontier {
        let (slot, rest) = remaining.split_at_mut(read_len);
        remaining = rest;
        reqs.push(AlignedRead::new(offset, slot));
        *sector_idx += 1;
    }
    index.reader.read(&mut reqs, io_ctx)?;

    for (i, &(id, offset)) in frontier.iter().enumerate() {
        let node = index.layout.node_slice(&reqs[i].buf, id);
        index.layout.parse_neighborhood(node, offset, nbr_scratch)?;
        expand_one(
            index,
            id,
            index.layout.vector_bytes(node),
            nbr_scratch,
            query_float,
            pq_dists,
            coord_scratch,
            id_scratch,
            pq_coord_scratch,
            dist_scratch,
            visited,
            to_visit,
            backlog,
            bitset.as_ref(),
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn expand_one<T: VectorElement>(
    index: &PQFlashIndex<T>,
    id: u32,
    vector_bytes: &[u8],
    nbrs: &[u32],
    query_float: &[f32],
    pq_dists: &[f32],
    coord_scratch: &mut [f32],
    id_scratch: &mut Vec<u32>,
    pq_coord_scratch: &mut Vec<u8>,
    dist_scratch: &mut [f32],
    visited: &mut [bool],
    to_visit: &mut BinaryHeap<MinHeapEntry>,
    backlog: &mut BinaryHeap<MinHeapEntry>,
    bitset: Option<&BitsetView>,
) {
    let full = index.rescore(id, vector_bytes, query_float, coord_scratch);
    if bitset.map_or(true, |b| !b.is_set(id)) {
        backlog.push(Reverse((OrderedFloat(full), id)));
    }

    id_scratch.clear();
    for &nbr in nbrs {
        let slot = &mut visited[nbr as usize];
        if !*slot {
            *slot = true;
            id_scratch.push(nbr);
        }
    }
    if id_scratch.is_empty() {
        return;
    }
    aggregate_codes(id_scratch, &index.pq_codes, index.n_chunks, pq_coord_scratch);
    let n = id_scratch.len();
    lookup_pq_dists(pq_dists, pq_coord_scratch, index.n_chunks, &mut dist_scratch[..n]);
    for (i, &nbr) in id_scratch.iter().enumerate() {
        to_visit.push(Reverse((OrderedFloat(dist_scratch[i]), nbr)));
    }
}
