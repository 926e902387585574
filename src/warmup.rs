//! Cache warm-up: explicit lists, BFS from the medoids, and the
//! asynchronous sample-query sampler.
//!
//! The sampler is a state machine, not a detached thread: an explicit
//! `{None, Doing, Stopping, Done, Killed}` controller with a condition
//! variable replaces exception-based teardown. `destroy_cache_async_task`
//! flips `Doing` to `Stopping`; the sampler observes the flag between
//! sample queries, finishes its cache hand-off, and signals `Done`.
//! Teardown waits on the condvar, so `Doing` is never observable after the
//! destructor returns.

use crate::binio::read_bin;
use crate::config::{MAX_N_SECTOR_READS, WARMUP_SAMPLE_K};
use crate::distance::VectorElement;
use crate::error::{PqFlashError, Result};
use crate::index::PQFlashIndex;
use crate::reader::AlignedRead;
use crate::search::beam::{cached_beam_search, SearchOptions};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Lifecycle of the asynchronous warm-up task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WarmupStatus {
    None,
    Doing,
    Stopping,
    Done,
    Killed,
}

/// Condvar-backed status cell shared between the sampler thread and the
/// index teardown path.
pub(crate) struct StateController {
    status: Mutex<WarmupStatus>,
    cond: Condvar,
}

impl StateController {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(WarmupStatus::None),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> WarmupStatus {
        *self.status.lock()
    }

    pub(crate) fn set(&self, status: WarmupStatus) {
        *self.status.lock() = status;
        self.cond.notify_all();
    }

    /// Try to claim an idle controller for a new run.
    pub(crate) fn try_begin(&self) -> bool {
        let mut status = self.status.lock();
        match *status {
            WarmupStatus::Doing | WarmupStatus::Stopping => false,
            _ => {
                *status = WarmupStatus::Doing;
                true
            }
        }
    }

    /// Ask a running sampler to stop at its next query boundary.
    pub(crate) fn request_stop(&self) {
        let mut status = self.status.lock();
        if *status == WarmupStatus::Doing {
            *status = WarmupStatus::Stopping;
            self.cond.notify_all();
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        *self.status.lock() == WarmupStatus::Stopping
    }

    /// Block until the task is no longer running.
    pub(crate) fn wait_until_settled(&self) {
        let mut status = self.status.lock();
        while matches!(*status, WarmupStatus::Doing | WarmupStatus::Stopping) {
            self.cond.wait(&mut status);
        }
    }
}

/// Read the records of `ids` and populate the node caches with their
/// neighborhoods and vector bytes. Already-cached ids are skipped.
pub(crate) fn load_cache_list<T: VectorElement>(
    index: &PQFlashIndex<T>,
    ids: &[u32],
) -> Result<()> {
    let layout = &index.layout;
    let mut by_sector: HashMap<u64, Vec<u32>> = HashMap::new();
    for &id in ids {
        if id as u64 >= layout.num_points || index.cache.contains(id) {
            continue;
        }
        let group = by_sector.entry(layout.node_sector_offset(id)).or_default();
        if !group.contains(&id) {
            group.push(id);
        }
    }
    if by_sector.is_empty() {
        return Ok(());
    }

    let read_len = layout.read_len_for_node;
    let groups: Vec<(u64, Vec<u32>)> = by_sector.into_iter().collect();
    let mut guard = index.scratch_pool.acquire();
    let scratch = &mut *guard;
    let mut inserted = 0usize;

    for batch in groups.chunks(MAX_N_SECTOR_READS) {
        let mut reqs: Vec<AlignedRead<'_>> = Vec::with_capacity(batch.len());
        let mut remaining: &mut [u8] = &mut scratch.sector_scratch[..];
        for (offset, _) in batch {
            let (slot, rest) = remaining.split_at_mut(read_len);
            remaining = rest;
            reqs.push(AlignedRead::new(*offset, slot));
        }
        index.reader.read(&mut reqs, &scratch.io_ctx)?;

        let mut entries: Vec<(u32, Vec<u32>, Vec<u8>)> = Vec::new();
        for (i, (offset, members)) in batch.iter().enumerate() {
            for &id in members {
                let node = layout.node_slice(&reqs[i].buf, id);
                let mut nbrs = Vec::new();
                layout.parse_neighborhood(node, *offset, &mut nbrs)?;
                entries.push((id, nbrs, layout.vector_bytes(node).to_vec()));
            }
        }
        inserted += entries.len();
        index
            .cache
            .insert_batch(entries.iter().map(|(id, n, c)| (*id, &n[..], &c[..])));
    }

    tracing::info!(nodes = inserted, "populated node cache");
    Ok(())
}

/// Pick up to `num_nodes` cache candidates breadth-first from the medoids
/// and load them into the caches. Returns the picked ids in BFS order.
pub(crate) fn cache_bfs_levels<T: VectorElement>(
    index: &PQFlashIndex<T>,
    num_nodes: usize,
) -> Result<Vec<u32>> {
    let layout = &index.layout;
    let mut seen = vec![false; layout.num_points as usize];
    let mut picked: Vec<u32> = Vec::with_capacity(num_nodes);
    let mut level: Vec<u32> = Vec::new();

    for &m in &index.medoids {
        if !seen[m as usize] {
            seen[m as usize] = true;
            picked.push(m);
            level.push(m);
        }
    }

    let read_len = layout.read_len_for_node;
    let mut depth = 0usize;
    while picked.len() < num_nodes && !level.is_empty() {
        let mut next: Vec<u32> = Vec::new();
        let mut guard = index.scratch_pool.acquire();
        let scratch = &mut *guard;
        for batch in level.chunks(MAX_N_SECTOR_READS) {
            let mut reqs: Vec<AlignedRead<'_>> = Vec::with_capacity(batch.len());
            let mut remaining: &mut [u8] = &mut scratch.sector_scratch[..];
            for &id in batch {
                let (slot, rest) = remaining.split_at_mut(read_len);
                remaining = rest;
                reqs.push(AlignedRead::new(layout.node_sector_offset(id), slot));
            }
            index.reader.read(&mut reqs, &scratch.io_ctx)?;

            for (i, &id) in batch.iter().enumerate() {
                let node = layout.node_slice(&reqs[i].buf, id);
                layout.parse_neighborhood(
                    node,
                    layout.node_sector_offset(id),
                    &mut scratch.nbr_scratch,
                )?;
                for &nbr in scratch.nbr_scratch.iter() {
                    if picked.len() >= num_nodes {
                        break;
                    }
                    if !seen[nbr as usize] {
                        seen[nbr as usize] = true;
                        picked.push(nbr);
                        next.push(nbr);
                    }
                }
            }
        }
        depth += 1;
        tracing::debug!(depth, frontier = next.len(), cached = picked.len(), "bfs level");
        level = next;
    }

    load_cache_list(index, &picked)?;
    Ok(picked)
}

/// Start the asynchronous sampler thread. Fails if a warm-up is already
/// running.
pub(crate) fn start_async_sampler<T: VectorElement>(
    index: &Arc<PQFlashIndex<T>>,
    sample_bin: &Path,
    l_search: usize,
    beam_width: usize,
    num_nodes_to_cache: usize,
) -> Result<()> {
    if !index.warmup_state.try_begin() {
        return Err(PqFlashError::InvalidArgument(
            "cache warm-up already in progress".into(),
        ));
    }
    {
        let mut counters = index.node_visit_counter.write();
        counters.clear();
        counters.resize_with(index.layout.num_points as usize, || AtomicU32::new(0));
    }
    index.count_visited_nodes.store(true, Ordering::Relaxed);

    let idx = Arc::clone(index);
    let sample_bin = sample_bin.to_path_buf();
    let handle = std::thread::spawn(move || {
        let outcome = run_sampler(&idx, &sample_bin, l_search, beam_width, num_nodes_to_cache);
        idx.count_visited_nodes.store(false, Ordering::Relaxed);
        match outcome {
            Ok(()) | Err(PqFlashError::Cancelled) => idx.warmup_state.set(WarmupStatus::Done),
            Err(e) => {
                tracing::warn!(error = %e, "sample-query warm-up failed");
                idx.warmup_state.set(WarmupStatus::Killed);
            }
        }
    });
    *index.warmup_handle.lock() = Some(handle);
    Ok(())
}

fn run_sampler<T: VectorElement>(
    index: &Arc<PQFlashIndex<T>>,
    sample_bin: &Path,
    l_search: usize,
    beam_width: usize,
    num_nodes_to_cache: usize,
) -> Result<()> {
    let (shape, samples) = read_bin::<T>(sample_bin)?;
    if shape.cols != index.layout.dim {
        return Err(PqFlashError::FormatMismatch {
            file: sample_bin.display().to_string(),
            reason: format!(
                "sample queries have {} dims, index has {}",
                shape.cols, index.layout.dim
            ),
        });
    }

    let mut cancelled = false;
    for s in 0..shape.rows {
        if index.warmup_state.should_stop() {
            cancelled = true;
            break;
        }
        let query = &samples[s * shape.cols..(s + 1) * shape.cols];
        cached_beam_search(
            index,
            query,
            WARMUP_SAMPLE_K,
            l_search.max(WARMUP_SAMPLE_K),
            beam_width,
            SearchOptions::default(),
        )?;
    }

    // Hand off the hottest nodes even on early stop: a partial sample still
    // ranks frequently visited vertices first.
    let mut ranked: Vec<(u32, u32)> = {
        let counters = index.node_visit_counter.read();
        counters
            .iter()
            .enumerate()
            .filter_map(|(id, c)| {
                let n = c.load(Ordering::Relaxed);
                (n > 0).then_some((n, id as u32))
            })
            .collect()
    };
    ranked.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    ranked.truncate(num_nodes_to_cache);
    let picked: Vec<u32> = ranked.into_iter().map(|(_, id)| id).collect();
    load_cache_list(index, &picked)?;
    tracing::info!(
        sampled = shape.rows,
        cached = picked.len(),
        cancelled,
        "sample-query warm-up finished"
    );

    if cancelled {
        return Err(PqFlashError::Cancelled);
    }
    Ok(())
}

/// Stop any in-flight warm-up and wait for it to settle. Idempotent; also
/// called from the index destructor.
pub(crate) fn destroy_cache_async_task<T: VectorElement>(index: &PQFlashIndex<T>) {
    index.warmup_state.request_stop();
    index.warmup_state.wait_until_settled();
    if let Some(handle) = index.warmup_handle.lock().take() {
        // The sampler thread keeps the index alive through its own Arc, so
        // the final drop can run on that very thread; joining it from
        // itself would deadlock. The status is already settled by then.
        if handle.thread().id() != std::thread::current().id() {
            let _ = handle.join();
        }
    }
}
