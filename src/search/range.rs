//! Radius search driver over the beam engine.
//!
//! Runs the beam search with doubling list sizes until the number of
//! in-range results stops growing (or the caller's ceiling is reached),
//! then returns every result inside the radius.

use crate::bitset::BitsetView;
use crate::distance::VectorElement;
use crate::error::{PqFlashError, Result};
use crate::index::PQFlashIndex;
use crate::search::beam::{cached_beam_search, SearchOptions};
use crate::stats::QueryStats;

#[allow(clippy::too_many_arguments)]
pub(crate) fn range_search<T: VectorElement>(
    index: &PQFlashIndex<T>,
    query: &[T],
    radius: f32,
    l_min: usize,
    l_max: usize,
    beam_width: usize,
    bitset: Option<BitsetView>,
    mut stats: Option<&mut QueryStats>,
) -> Result<Vec<(u32, f32)>> {
    if l_min == 0 || l_min > l_max {
        return Err(PqFlashError::InvalidArgument(format!(
            "bad search list bounds [{l_min}, {l_max}]"
        )));
    }

    let mut l = l_min;
    let final_results;
    let mut prev_count: Option<usize> = None;
    loop {
        let opts = SearchOptions {
            bitset: bitset.clone(),
            stats: stats.as_deref_mut(),
            ..Default::default()
        };
        let results = cached_beam_search(index, query, l, l, beam_width, opts)?;
        let count = results
            .iter()
            .filter(|&&(_, d)| index.metric.in_range(d, radius))
            .count();
        let stable = prev_count == Some(count);
        if stable || l >= l_max {
            final_results = results;
            break;
        }
        prev_count = Some(count);
        l = (l * 2).min(l_max);
    }

    // One caller-visible search, however many doubling rounds it took.
    index.note_search();
    Ok(final_results
        .into_iter()
        .filter(|&(_, d)| index.metric.in_range(d, radius))
        .collect())
}
