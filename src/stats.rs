//! Per-query statistics and traversal logging.

/// Counters filled in by a single search when the caller passes a sink.
///
/// All counters are best-effort diagnostics; they never affect results.
/// Sinks accumulate, so drivers that issue several searches (range, the
/// warm-up sampler) report totals.
#[derive(Debug, Default, Clone)]
pub struct QueryStats {
    /// Read requests issued to the aligned reader.
    pub n_ios: u32,
    /// Total 4 KiB sectors transferred.
    pub n_4k: u32,
    /// Beam rounds executed.
    pub n_hops: u32,
    /// PQ distance evaluations.
    pub n_cmps: u32,
    /// Neighborhoods resolved from the in-memory cache instead of disk.
    pub n_cache_hits: u32,
    /// Microseconds spent inside reader calls.
    pub io_us: u64,
    /// Microseconds for the whole search.
    pub total_us: u64,
    /// Whether the query ran the brute-force scan instead of the graph walk.
    pub used_brute_force: bool,
}

impl QueryStats {
    /// Fold another query's counters into this sink.
    pub fn accumulate(&mut self, other: &QueryStats) {
        self.n_ios += other.n_ios;
        self.n_4k += other.n_4k;
        self.n_hops += other.n_hops;
        self.n_cmps += other.n_cmps;
        self.n_cache_hits += other.n_cache_hits;
        self.io_us += other.io_us;
        self.total_us += other.total_us;
        self.used_brute_force |= other.used_brute_force;
    }
}

/// Optional record of a search's traversal, for host-side visualization.
///
/// Each entry pairs an expanded vertex with the neighbor ids admitted from
/// its adjacency list; `top_results` holds the final emitted candidates.
#[derive(Debug, Default)]
pub struct TraversalLog {
    pub expansions: Vec<(u32, Vec<u32>)>,
    pub top_results: Vec<(u32, f32)>,
}

impl TraversalLog {
    pub fn record_expansion(&mut self, id: u32, admitted: &[u32]) {
        self.expansions.push((id, admitted.to_vec()));
    }
}
