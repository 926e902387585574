//! Test fixtures: write a real on-disk index family for a set of points.
//!
//! The graph is an R-nearest-neighbor graph with a ring edge for strong
//! connectivity. The PQ codebook is exact for up to 256 points: one chunk
//! covering all dimensions, pivot `b` equal to point `b`, code of point `i`
//! equal to `i`. PQ distances therefore coincide with exact distances and
//! search outcomes are fully deterministic.

// Not every test binary uses every helper.
#![allow(dead_code)]

use pqflash::{Metric, SECTOR_LEN};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const META_FIELDS: usize = 12;
const PQ_CENTROIDS: usize = 256;

pub struct Fixture {
    pub prefix: String,
    pub points: Vec<Vec<f32>>,
    pub adjacency: Vec<Vec<u32>>,
    pub medoids: Vec<u32>,
    pub max_node_len: usize,
    pub nnodes_per_sector: usize,
    // Held so the on-disk files outlive the fixture.
    #[allow(dead_code)]
    dir: TempDir,
}

pub struct FixtureBuilder {
    metric: Metric,
    points: Vec<Vec<f32>>,
    max_degree: usize,
    medoids: Vec<u32>,
    max_base_norm: f32,
    with_reorder: bool,
    force_long_layout: bool,
}

impl FixtureBuilder {
    pub fn new(metric: Metric, points: Vec<Vec<f32>>) -> Self {
        assert!(!points.is_empty());
        // Beyond 256 points the codes wrap and PQ becomes approximate;
        // graph-walk equivalence tests should stay at or below 256.
        Self {
            metric,
            points,
            max_degree: 8,
            medoids: Vec::new(),
            max_base_norm: 1.0,
            with_reorder: false,
            force_long_layout: false,
        }
    }

    pub fn max_degree(mut self, r: usize) -> Self {
        self.max_degree = r;
        self
    }

    pub fn medoids(mut self, medoids: Vec<u32>) -> Self {
        self.medoids = medoids;
        self
    }

    pub fn max_base_norm(mut self, v: f32) -> Self {
        self.max_base_norm = v;
        self
    }

    pub fn with_reorder(mut self) -> Self {
        self.with_reorder = true;
        self
    }

    pub fn force_long_layout(mut self) -> Self {
        self.force_long_layout = true;
        self
    }

    pub fn build(self) -> Fixture {
        let dir = TempDir::new().unwrap();
        let n = self.points.len();
        let dim = self.points[0].len();
        let adjacency = knn_adjacency(&self.points, self.max_degree);
        let max_degree = adjacency.iter().map(Vec::len).max().unwrap();
        let medoids = if self.medoids.is_empty() {
            vec![central_point(&self.points)]
        } else {
            self.medoids.clone()
        };

        let max_node_len = dim * 4 + 4 + max_degree * 4;
        assert!(max_node_len <= SECTOR_LEN, "record too large for fixture");
        let nnodes_per_sector = if self.force_long_layout {
            0
        } else {
            SECTOR_LEN / max_node_len
        };
        let n_graph_sectors = if nnodes_per_sector == 0 {
            n
        } else {
            n.div_ceil(nnodes_per_sector)
        };

        let (reorder_exists, reorder_start_sector, nvecs_per_sector) = if self.with_reorder {
            (1u64, (1 + n_graph_sectors) as u64, SECTOR_LEN / (dim * 4))
        } else {
            (0u64, 0u64, 0usize)
        };

        let prefix_path: PathBuf = dir.path().join("fixture");
        let prefix = prefix_path.to_str().unwrap().to_string();

        // --- <prefix>_disk.index ---
        let mut disk = File::create(format!("{prefix}_disk.index")).unwrap();
        let mut meta = [0u64; META_FIELDS];
        meta[0] = n as u64;
        meta[1] = dim as u64;
        meta[2] = medoids[0] as u64;
        meta[3] = max_node_len as u64;
        meta[4] = nnodes_per_sector as u64;
        meta[7] = reorder_exists;
        meta[8] = if self.with_reorder { dim as u64 } else { 0 };
        meta[9] = reorder_start_sector;
        meta[10] = nvecs_per_sector as u64;
        meta[11] = medoids.len() as u64;
        let mut sector0 = vec![0u8; SECTOR_LEN];
        for (i, f) in meta.iter().enumerate() {
            sector0[i * 8..i * 8 + 8].copy_from_slice(&f.to_le_bytes());
        }
        if medoids.len() > 1 {
            for (i, &m) in medoids.iter().enumerate() {
                let at = META_FIELDS * 8 + i * 8;
                sector0[at..at + 8].copy_from_slice(&(m as u64).to_le_bytes());
            }
        }
        disk.write_all(&sector0).unwrap();

        for (i, (point, nbrs)) in self.points.iter().zip(&adjacency).enumerate() {
            let mut record = Vec::with_capacity(max_node_len);
            for &v in point {
                record.extend_from_slice(&v.to_le_bytes());
            }
            record.extend_from_slice(&(nbrs.len() as u32).to_le_bytes());
            for &nbr in nbrs {
                record.extend_from_slice(&nbr.to_le_bytes());
            }
            record.resize(max_node_len, 0);
            let offset = node_record_offset(i, max_node_len, nnodes_per_sector);
            disk.seek(SeekFrom::Start(offset)).unwrap();
            disk.write_all(&record).unwrap();
        }
        // Pad the graph region to whole sectors.
        let graph_end = (1 + n_graph_sectors) * SECTOR_LEN;
        disk.set_len(graph_end as u64).unwrap();

        if self.with_reorder {
            for (i, point) in self.points.iter().enumerate() {
                let sector = reorder_start_sector as usize + i / nvecs_per_sector;
                let within = (i % nvecs_per_sector) * dim * 4;
                disk.seek(SeekFrom::Start((sector * SECTOR_LEN + within) as u64))
                    .unwrap();
                for &v in point {
                    disk.write_all(&v.to_le_bytes()).unwrap();
                }
            }
            let reorder_sectors = n.div_ceil(nvecs_per_sector);
            disk.set_len(((reorder_start_sector as usize + reorder_sectors) * SECTOR_LEN) as u64)
                .unwrap();
        }
        disk.flush().unwrap();

        // --- <prefix>_pq_pivots.bin: pivots, centroid, chunk offsets ---
        let mut pivots = File::create(format!("{prefix}_pq_pivots.bin")).unwrap();
        write_bin_header(&mut pivots, PQ_CENTROIDS, dim);
        for b in 0..PQ_CENTROIDS {
            for d in 0..dim {
                let v = if b < n { self.points[b][d] } else { 0.0 };
                pivots.write_all(&v.to_le_bytes()).unwrap();
            }
        }
        write_bin_header(&mut pivots, 1, dim);
        for _ in 0..dim {
            pivots.write_all(&0.0f32.to_le_bytes()).unwrap();
        }
        write_bin_header(&mut pivots, 1, 2);
        pivots.write_all(&0u32.to_le_bytes()).unwrap();
        pivots.write_all(&(dim as u32).to_le_bytes()).unwrap();
        pivots.flush().unwrap();

        // --- <prefix>_pq_compressed.bin: code of point i is i ---
        let mut codes = File::create(format!("{prefix}_pq_compressed.bin")).unwrap();
        write_bin_header(&mut codes, n, 1);
        for i in 0..n {
            codes.write_all(&[(i % PQ_CENTROIDS) as u8]).unwrap();
        }
        codes.flush().unwrap();

        match self.metric {
            Metric::Cosine => {
                let mut norms = File::create(format!("{prefix}_sample_norms.bin")).unwrap();
                write_bin_header(&mut norms, n, 1);
                for point in &self.points {
                    let norm: f32 = point.iter().map(|v| v * v).sum::<f32>().sqrt();
                    norms.write_all(&norm.to_le_bytes()).unwrap();
                }
                norms.flush().unwrap();
            }
            Metric::InnerProduct => {
                let mut f = File::create(format!("{prefix}_max_base_norm.bin")).unwrap();
                write_bin_header(&mut f, 1, 1);
                f.write_all(&self.max_base_norm.to_le_bytes()).unwrap();
                f.flush().unwrap();
            }
            Metric::L2 => {}
        }

        if medoids.len() > 1 {
            let mut f = File::create(format!("{prefix}_centroids.bin")).unwrap();
            write_bin_header(&mut f, medoids.len(), dim);
            for &m in &medoids {
                for &v in &self.points[m as usize] {
                    f.write_all(&v.to_le_bytes()).unwrap();
                }
            }
            f.flush().unwrap();
        }

        Fixture {
            prefix,
            points: self.points,
            adjacency,
            medoids,
            max_node_len,
            nnodes_per_sector,
            dir,
        }
    }
}

impl Fixture {
    /// Byte offset of node `i`'s record in the disk index file.
    pub fn record_offset(&self, id: usize) -> u64 {
        node_record_offset(id, self.max_node_len, self.nnodes_per_sector)
    }

    /// Byte offset of node `i`'s neighbor-count field.
    pub fn degree_field_offset(&self, id: usize) -> u64 {
        self.record_offset(id) + (self.points[0].len() * 4) as u64
    }

    /// Overwrite bytes inside the disk index file (corruption tests).
    pub fn poke(&self, offset: u64, bytes: &[u8]) {
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .open(format!("{}_disk.index", self.prefix))
            .unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
    }

    /// Expected results: exact internal-metric ordering over all points,
    /// reported on the emitted distance scale.
    pub fn exact_search(
        &self,
        metric: Metric,
        query: &[f32],
        k: usize,
        max_base_norm: f32,
    ) -> Vec<(u32, f32)> {
        let mut q = query.to_vec();
        match metric {
            Metric::Cosine => {
                let norm: f32 = q.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm <= f32::EPSILON {
                    return Vec::new();
                }
                for v in q.iter_mut() {
                    *v /= norm;
                }
            }
            Metric::InnerProduct => {
                if max_base_norm > 0.0 {
                    for v in q.iter_mut() {
                        *v /= max_base_norm;
                    }
                }
            }
            Metric::L2 => {}
        }
        let mut scored: Vec<(u32, f32)> = self
            .points
            .iter()
            .enumerate()
            .map(|(id, p)| {
                let internal = match metric {
                    Metric::L2 => q
                        .iter()
                        .zip(p)
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f32>(),
                    Metric::InnerProduct | Metric::Cosine => {
                        let dot: f32 = q.iter().zip(p).map(|(a, b)| a * b).sum();
                        let mut d = -dot;
                        if metric == Metric::Cosine {
                            let norm: f32 = p.iter().map(|v| v * v).sum::<f32>().sqrt();
                            d /= norm;
                        }
                        d
                    }
                };
                (id as u32, internal)
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(id, internal)| {
                let emitted = match metric {
                    Metric::InnerProduct => -internal * max_base_norm,
                    _ => internal,
                };
                (id, emitted)
            })
            .collect()
    }

    pub fn write_sample_bin(&self, name: &str, queries: &[Vec<f32>]) -> PathBuf {
        let path = PathBuf::from(format!("{}_{name}", self.prefix));
        let mut f = File::create(&path).unwrap();
        write_bin_header(&mut f, queries.len(), queries[0].len());
        for q in queries {
            for &v in q {
                f.write_all(&v.to_le_bytes()).unwrap();
            }
        }
        f.flush().unwrap();
        path
    }
}

fn node_record_offset(id: usize, max_node_len: usize, nnodes_per_sector: usize) -> u64 {
    if nnodes_per_sector == 0 {
        ((1 + id) * SECTOR_LEN) as u64
    } else {
        let sector = 1 + id / nnodes_per_sector;
        (sector * SECTOR_LEN + (id % nnodes_per_sector) * max_node_len) as u64
    }
}

fn write_bin_header(f: &mut File, rows: usize, cols: usize) {
    f.write_all(&(rows as i32).to_le_bytes()).unwrap();
    f.write_all(&(cols as i32).to_le_bytes()).unwrap();
}

/// R-nearest-neighbor adjacency with a ring edge for connectivity.
fn knn_adjacency(points: &[Vec<f32>], r: usize) -> Vec<Vec<u32>> {
    let n = points.len();
    (0..n)
        .map(|i| {
            let mut others: Vec<(f32, u32)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| {
                    let d: f32 = points[i]
                        .iter()
                        .zip(&points[j])
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum();
                    (d, j as u32)
                })
                .collect();
            others.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(a.1.cmp(&b.1)));
            let mut nbrs: Vec<u32> = others.into_iter().take(r).map(|(_, j)| j).collect();
            let ring = ((i + 1) % n) as u32;
            if n > 1 && !nbrs.contains(&ring) {
                nbrs.push(ring);
            }
            nbrs
        })
        .collect()
}

fn central_point(points: &[Vec<f32>]) -> u32 {
    let n = points.len();
    let mut best = 0u32;
    let mut best_total = f32::INFINITY;
    for i in 0..n {
        let total: f32 = (0..n)
            .map(|j| {
                points[i]
                    .iter()
                    .zip(&points[j])
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>()
            })
            .sum();
        if total < best_total {
            best_total = total;
            best = i as u32;
        }
    }
    best
}

/// Deterministic pseudo-random points for larger fixtures.
pub fn random_points(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}
