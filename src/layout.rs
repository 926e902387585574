//! On-disk sector layout: metadata block parsing and node-record math.
//!
//! Sector 0 of the disk index holds a block of `u64` metadata fields and,
//! when the graph has several entry points, an inline medoid list. Every
//! following sector packs node records: the node's full-precision vector
//! followed by `nnbrs: u32` and `nnbrs` neighbor ids.
//!
//! Two packings exist, chosen by record size at build time:
//! - **short-node**: `nnodes_per_sector >= 1` records per sector;
//! - **long-node** (`nnodes_per_sector == 0` in the metadata): each record
//!   spans `ceil(max_node_len / SECTOR_LEN)` contiguous sectors.

use crate::config::{DISK_META_FIELDS, MAX_GRAPH_DEGREE, SECTOR_LEN};
use crate::error::{PqFlashError, Result};

/// Read one little-endian `u32` from an arbitrary byte offset.
#[inline]
pub(crate) fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[inline]
fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Metadata block parsed from sector 0 of the disk index.
#[derive(Debug, Clone)]
pub struct DiskIndexMeta {
    pub num_points: u64,
    pub dim: u64,
    pub max_node_len: u64,
    /// Records per sector; 0 selects the long-node layout.
    pub nnodes_per_sector: u64,
    pub num_frozen: u64,
    pub frozen_loc: u64,
    pub reorder_exists: bool,
    pub reorder_dims: u64,
    pub reorder_start_sector: u64,
    pub nvecs_per_sector: u64,
    /// Entry-point vertices. Always at least one.
    pub medoids: Vec<u32>,
}

impl DiskIndexMeta {
    /// Parse the metadata block out of sector 0. `file` names the source
    /// for error messages.
    pub fn parse(sector0: &[u8], file: &str) -> Result<Self> {
        let mismatch = |reason: String| PqFlashError::FormatMismatch {
            file: file.to_string(),
            reason,
        };
        if sector0.len() < SECTOR_LEN {
            return Err(mismatch(format!(
                "metadata sector is {} bytes, expected {}",
                sector0.len(),
                SECTOR_LEN
            )));
        }

        let field = |i: usize| read_u64(&sector0[i * 8..]);
        let num_points = field(0);
        let dim = field(1);
        let medoid = field(2);
        let max_node_len = field(3);
        let nnodes_per_sector = field(4);
        let num_frozen = field(5);
        let frozen_loc = field(6);
        let reorder_exists = field(7) != 0;
        let reorder_dims = field(8);
        let reorder_start_sector = field(9);
        let nvecs_per_sector = field(10);
        let num_medoids = field(11);

        if num_points == 0 || num_points > u32::MAX as u64 {
            return Err(mismatch(format!("implausible point count {num_points}")));
        }
        if dim == 0 {
            return Err(mismatch("zero dimension".to_string()));
        }
        if max_node_len == 0 {
            return Err(mismatch("zero max_node_len".to_string()));
        }
        if nnodes_per_sector > 0 && nnodes_per_sector * max_node_len > SECTOR_LEN as u64 {
            return Err(mismatch(format!(
                "{nnodes_per_sector} records of {max_node_len} bytes overflow a sector"
            )));
        }

        let medoids = if num_medoids <= 1 {
            vec![medoid as u32]
        } else {
            let list_start = DISK_META_FIELDS * 8;
            let list_end = list_start + num_medoids as usize * 8;
            if list_end > SECTOR_LEN {
                return Err(mismatch(format!(
                    "medoid list of {num_medoids} entries overflows the metadata sector"
                )));
            }
            (0..num_medoids as usize)
                .map(|i| read_u64(&sector0[list_start + i * 8..]) as u32)
                .collect()
        };
        for &m in &medoids {
            if m as u64 >= num_points {
                return Err(mismatch(format!("medoid {m} out of range")));
            }
        }

        Ok(Self {
            num_points,
            dim,
            max_node_len,
            nnodes_per_sector,
            num_frozen,
            frozen_loc,
            reorder_exists,
            reorder_dims,
            reorder_start_sector,
            nvecs_per_sector,
            medoids,
        })
    }
}

/// Reorder-vector region parameters (full-precision vectors used only for
/// final reranking).
#[derive(Debug, Clone, Copy)]
pub struct ReorderInfo {
    pub dims: usize,
    pub start_sector: u64,
    pub nvecs_per_sector: usize,
}

/// Immutable node-record geometry, fixed at load time.
#[derive(Debug, Clone)]
pub struct SectorLayout {
    pub num_points: u64,
    pub dim: usize,
    /// Bytes of vector data leading each record: `dim * sizeof(T)`, or the
    /// disk-PQ code length when the on-disk vectors are themselves PQ codes.
    pub disk_bytes_per_point: usize,
    pub max_node_len: usize,
    /// Records per sector in the short-node layout; 0 for long-node.
    pub nnodes_per_sector: usize,
    /// Sectors per record (1 in the short-node layout).
    pub nsectors_per_node: usize,
    /// Bytes to read to cover one node's record.
    pub read_len_for_node: usize,
    /// Largest neighbor count a record can hold.
    pub max_degree: usize,
    pub reorder: Option<ReorderInfo>,
}

impl SectorLayout {
    pub fn new(meta: &DiskIndexMeta, disk_bytes_per_point: usize, file: &str) -> Result<Self> {
        let max_node_len = meta.max_node_len as usize;
        let header = disk_bytes_per_point + 4;
        if max_node_len < header + 4 {
            return Err(PqFlashError::FormatMismatch {
                file: file.to_string(),
                reason: format!(
                    "max_node_len {max_node_len} cannot hold a {disk_bytes_per_point}-byte vector \
                     and a neighborhood"
                ),
            });
        }
        let max_degree = ((max_node_len - header) / 4).min(MAX_GRAPH_DEGREE);
        let long_node = meta.nnodes_per_sector == 0;
        let nsectors_per_node = if long_node {
            max_node_len.div_ceil(SECTOR_LEN)
        } else {
            1
        };
        let reorder = meta.reorder_exists.then(|| ReorderInfo {
            dims: meta.reorder_dims as usize,
            start_sector: meta.reorder_start_sector,
            nvecs_per_sector: meta.nvecs_per_sector as usize,
        });
        Ok(Self {
            num_points: meta.num_points,
            dim: meta.dim as usize,
            disk_bytes_per_point,
            max_node_len,
            nnodes_per_sector: meta.nnodes_per_sector as usize,
            nsectors_per_node,
            read_len_for_node: nsectors_per_node * SECTOR_LEN,
            max_degree,
            reorder,
        })
    }

    #[inline]
    pub fn is_long_node(&self) -> bool {
        self.nnodes_per_sector == 0
    }

    /// Byte offset of the sector (or sector run) holding `id`'s record.
    #[inline]
    pub fn node_sector_offset(&self, id: u32) -> u64 {
        let sector = if self.is_long_node() {
            1 + id as u64 * self.nsectors_per_node as u64
        } else {
            1 + id as u64 / self.nnodes_per_sector as u64
        };
        sector * SECTOR_LEN as u64
    }

    /// Region of a fetched sector buffer holding `id`'s record.
    #[inline]
    pub fn node_slice<'a>(&self, sector_buf: &'a [u8], id: u32) -> &'a [u8] {
        let start = if self.is_long_node() {
            0
        } else {
            (id as usize % self.nnodes_per_sector) * self.max_node_len
        };
        &sector_buf[start..start + self.max_node_len]
    }

    /// Vector bytes leading a node record.
    #[inline]
    pub fn vector_bytes<'a>(&self, node: &'a [u8]) -> &'a [u8] {
        &node[..self.disk_bytes_per_point]
    }

    /// Parse a record's neighborhood into `out`.
    ///
    /// A degree outside `[0, max_degree]` or a neighbor id outside
    /// `[0, num_points)` is corruption, fatal to the query.
    pub fn parse_neighborhood(
        &self,
        node: &[u8],
        sector_offset: u64,
        out: &mut Vec<u32>,
    ) -> Result<()> {
        let nnbrs = read_u32(&node[self.disk_bytes_per_point..]) as usize;
        if nnbrs > self.max_degree {
            return Err(PqFlashError::CorruptIndex {
                sector_offset,
                reason: format!("degree {nnbrs} exceeds limit {}", self.max_degree),
            });
        }
        let base = self.disk_bytes_per_point + 4;
        out.clear();
        for i in 0..nnbrs {
            let nbr = read_u32(&node[base + i * 4..]);
            if nbr as u64 >= self.num_points {
                return Err(PqFlashError::CorruptIndex {
                    sector_offset,
                    reason: format!("neighbor id {nbr} out of range"),
                });
            }
            out.push(nbr);
        }
        Ok(())
    }

    /// Byte offset of the reorder-region sector holding `id`'s vector,
    /// with the vector's offset inside that sector.
    pub fn reorder_location(&self, id: u32) -> Option<(u64, usize)> {
        let info = self.reorder.as_ref()?;
        let sector = info.start_sector + id as u64 / info.nvecs_per_sector as u64;
        let within = (id as usize % info.nvecs_per_sector) * info.dims * 4;
        Some((sector * SECTOR_LEN as u64, within))
    }
}
