//! In-memory caches for hot graph neighborhoods and vectors.
//!
//! [`NodeCache`] holds neighborhoods and on-disk vector bytes for the nodes
//! picked by warm-up. Entries live in two bulk arenas and are addressed by
//! arena offsets; once inserted they are never evicted, so lookups can copy
//! out under a short read lock. Only warm-up writes, holding the lock
//! exclusively.
//!
//! [`SectorLru`] is the one mutable cache on the search path: a small
//! mutex-protected LRU of id -> sector byte offset used by
//! `get_vector_by_ids` for ids resolved recently.

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;

#[derive(Default)]
struct CacheInner {
    /// Bulk arena of neighbor ids.
    nhood_arena: Vec<u32>,
    /// Bulk arena of raw on-disk vector bytes, `bytes_per_point` each.
    coord_arena: Vec<u8>,
    /// id -> (offset, len) into `nhood_arena`.
    nhoods: HashMap<u32, (u32, u32)>,
    /// id -> element index into `coord_arena`.
    coords: HashMap<u32, u32>,
}

/// Read-mostly cache of warmed-up nodes.
pub struct NodeCache {
    bytes_per_point: usize,
    inner: RwLock<CacheInner>,
}

impl NodeCache {
    pub fn new(bytes_per_point: usize) -> Self {
        Self {
            bytes_per_point,
            inner: RwLock::new(CacheInner::default()),
        }
    }

    /// Insert a batch of `(id, neighbors, vector bytes)` entries. Ids
    /// already present are skipped, so repeated warm-ups stay idempotent.
    pub fn insert_batch<'a, I>(&self, items: I)
    where
        I: IntoIterator<Item = (u32, &'a [u32], &'a [u8])>,
    {
        let mut inner = self.inner.write();
        for (id, nbrs, coord) in items {
            if inner.nhoods.contains_key(&id) {
                continue;
            }
            debug_assert_eq!(coord.len(), self.bytes_per_point);
            let nh_off = inner.nhood_arena.len() as u32;
            inner.nhood_arena.extend_from_slice(nbrs);
            inner.nhoods.insert(id, (nh_off, nbrs.len() as u32));
            let c_off = inner.coords.len() as u32;
            inner.coord_arena.extend_from_slice(coord);
            inner.coords.insert(id, c_off);
        }
    }

    /// Copy a cached node's neighborhood and vector bytes out. Returns
    /// false on a miss without touching the outputs.
    pub fn copy_node(&self, id: u32, nbrs: &mut Vec<u32>, coord: &mut Vec<u8>) -> bool {
        let inner = self.inner.read();
        let Some(&(off, len)) = inner.nhoods.get(&id) else {
            return false;
        };
        nbrs.clear();
        nbrs.extend_from_slice(&inner.nhood_arena[off as usize..(off + len) as usize]);
        let c_off = inner.coords[&id] as usize * self.bytes_per_point;
        coord.clear();
        coord.extend_from_slice(&inner.coord_arena[c_off..c_off + self.bytes_per_point]);
        true
    }

    /// Copy only the cached vector bytes for `id`.
    pub fn copy_coord(&self, id: u32, out: &mut [u8]) -> bool {
        let inner = self.inner.read();
        let Some(&c_off) = inner.coords.get(&id) else {
            return false;
        };
        let start = c_off as usize * self.bytes_per_point;
        out.copy_from_slice(&inner.coord_arena[start..start + self.bytes_per_point]);
        true
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.inner.read().nhoods.contains_key(&id)
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.inner.read().nhoods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate resident bytes of the arenas and maps.
    pub fn memory_bytes(&self) -> usize {
        let inner = self.inner.read();
        inner.nhood_arena.len() * 4
            + inner.coord_arena.len()
            + inner.nhoods.len() * (4 + 8)
            + inner.coords.len() * (4 + 4)
    }
}

/// Mutex-protected LRU of id -> sector byte offset.
pub struct SectorLru {
    inner: Mutex<LruCache<u32, u64>>,
}

impl SectorLru {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Look up a recently resolved sector offset.
    pub fn get(&self, id: u32) -> Option<u64> {
        self.inner.lock().get(&id).copied()
    }

    /// Record a resolved sector offset.
    pub fn put(&self, id: u32, sector_offset: u64) {
        self.inner.lock().put(id, sector_offset);
    }
}
