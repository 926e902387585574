//! Bounded best-first candidate pool for the beam search frontier.
//!
//! A sorted array of at most `L` candidates ordered by `(distance, id)`.
//! Insertion drops the worst entry on overflow; expansion walks the sorted
//! prefix, so the best unexpanded candidates are always selected first.

use ordered_float::OrderedFloat;

/// One frontier candidate: PQ-approximated distance plus expansion state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub id: u32,
    pub distance: f32,
    pub expanded: bool,
}

#[inline]
fn key(c: &Candidate) -> (OrderedFloat<f32>, u32) {
    (OrderedFloat(c.distance), c.id)
}

/// Bounded min-first pool with no duplicate ids (callers gate inserts on
/// the per-query visited set).
#[derive(Debug)]
pub struct CandidatePool {
    data: Vec<Candidate>,
    capacity: usize,
}

impl CandidatePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Insert a candidate, keeping the pool sorted and bounded. Returns
    /// false when the candidate was worse than everything retained.
    pub fn insert(&mut self, id: u32, distance: f32) -> bool {
        let cand = Candidate {
            id,
            distance,
            expanded: false,
        };
        let pos = self
            .data
            .partition_point(|c| key(c) < key(&cand));
        if pos >= self.capacity {
            return false;
        }
        self.data.insert(pos, cand);
        if self.data.len() > self.capacity {
            self.data.pop();
        }
        true
    }

    /// Smallest approximate distance among unexpanded candidates.
    pub fn best_unexpanded(&self) -> Option<f32> {
        self.data
            .iter()
            .find(|c| !c.expanded)
            .map(|c| c.distance)
    }

    /// Move up to `max` best unexpanded candidates into `out`, marking
    /// them expanded.
    pub fn take_unexpanded(&mut self, max: usize, out: &mut Vec<Candidate>) {
        out.clear();
        for c in self.data.iter_mut() {
            if out.len() >= max {
                break;
            }
            if !c.expanded {
                c.expanded = true;
                out.push(*c);
            }
        }
    }

    /// Number of retained candidates.
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_bounded_insert() {
        let mut pool = CandidatePool::new(3);
        assert!(pool.insert(1, 5.0));
        assert!(pool.insert(2, 1.0));
        assert!(pool.insert(3, 3.0));
        // full: inserting better drops the worst
        assert!(pool.insert(4, 2.0));
        assert_eq!(pool.len(), 3);
        let dists: Vec<f32> = pool.data.iter().map(|c| c.distance).collect();
        assert_eq!(dists, vec![1.0, 2.0, 3.0]);
        // worse than everything retained
        assert!(!pool.insert(5, 9.0));
    }

    #[test]
    fn test_tie_break_by_id() {
        let mut pool = CandidatePool::new(4);
        pool.insert(7, 2.0);
        pool.insert(3, 2.0);
        pool.insert(5, 2.0);
        let ids: Vec<u32> = pool.data.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }

    #[test]
    fn test_take_unexpanded_marks_and_orders() {
        let mut pool = CandidatePool::new(4);
        pool.insert(1, 4.0);
        pool.insert(2, 1.0);
        pool.insert(3, 2.0);

        let mut batch = Vec::new();
        pool.take_unexpanded(2, &mut batch);
        let ids: Vec<u32> = batch.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 3]);

        assert_eq!(pool.best_unexpanded(), Some(4.0));
        pool.take_unexpanded(5, &mut batch);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, 1);
        assert_eq!(pool.best_unexpanded(), None);
    }

    #[test]
    fn test_new_insert_can_reopen_frontier() {
        let mut pool = CandidatePool::new(3);
        pool.insert(1, 1.0);
        let mut batch = Vec::new();
        pool.take_unexpanded(1, &mut batch);
        assert_eq!(pool.best_unexpanded(), None);
        pool.insert(2, 0.5);
        assert_eq!(pool.best_unexpanded(), Some(0.5));
    }
}
