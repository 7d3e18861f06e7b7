//! Peer ID allocation with recycling.

use std::collections::BTreeSet;

use crate::peer::PeerId;

/// Hands out non-zero peer IDs, preferring freed IDs over new ones.
///
/// Reuse keeps IDs small under connect/disconnect churn. The lowest freed
/// ID is handed out first.
#[derive(Debug)]
pub struct IdAllocator {
    next: u32,
    free: BTreeSet<u32>,
}

impl IdAllocator {
    /// Create an allocator whose first ID is 1.
    pub fn new() -> Self {
        Self {
            next: 1,
            free: BTreeSet::new(),
        }
    }

    /// Return a recycled ID if one is free, otherwise the next fresh one.
    ///
    /// Returns `None` once every `u32` above zero is in use.
    pub fn allocate(&mut self) -> Option<PeerId> {
        if let Some(id) = self.free.pop_first() {
            return Some(PeerId(id));
        }
        if self.next == 0 {
            return None;
        }
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        Some(PeerId(id))
    }

    /// Return `id` to the free set. Unknown or unassigned IDs are ignored.
    pub fn release(&mut self, id: PeerId) {
        let issued = self.next == 0 || id.0 < self.next;
        if id.is_assigned() && issued {
            self.free.insert(id.0);
        }
    }

    /// Number of IDs waiting for reuse.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.allocate(), Some(PeerId(1)));
        assert_eq!(ids.allocate(), Some(PeerId(2)));
        assert_eq!(ids.allocate(), Some(PeerId(3)));
    }

    #[test]
    fn test_freed_id_is_preferred() {
        let mut ids = IdAllocator::new();
        let a = ids.allocate().unwrap();
        let _b = ids.allocate().unwrap();
        ids.release(a);
        assert_eq!(ids.allocate(), Some(a));
        assert_eq!(ids.allocate(), Some(PeerId(3)));
    }

    #[test]
    fn test_lowest_freed_id_first() {
        let mut ids = IdAllocator::new();
        let all: Vec<_> = (0..5).map(|_| ids.allocate().unwrap()).collect();
        ids.release(all[3]);
        ids.release(all[1]);
        assert_eq!(ids.allocate(), Some(all[1]));
        assert_eq!(ids.allocate(), Some(all[3]));
    }

    #[test]
    fn test_churn_does_not_grow_ids() {
        let mut ids = IdAllocator::new();
        for _ in 0..1000 {
            let id = ids.allocate().unwrap();
            ids.release(id);
        }
        assert_eq!(ids.allocate(), Some(PeerId(1)));
        assert_eq!(ids.allocate(), Some(PeerId(2)));
    }

    #[test]
    fn test_release_ignores_unassigned_and_unissued() {
        let mut ids = IdAllocator::new();
        ids.release(PeerId::UNASSIGNED);
        ids.release(PeerId(40));
        assert_eq!(ids.free_count(), 0);
        assert_eq!(ids.allocate(), Some(PeerId(1)));
    }

    #[test]
    fn test_double_release_is_idempotent() {
        let mut ids = IdAllocator::new();
        let id = ids.allocate().unwrap();
        ids.release(id);
        ids.release(id);
        assert_eq!(ids.free_count(), 1);
    }
}
