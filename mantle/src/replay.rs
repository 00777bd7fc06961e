use indexmap::IndexSet;

use crate::error::Fault;

/// Remembers recently admitted decryption IVs so a replayed session is
/// refused. Bounded: past capacity the oldest entry is evicted first.
pub struct ReplayCache {
    seen: IndexSet<Vec<u8>>,
    capacity: usize,
}

impl ReplayCache {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> ReplayCache {
        ReplayCache {
            seen: IndexSet::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    #[inline]
    pub fn contains(&self, iv: &[u8]) -> bool {
        self.seen.contains(iv)
    }

    /// Admits the IV or fails with `Fault::Replay` when it was seen before.
    pub fn check_and_insert(&mut self, iv: &[u8]) -> Result<(), Fault> {
        if self.seen.contains(iv) {
            return Err(Fault::Replay);
        }
        if self.seen.len() == self.capacity {
            self.seen.shift_remove_index(0);
        }
        self.seen.insert(iv.to_vec());
        Ok(())
    }
}

impl Default for ReplayCache {
    fn default() -> ReplayCache {
        ReplayCache::new(ReplayCache::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_is_rejected() {
        let mut cache = ReplayCache::default();
        assert!(cache.check_and_insert(&[1, 2, 3]).is_ok());
        assert_eq!(cache.check_and_insert(&[1, 2, 3]), Err(Fault::Replay));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_ivs_are_admitted() {
        let mut cache = ReplayCache::default();
        for i in 0..100u8 {
            assert!(cache.check_and_insert(&[i; 16]).is_ok());
        }
        assert_eq!(cache.len(), 100);
    }

    #[test]
    fn test_eviction_is_oldest_first() {
        let mut cache = ReplayCache::new(4);
        for i in 0..4u8 {
            cache.check_and_insert(&[i]).unwrap();
        }
        assert_eq!(cache.len(), 4);

        // a fifth entry pushes out the first
        cache.check_and_insert(&[4]).unwrap();
        assert_eq!(cache.len(), 4);
        assert!(!cache.contains(&[0]));
        assert!(cache.contains(&[1]));
        assert!(cache.contains(&[4]));

        // the evicted IV is admissible again
        assert!(cache.check_and_insert(&[0]).is_ok());
        assert!(!cache.contains(&[1]));
    }
}
