//! Block activation cache
//!
//! Holds the captured inputs for the block currently being processed.
//! Single writer: only the blockwise loop replaces the contents, once per
//! block, as a whole set. Cardinality is fixed at construction; a
//! replacement with a different entry count is a fatal error because every
//! later block assumes a complete, consistent input set.

use crate::calib::BlockArgs;
use crate::error::{Error, Result};

/// Cache of per-sample block inputs for the current block
#[derive(Debug)]
pub struct BlockInputCache {
    entries: Vec<BlockArgs>,
}

impl BlockInputCache {
    /// Create from the first block's captured inputs
    pub fn new(entries: Vec<BlockArgs>) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::Capture {
                sample: 0,
                reason: "no captured inputs".into(),
            });
        }
        Ok(Self { entries })
    }

    /// Current entries, one per calibration sample
    pub fn get(&self) -> &[BlockArgs] {
        &self.entries
    }

    /// Replace the entire contents with the next block's inputs
    ///
    /// The previous generation is dropped here, which is the release point
    /// for the bounded-working-set invariant.
    pub fn set(&mut self, new_entries: Vec<BlockArgs>) -> Result<()> {
        if new_entries.len() != self.entries.len() {
            return Err(Error::CacheCardinality {
                expected: self.entries.len(),
                got: new_entries.len(),
            });
        }
        self.entries = new_entries;
        Ok(())
    }

    /// Number of cached entries (constant across blocks)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty (never true for a constructed cache)
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total approximate bytes held by the cache
    pub fn approx_bytes(&self) -> usize {
        self.entries.iter().map(BlockArgs::approx_bytes).sum()
    }

    /// Consume the cache, returning the final entries
    pub fn into_entries(self) -> Vec<BlockArgs> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn entries(n: usize) -> Vec<BlockArgs> {
        (0..n)
            .map(|i| BlockArgs::causal(Array2::from_elem((2, 4), i as f32)))
            .collect()
    }

    #[test]
    fn test_empty_rejected() {
        assert!(BlockInputCache::new(Vec::new()).is_err());
    }

    #[test]
    fn test_set_replaces_whole_contents() {
        let mut cache = BlockInputCache::new(entries(3)).unwrap();
        cache.set(entries(3)).unwrap();
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_cardinality_change_is_fatal() {
        let mut cache = BlockInputCache::new(entries(3)).unwrap();
        let err = cache.set(entries(2)).unwrap_err();
        assert!(matches!(
            err,
            Error::CacheCardinality {
                expected: 3,
                got: 2
            }
        ));
        // Failed replacement leaves the cache untouched
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_order_preserved() {
        let mut cache = BlockInputCache::new(entries(4)).unwrap();
        cache.set(entries(4)).unwrap();
        for (i, e) in cache.get().iter().enumerate() {
            assert_eq!(e.hidden[[0, 0]], i as f32);
        }
    }
}
