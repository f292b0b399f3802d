//! Secondary indexes maintained alongside a record store.

use super::avl::AvlTree;
use super::metadata::{Metadata, MetadataFlags};

/// Keeps a secondary index in step with a store's live records.
pub trait IndexingService<E>: Default + Send + Sync + 'static {
    /// Add a live record.
    fn index(&mut self, metadata: &Metadata<E>);

    /// Remove a record previously passed to [`index`](Self::index).
    fn remove(&mut self, metadata: &Metadata<E>);

    fn clear(&mut self);
}

impl<E> IndexingService<E> for () {
    fn index(&mut self, _metadata: &Metadata<E>) {}

    fn remove(&mut self, _metadata: &Metadata<E>) {}

    fn clear(&mut self) {}
}

/// Record slots keyed by each individual flag bit.
///
/// A record carrying `NONE | LOCKED` is stored under both bits, so a query
/// for any flag combination is a union of single-bit lookups.
#[derive(Debug, Default)]
pub struct FlagIndex {
    tree: AvlTree<u8, usize>,
}

impl FlagIndex {
    pub fn index(&mut self, index: usize, flags: MetadataFlags) {
        for bit in flags.iter() {
            self.tree.insert(bit.bits(), index, false);
        }
    }

    pub fn remove(&mut self, index: usize, flags: MetadataFlags) {
        for bit in flags.iter() {
            self.tree.remove_value(&bit.bits(), &index);
        }
    }

    /// Slots carrying at least one of the bits in `flags`, ascending.
    pub fn find_by_flags(&self, flags: MetadataFlags) -> Vec<usize> {
        let mut out: Vec<usize> = flags
            .iter()
            .filter_map(|bit| self.tree.find(&bit.bits()))
            .flatten()
            .copied()
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn clear(&mut self) {
        self.tree.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_index_per_bit() {
        let mut index = FlagIndex::default();
        index.index(0, MetadataFlags::NONE);
        index.index(1, MetadataFlags::NONE | MetadataFlags::LOCKED);
        index.index(2, MetadataFlags::NONE | MetadataFlags::USER_ADDED);

        assert_eq!(index.find_by_flags(MetadataFlags::NONE), vec![0, 1, 2]);
        assert_eq!(index.find_by_flags(MetadataFlags::LOCKED), vec![1]);
        assert_eq!(
            index.find_by_flags(MetadataFlags::LOCKED | MetadataFlags::USER_ADDED),
            vec![1, 2]
        );

        index.remove(1, MetadataFlags::NONE | MetadataFlags::LOCKED);
        assert_eq!(index.find_by_flags(MetadataFlags::NONE), vec![0, 2]);
        assert!(index.find_by_flags(MetadataFlags::LOCKED).is_empty());
    }
}
