//! Durable set of packet identifiers.

use std::path::Path;

use crate::error::Result;
use crate::store::metadata::read_u16;
use crate::store::{
    AvlTree, Database, DatabaseOptions, IndexingService, Metadata, MetadataExtra, MetadataFlags,
    SlotPolicy, StoreFileOptions,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketIdValue {
    pub value: u16,
}

impl MetadataExtra for PacketIdValue {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value.to_be_bytes());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            value: read_u16(buf)?,
        })
    }
}

#[derive(Debug, Default)]
pub struct ValueIndex {
    tree: AvlTree<u16, usize>,
}

impl ValueIndex {
    fn find(&self, value: u16) -> Option<usize> {
        self.tree.find(&value).and_then(|slots| slots.first().copied())
    }
}

impl IndexingService<PacketIdValue> for ValueIndex {
    fn index(&mut self, metadata: &Metadata<PacketIdValue>) {
        self.tree.insert(metadata.extra.value, metadata.index, true);
    }

    fn remove(&mut self, metadata: &Metadata<PacketIdValue>) {
        self.tree.remove_value(&metadata.extra.value, &metadata.index);
    }

    fn clear(&mut self) {
        self.tree.clear();
    }
}

/// Packet ids of QoS 2 exchanges that are in their second phase, either
/// received (PUBREC sent) or released (PUBREL sent).
pub struct PacketIdSet {
    db: Database<(), PacketIdValue, ValueIndex>,
}

impl PacketIdSet {
    pub fn open(parent: Option<&Path>, name: &str, files: &StoreFileOptions) -> Result<Self> {
        let options = DatabaseOptions::new(name, SlotPolicy::ReuseDeleted).with_files(files.clone());
        Ok(Self {
            db: Database::open(parent, options)?,
        })
    }

    /// Insert `packet_id`. Returns false if it was already present.
    pub fn add(&self, packet_id: u16) -> Result<bool> {
        self.db.write(|state| {
            if state.index().find(packet_id).is_some() {
                return Ok(false);
            }
            state.insert(&(), MetadataFlags::NONE, PacketIdValue { value: packet_id })?;
            Ok(true)
        })
    }

    /// Remove `packet_id`. Returns false if it was absent.
    pub fn remove(&self, packet_id: u16) -> Result<bool> {
        self.db.write(|state| match state.index().find(packet_id) {
            Some(slot) => state.delete(slot),
            None => Ok(false),
        })
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.db.read(|state| state.index().find(packet_id).is_some())
    }

    /// Smallest member strictly greater than `after`.
    pub fn get_next(&self, after: u16) -> Option<u16> {
        self.db
            .read(|state| state.index().tree.find_next(&after).map(|(id, _)| *id))
    }

    /// All members in ascending order.
    pub fn values(&self) -> Vec<u16> {
        let mut values = Vec::new();
        let mut after = 0;
        while let Some(id) = self.get_next(after) {
            values.push(id);
            after = id;
        }
        values
    }

    pub fn count(&self) -> usize {
        self.db.count()
    }

    pub fn clear(&self) -> Result<usize> {
        self.db.clear(false)
    }

    pub fn save(&self) -> Result<()> {
        self.db.save()
    }

    pub fn delete_files(&self) -> Result<()> {
        self.db.delete_files()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_contains() {
        let set = PacketIdSet::open(None, "PublishReceivedPacketIDs", &StoreFileOptions::default()).unwrap();
        assert!(set.add(7).unwrap());
        assert!(!set.add(7).unwrap());
        assert_eq!(set.count(), 1);
        assert!(set.contains(7));

        assert!(set.remove(7).unwrap());
        assert!(!set.remove(7).unwrap());
        assert!(!set.contains(7));
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn test_values_ascending() {
        let set = PacketIdSet::open(None, "PublishReleasedPacketIDs", &StoreFileOptions::default()).unwrap();
        for id in [900u16, 3, 65535, 41] {
            set.add(id).unwrap();
        }
        set.remove(41).unwrap();
        set.add(2).unwrap();
        assert_eq!(set.values(), vec![2, 3, 900, 65535]);
        assert_eq!(set.get_next(3), Some(900));
        assert_eq!(set.get_next(65535), None);
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFileOptions::default();
        {
            let set = PacketIdSet::open(Some(dir.path()), "PublishReleasedPacketIDs", &files).unwrap();
            set.add(10).unwrap();
            set.add(11).unwrap();
            set.remove(10).unwrap();
            set.add(12).unwrap();
            set.save().unwrap();
        }
        let set = PacketIdSet::open(Some(dir.path()), "PublishReleasedPacketIDs", &files).unwrap();
        assert_eq!(set.values(), vec![11, 12]);
    }
}
