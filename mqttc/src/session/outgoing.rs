//! Durable store of outgoing QoS 1/2 PUBLISH packets keyed by packet id.

use std::path::Path;

use bytes::BytesMut;
use rumqttc::v5::mqttbytes::v5 as wire5;
use tracing::{error, trace};

use crate::error::{Error, Result};
use crate::protocol::Publish;
use crate::store::metadata::read_u16;
use crate::store::{
    AvlTree, Database, DatabaseOptions, IndexingService, Metadata, MetadataExtra, MetadataFlags,
    RecordContent, SlotPolicy, StoreFileOptions,
};

/// Stored packets are kept in their MQTT 5.0 wire form regardless of the
/// negotiated version.
impl RecordContent for Publish {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.size());
        wire5::Packet::Publish(self.clone()).write(&mut buf, None)?;
        Ok(buf.to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(bytes);
        match wire5::Packet::read(&mut buf, None)? {
            wire5::Packet::Publish(publish) => Ok(publish),
            other => Err(Error::StoreCorrupted(format!(
                "expected a stored PUBLISH, found {:?}",
                other
            ))),
        }
    }
}

/// Packet identifier stored with each record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketIdExtra {
    pub packet_id: u16,
}

impl MetadataExtra for PacketIdExtra {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.packet_id.to_be_bytes());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            packet_id: read_u16(buf)?,
        })
    }
}

/// Record slots by packet id. A packet id maps to at most one slot.
#[derive(Debug, Default)]
pub struct PacketIdIndex {
    tree: AvlTree<u16, usize>,
}

impl PacketIdIndex {
    pub fn find(&self, packet_id: u16) -> Option<usize> {
        self.tree.find(&packet_id).and_then(|slots| slots.first().copied())
    }

    /// Smallest packet id strictly greater than `after`, with its slot.
    pub fn next_after(&self, after: u16) -> Option<(u16, usize)> {
        self.tree
            .find_next(&after)
            .and_then(|(id, slots)| slots.first().map(|slot| (*id, *slot)))
    }
}

impl IndexingService<PacketIdExtra> for PacketIdIndex {
    fn index(&mut self, metadata: &Metadata<PacketIdExtra>) {
        self.tree.insert(metadata.extra.packet_id, metadata.index, true);
    }

    fn remove(&mut self, metadata: &Metadata<PacketIdExtra>) {
        self.tree.remove_value(&metadata.extra.packet_id, &metadata.index);
    }

    fn clear(&mut self) {
        self.tree.clear();
    }
}

type Inner = Database<Publish, PacketIdExtra, PacketIdIndex>;

/// FIFO store of PUBLISH packets awaiting acknowledgement or quota.
pub struct OutgoingPacketStore {
    db: Inner,
}

impl OutgoingPacketStore {
    pub fn open(parent: Option<&Path>, name: &str, files: &StoreFileOptions) -> Result<Self> {
        let options = DatabaseOptions::new(name, SlotPolicy::AppendOnly).with_files(files.clone());
        Ok(Self {
            db: Database::open(parent, options)?,
        })
    }

    /// Store `packet` under `packet_id`.
    pub fn add(&self, packet_id: u16, packet: &Publish) -> Result<()> {
        if packet_id == 0 {
            return Err(Error::InvalidArgument("packet id 0".to_string()));
        }
        self.db.write(|state| {
            if state.index().find(packet_id).is_some() {
                return Err(Error::InvalidArgument(format!(
                    "{}: packet id {} already stored",
                    self.db.name(),
                    packet_id
                )));
            }
            state.insert(packet, MetadataFlags::NONE, PacketIdExtra { packet_id })?;
            trace!("{}: added packet {}", self.db.name(), packet_id);
            Ok(())
        })
    }

    /// Overwrite the packet stored under `packet_id`. Returns false when no
    /// packet has that id.
    pub fn replace(&self, packet_id: u16, packet: &Publish) -> Result<bool> {
        self.db.write(|state| {
            let Some(slot) = state.index().find(packet_id) else {
                return Ok(false);
            };
            if !state.delete(slot)? {
                return Ok(false);
            }
            state.insert(packet, MetadataFlags::NONE, PacketIdExtra { packet_id })?;
            Ok(true)
        })
    }

    /// Remove the packet stored under `packet_id`, if any.
    pub fn try_remove_by_packet_id(&self, packet_id: u16) -> Result<bool> {
        self.db.write(|state| match state.index().find(packet_id) {
            Some(slot) => state.delete(slot),
            None => Ok(false),
        })
    }

    /// Remove and return the oldest stored packet. Records carrying packet
    /// id 0 are dropped with an error log.
    pub fn try_dequeue(&self) -> Result<Option<(u16, Publish)>> {
        self.db.write(|state| loop {
            let Some((slot, packet_id)) = state
                .records()
                .next()
                .map(|m| (m.index, m.extra.packet_id))
            else {
                return Ok(None);
            };
            if packet_id == 0 {
                error!("{}: dropping record {} with packet id 0", self.db.name(), slot);
                state.delete(slot)?;
                continue;
            }
            let packet = match state.load(slot) {
                Ok(packet) => packet,
                Err(e) => {
                    error!("{}: dropping unreadable packet {}: {}", self.db.name(), packet_id, e);
                    state.delete(slot)?;
                    return Err(e);
                }
            };
            state.delete(slot)?;
            return Ok(Some((packet_id, packet)));
        })
    }

    /// The stored packet with the smallest id strictly greater than `after`.
    pub fn get_next(&self, after: u16) -> Result<Option<(u16, Publish)>> {
        self.db.read(|state| match state.index().next_after(after) {
            Some((packet_id, slot)) => Ok(Some((packet_id, state.load(slot)?))),
            None => Ok(None),
        })
    }

    pub fn get(&self, packet_id: u16) -> Result<Option<Publish>> {
        self.db.read(|state| match state.index().find(packet_id) {
            Some(slot) => Ok(Some(state.load(slot)?)),
            None => Ok(None),
        })
    }

    pub fn is_packet_id_in_use(&self, packet_id: u16) -> bool {
        self.db.read(|state| state.index().find(packet_id).is_some())
    }

    /// Stored packet ids, oldest first.
    pub fn packet_ids(&self) -> Vec<u16> {
        self.db
            .read(|state| state.records().map(|m| m.extra.packet_id).collect())
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

    pub fn verify_hash(&self) -> Result<bool> {
        self.db.verify_hash()
    }

    pub fn delete_files(&self) -> Result<()> {
        self.db.delete_files()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;

    fn publish(topic: &str, pkid: u16) -> Publish {
        let mut p = Publish::new(topic, QoS::AtLeastOnce, format!("payload-{}", pkid), None);
        p.pkid = pkid;
        p
    }

    fn memory_store() -> OutgoingPacketStore {
        OutgoingPacketStore::open(None, "UnacknowledgedPackets", &StoreFileOptions::default()).unwrap()
    }

    #[test]
    fn test_dequeue_is_fifo() {
        let store = memory_store();
        for id in [30u16, 10, 20] {
            store.add(id, &publish("a", id)).unwrap();
        }
        let order: Vec<u16> = std::iter::from_fn(|| store.try_dequeue().unwrap().map(|(id, _)| id)).collect();
        assert_eq!(order, vec![30, 10, 20]);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_get_next_ascending() {
        let store = memory_store();
        for id in [30u16, 10, 20] {
            store.add(id, &publish("a", id)).unwrap();
        }
        let mut after = 0;
        let mut seen = Vec::new();
        while let Some((id, packet)) = store.get_next(after).unwrap() {
            assert_eq!(packet.pkid, id);
            seen.push(id);
            after = id;
        }
        assert_eq!(seen, vec![10, 20, 30]);
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn test_remove_and_in_use() {
        let store = memory_store();
        store.add(5, &publish("a", 5)).unwrap();
        assert!(store.is_packet_id_in_use(5));
        assert!(store.add(5, &publish("a", 5)).is_err());
        assert!(store.add(0, &publish("a", 0)).is_err());

        assert!(store.try_remove_by_packet_id(5).unwrap());
        assert!(!store.try_remove_by_packet_id(5).unwrap());
        assert!(!store.is_packet_id_in_use(5));
    }

    #[test]
    fn test_persisted_packets_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFileOptions::default();
        {
            let store = OutgoingPacketStore::open(Some(dir.path()), "QueuedPackets", &files).unwrap();
            store.add(1, &publish("x/y", 1)).unwrap();
            store.add(2, &publish("x/z", 2)).unwrap();
            store.try_remove_by_packet_id(1).unwrap();
            store.save().unwrap();
        }

        let store = OutgoingPacketStore::open(Some(dir.path()), "QueuedPackets", &files).unwrap();
        assert_eq!(store.packet_ids(), vec![2]);
        let packet = store.get(2).unwrap().unwrap();
        assert_eq!(packet.topic, "x/z".as_bytes());
        assert_eq!(packet.payload, "payload-2".as_bytes());
        assert!(store.verify_hash().unwrap());
    }

    #[test]
    fn test_dequeue_skips_packet_id_zero() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFileOptions::default();
        {
            let store = OutgoingPacketStore::open(Some(dir.path()), "QueuedPackets", &files).unwrap();
            for id in [5u16, 6, 7] {
                store.add(id, &publish("q", id)).unwrap();
            }
            store.save().unwrap();
        }

        // Rewrite the second record's packet id to 0.
        let path = dir.path().join("QueuedPackets").join(format!("QueuedPackets.{}", files.metadata_extension));
        let bytes = std::fs::read(&path).unwrap();
        let mut buf = &bytes[..];
        let mut rewritten = Vec::new();
        let mut slot = 0;
        while !buf.is_empty() {
            let mut entry = Metadata::<PacketIdExtra>::decode(slot, &mut buf).unwrap();
            if slot == 1 {
                entry.extra.packet_id = 0;
            }
            entry.encode(&mut rewritten);
            slot += 1;
        }
        std::fs::write(&path, rewritten).unwrap();

        let store = OutgoingPacketStore::open(Some(dir.path()), "QueuedPackets", &files).unwrap();
        assert_eq!(store.packet_ids(), vec![5, 0, 7]);
        let order: Vec<u16> = std::iter::from_fn(|| store.try_dequeue().unwrap().map(|(id, _)| id)).collect();
        assert_eq!(order, vec![5, 7]);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_replace_keeps_packet_id() {
        let store = memory_store();
        store.add(3, &publish("a", 3)).unwrap();
        store.add(4, &publish("b", 4)).unwrap();

        assert!(store.replace(3, &publish("c", 3)).unwrap());
        assert!(!store.replace(9, &publish("c", 9)).unwrap());
        assert_eq!(store.count(), 2);
        assert_eq!(store.get(3).unwrap().unwrap().topic, "c".as_bytes());
        assert_eq!(store.get_next(0).unwrap().map(|(id, _)| id), Some(3));
    }
}
