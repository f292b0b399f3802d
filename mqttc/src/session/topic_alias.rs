//! Client-to-server topic alias mapping.
//!
//! Each record holds the topic name as payload. The metadata extra carries
//! the alias, an xxh32 hash of the topic and whether the mapping has been
//! announced to the server on the current connection. Lookups go through
//! two AVL indexes, by hash and by alias.

use std::path::Path;

use tracing::trace;
use xxhash_rust::xxh32::xxh32;

use crate::error::{Error, Result};
use crate::store::metadata::{read_u16, read_u32};
use crate::store::{
    AvlTree, Database, DatabaseOptions, IndexingService, Metadata, MetadataExtra, MetadataFlags,
    SlotPolicy, State, StoreFileOptions,
};

/// Index key for `topic`. Collisions are resolved by name.
fn topic_hash(topic: &str) -> u32 {
    xxh32(topic.as_bytes(), 0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AliasExtra {
    pub hash: u32,
    pub alias: u16,
    pub sent: bool,
}

impl MetadataExtra for AliasExtra {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hash.to_be_bytes());
        out.extend_from_slice(&self.alias.to_be_bytes());
        out.push(self.sent as u8);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        let hash = read_u32(buf)?;
        let alias = read_u16(buf)?;
        let Some((&sent, rest)) = buf.split_first() else {
            return Err(Error::StoreCorrupted("truncated alias extra".to_string()));
        };
        *buf = rest;
        Ok(Self {
            hash,
            alias,
            sent: sent != 0,
        })
    }
}

#[derive(Debug, Default)]
pub struct AliasIndex {
    by_hash: AvlTree<u32, usize>,
    by_alias: AvlTree<u16, usize>,
}

impl IndexingService<AliasExtra> for AliasIndex {
    fn index(&mut self, metadata: &Metadata<AliasExtra>) {
        self.by_hash.insert(metadata.extra.hash, metadata.index, false);
        self.by_alias.insert(metadata.extra.alias, metadata.index, true);
    }

    fn remove(&mut self, metadata: &Metadata<AliasExtra>) {
        self.by_hash.remove_value(&metadata.extra.hash, &metadata.index);
        self.by_alias.remove_value(&metadata.extra.alias, &metadata.index);
    }

    fn clear(&mut self) {
        self.by_hash.clear();
        self.by_alias.clear();
    }
}

type AliasState = State<String, AliasExtra, AliasIndex>;

fn slot_by_alias(state: &AliasState, alias: u16) -> Option<usize> {
    state
        .index()
        .by_alias
        .find(&alias)
        .and_then(|slots| slots.first().copied())
}

/// Slot and extra of the record for `topic`. Hash collisions are resolved
/// by comparing the stored names.
fn find_topic(state: &AliasState, topic: &str) -> Result<Option<(usize, AliasExtra)>> {
    let hash = topic_hash(topic);
    let Some(slots) = state.index().by_hash.find(&hash) else {
        return Ok(None);
    };
    for &slot in slots {
        if state.load(slot)? == topic {
            if let Some(metadata) = state.metadata(slot) {
                return Ok(Some((slot, metadata.extra)));
            }
        }
    }
    Ok(None)
}

/// Topic aliases the client has assigned for its own PUBLISH packets.
pub struct TopicAliasStore {
    db: Database<String, AliasExtra, AliasIndex>,
}

impl TopicAliasStore {
    pub fn open(parent: Option<&Path>, name: &str, files: &StoreFileOptions) -> Result<Self> {
        let options = DatabaseOptions::new(name, SlotPolicy::ReuseDeleted)
            .with_hash_file(false)
            .with_files(files.clone());
        Ok(Self {
            db: Database::open(parent, options)?,
        })
    }

    /// Alias for `topic`, allocating the smallest free alias in
    /// `[1, alias_maximum]` if the topic has none.
    pub fn add(&self, topic: &str, alias_maximum: u16) -> Result<u16> {
        self.db.write(|state| {
            if let Some((_, extra)) = find_topic(state, topic)? {
                return Ok(extra.alias);
            }
            let Some(alias) = (1..=alias_maximum).find(|a| slot_by_alias(state, *a).is_none()) else {
                return Err(Error::TopicAliasExhausted(alias_maximum));
            };
            let extra = AliasExtra {
                hash: topic_hash(topic),
                alias,
                sent: false,
            };
            state.insert(&topic.to_string(), MetadataFlags::NONE, extra)?;
            trace!("topic alias {} -> {}", alias, topic);
            Ok(alias)
        })
    }

    /// Map `alias` to `topic`, replacing whatever either was mapped to.
    pub fn set(&self, alias: u16, topic: &str) -> Result<()> {
        if alias == 0 {
            return Err(Error::InvalidArgument("topic alias 0".to_string()));
        }
        self.db.write(|state| {
            if let Some(slot) = slot_by_alias(state, alias) {
                state.delete(slot)?;
            }
            if let Some((slot, _)) = find_topic(state, topic)? {
                state.delete(slot)?;
            }
            let extra = AliasExtra {
                hash: topic_hash(topic),
                alias,
                sent: false,
            };
            state.insert(&topic.to_string(), MetadataFlags::NONE, extra)?;
            Ok(())
        })
    }

    pub fn find_by_alias(&self, alias: u16) -> Result<Option<String>> {
        self.db.read(|state| match slot_by_alias(state, alias) {
            Some(slot) => Ok(Some(state.load(slot)?)),
            None => Ok(None),
        })
    }

    /// Alias of `topic` and whether it has been sent to the server.
    pub fn find_by_topic(&self, topic: &str) -> Result<Option<(u16, bool)>> {
        self.db.read(|state| {
            Ok(find_topic(state, topic)?.map(|(_, extra)| (extra.alias, extra.sent)))
        })
    }

    /// Record whether the mapping for `alias` has been announced.
    pub fn set_sent(&self, alias: u16, sent: bool) -> bool {
        self.db.write(|state| match slot_by_alias(state, alias) {
            Some(slot) => state.update_extra(slot, |extra| extra.sent = sent),
            None => false,
        })
    }

    pub fn remove(&self, alias: u16) -> Result<bool> {
        self.db.write(|state| match slot_by_alias(state, alias) {
            Some(slot) => state.delete(slot),
            None => Ok(false),
        })
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

    fn store() -> TopicAliasStore {
        TopicAliasStore::open(None, "ClientTopicAliasMapping", &StoreFileOptions::default()).unwrap()
    }

    #[test]
    fn test_topic_hash_collision_resolved_by_name() {
        let aliases = store();
        assert_eq!(aliases.add("sensors/temp", 10).unwrap(), 1);
        assert_eq!(aliases.add("sensors/temq", 10).unwrap(), 2);
        assert_eq!(topic_hash("sensors/temp"), topic_hash("sensors/temp"));
        assert_ne!(topic_hash("sensors/temp"), topic_hash("sensors/temq"));

        // Two names forced under one index key still resolve separately.
        aliases.db.write(|state| {
            let slot = slot_by_alias(state, 1).unwrap();
            assert!(state.update_extra(slot, |extra| extra.hash = topic_hash("sensors/temq")));
        });
        assert_eq!(aliases.find_by_topic("sensors/temq").unwrap(), Some((2, false)));
        assert_eq!(aliases.find_by_topic("sensors/temp").unwrap(), None);
    }

    #[test]
    fn test_add_allocates_smallest_free() {
        let aliases = store();
        assert_eq!(aliases.add("a", 3).unwrap(), 1);
        assert_eq!(aliases.add("b", 3).unwrap(), 2);
        assert_eq!(aliases.add("a", 3).unwrap(), 1);
        assert_eq!(aliases.add("c", 3).unwrap(), 3);
        assert!(matches!(aliases.add("d", 3), Err(Error::TopicAliasExhausted(3))));

        aliases.remove(2).unwrap();
        assert_eq!(aliases.add("d", 3).unwrap(), 2);
        assert_eq!(aliases.count(), 3);
    }

    #[test]
    fn test_set_overwrites() {
        let aliases = store();
        aliases.set(4, "x/y").unwrap();
        assert_eq!(aliases.find_by_alias(4).unwrap().as_deref(), Some("x/y"));

        aliases.set(4, "x/z").unwrap();
        assert_eq!(aliases.find_by_alias(4).unwrap().as_deref(), Some("x/z"));
        assert_eq!(aliases.find_by_topic("x/y").unwrap(), None);

        aliases.set(5, "x/z").unwrap();
        assert_eq!(aliases.find_by_alias(4).unwrap(), None);
        assert_eq!(aliases.find_by_topic("x/z").unwrap(), Some((5, false)));
        assert!(aliases.set(0, "x").is_err());
    }

    #[test]
    fn test_sent_flag() {
        let aliases = store();
        let alias = aliases.add("sensors/temp", 10).unwrap();
        assert_eq!(aliases.find_by_topic("sensors/temp").unwrap(), Some((alias, false)));
        assert!(aliases.set_sent(alias, true));
        assert_eq!(aliases.find_by_topic("sensors/temp").unwrap(), Some((alias, true)));
        assert!(!aliases.set_sent(99, true));
    }

    #[test]
    fn test_reopen_keeps_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFileOptions::default();
        {
            let aliases = TopicAliasStore::open(Some(dir.path()), "ClientTopicAliasMapping", &files).unwrap();
            aliases.add("a/b", 5).unwrap();
            let alias = aliases.add("c/d", 5).unwrap();
            aliases.set_sent(alias, true);
            aliases.save().unwrap();
        }
        let aliases = TopicAliasStore::open(Some(dir.path()), "ClientTopicAliasMapping", &files).unwrap();
        assert_eq!(aliases.find_by_topic("a/b").unwrap(), Some((1, false)));
        assert_eq!(aliases.find_by_topic("c/d").unwrap(), Some((2, true)));
        assert!(!dir.path().join("ClientTopicAliasMapping/ClientTopicAliasMapping.hash").exists());
    }
}
