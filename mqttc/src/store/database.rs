//! Generic record store: metadata list, payload area and indexes.

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use super::StoreFileOptions;
use super::disk::DiskManager;
use super::index::{FlagIndex, IndexingService};
use super::metadata::{Metadata, MetadataExtra, MetadataFlags};
use crate::error::{Error, Result};

/// Payload encoding of a record type.
pub trait RecordContent: Sized + Send + Sync + 'static {
    fn encode(&self) -> Result<Vec<u8>>;

    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Records whose meaning lives entirely in their metadata.
impl RecordContent for () {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn decode(_bytes: &[u8]) -> Result<Self> {
        Ok(())
    }
}

impl RecordContent for String {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::StoreCorrupted(format!("record is not utf-8: {}", e)))
    }
}

/// How a store picks the slot for a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPolicy {
    /// Always append; slot order is insertion order.
    AppendOnly,
    /// Fill the lowest deleted slot first.
    ReuseDeleted,
}

/// Construction parameters of a [`Database`].
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Store name, used for its directory and file stems.
    pub name: String,
    pub slot_policy: SlotPolicy,
    /// Write an xxh64 digest of the payload area on save.
    pub use_hash_file: bool,
    pub files: StoreFileOptions,
}

impl DatabaseOptions {
    pub fn new(name: impl Into<String>, slot_policy: SlotPolicy) -> Self {
        Self {
            name: name.into(),
            slot_policy,
            use_hash_file: true,
            files: StoreFileOptions::default(),
        }
    }

    pub fn with_hash_file(mut self, enabled: bool) -> Self {
        self.use_hash_file = enabled;
        self
    }

    pub fn with_files(mut self, files: StoreFileOptions) -> Self {
        self.files = files;
        self
    }
}

#[derive(Debug, Clone)]
struct StorePaths {
    dir: PathBuf,
    data: PathBuf,
    free_list: PathBuf,
    metadata: PathBuf,
    hash: PathBuf,
}

impl StorePaths {
    fn new(parent: &Path, options: &DatabaseOptions) -> Self {
        let dir = parent.join(&options.name);
        let file = |ext: &str| dir.join(format!("{}.{}", options.name, ext));
        Self {
            data: file(&options.files.data_extension),
            free_list: file(&options.files.free_list_extension),
            metadata: file(&options.files.metadata_extension),
            hash: file(&options.files.hash_extension),
            dir,
        }
    }
}

/// The mutable content of a store, reachable only through its lock.
pub struct State<C, E, X> {
    metadata: Vec<Metadata<E>>,
    disk: DiskManager,
    index: X,
    flags: FlagIndex,
    policy: SlotPolicy,
    live: usize,
    dirty: bool,
    _content: PhantomData<fn() -> C>,
}

impl<C, E, X> State<C, E, X>
where
    C: RecordContent,
    E: MetadataExtra,
    X: IndexingService<E>,
{
    fn new(disk: DiskManager, policy: SlotPolicy) -> Self {
        Self {
            metadata: Vec::new(),
            disk,
            index: X::default(),
            flags: FlagIndex::default(),
            policy,
            live: 0,
            dirty: false,
            _content: PhantomData,
        }
    }

    /// Store a record and return its slot.
    pub fn insert(&mut self, content: &C, flags: MetadataFlags, extra: E) -> Result<usize> {
        let bytes = content.encode()?;
        let length = i32::try_from(bytes.len())
            .map_err(|_| Error::InvalidArgument(format!("record of {} bytes", bytes.len())))?;
        let position = if bytes.is_empty() {
            0
        } else {
            let position = self.disk.append(&bytes)?;
            i32::try_from(position)
                .map_err(|_| Error::StoreCorrupted(format!("payload area exceeds {} bytes", i32::MAX)))?
        };

        let slot = match self.policy {
            SlotPolicy::ReuseDeleted => self.metadata.iter().position(Metadata::is_deleted),
            SlotPolicy::AppendOnly => None,
        };
        let slot = slot.unwrap_or(self.metadata.len());

        let metadata = Metadata::new(slot, position, length, flags | MetadataFlags::NONE, extra);
        self.flags.index(slot, metadata.flags);
        self.index.index(&metadata);
        if slot == self.metadata.len() {
            self.metadata.push(metadata);
        } else {
            self.metadata[slot] = metadata;
        }
        self.live += 1;
        self.dirty = true;
        trace!("store: inserted slot {} ({} bytes)", slot, length);
        Ok(slot)
    }

    /// Read the payload of a live record.
    pub fn load(&self, slot: usize) -> Result<C> {
        let metadata = self
            .metadata(slot)
            .ok_or_else(|| Error::InvalidArgument(format!("no record in slot {}", slot)))?;
        let bytes = self
            .disk
            .read(metadata.file_position as u64, metadata.length as u64)?;
        C::decode(&bytes)
    }

    /// Delete a live record. Locked and missing records are left alone.
    pub fn delete(&mut self, slot: usize) -> Result<bool> {
        let Some(metadata) = self.metadata(slot) else {
            return Ok(false);
        };
        if metadata.is_locked() {
            debug!("store: slot {} is locked, not deleting", slot);
            return Ok(false);
        }

        let metadata = metadata.clone();
        self.disk
            .free(metadata.file_position as u64, metadata.length as u64)?;
        self.flags.remove(slot, metadata.flags);
        self.index.remove(&metadata);
        self.metadata[slot].mark_for_delete();
        self.live -= 1;
        self.dirty = true;

        while self.metadata.last().is_some_and(Metadata::is_deleted) {
            self.metadata.pop();
        }
        Ok(true)
    }

    /// Metadata of a live record.
    pub fn metadata(&self, slot: usize) -> Option<&Metadata<E>> {
        self.metadata.get(slot).filter(|m| !m.is_deleted())
    }

    /// Change the extra fields of a live record, keeping the index in step.
    pub fn update_extra(&mut self, slot: usize, update: impl FnOnce(&mut E)) -> bool {
        let Some(metadata) = self.metadata.get(slot).filter(|m| !m.is_deleted()) else {
            return false;
        };
        let before = metadata.clone();
        self.index.remove(&before);
        let metadata = &mut self.metadata[slot];
        update(&mut metadata.extra);
        self.index.index(metadata);
        self.dirty = true;
        true
    }

    /// Set or clear a modifier flag of a live record.
    pub fn set_flag(&mut self, slot: usize, flag: MetadataFlags, on: bool) -> bool {
        let Some(metadata) = self.metadata.get_mut(slot).filter(|m| !m.is_deleted()) else {
            return false;
        };
        self.flags.remove(slot, metadata.flags);
        metadata.set_flag(flag, on);
        self.flags.index(slot, metadata.flags);
        self.dirty = true;
        true
    }

    /// Secondary index of this store.
    pub fn index(&self) -> &X {
        &self.index
    }

    /// Live slots carrying any bit of `flags`, ascending.
    pub fn find_by_flags(&self, flags: MetadataFlags) -> Vec<usize> {
        self.flags.find_by_flags(flags)
    }

    /// Live records in slot order.
    pub fn records(&self) -> impl Iterator<Item = &Metadata<E>> {
        self.metadata.iter().filter(|m| !m.is_deleted())
    }

    pub fn count(&self) -> usize {
        self.live
    }

    /// Number of metadata slots, including deleted ones still reserved.
    pub fn slot_count(&self) -> usize {
        self.metadata.len()
    }

    fn load_metadata(&mut self, mut buf: &[u8]) -> Result<()> {
        let mut slot = 0;
        while !buf.is_empty() {
            let mut metadata = Metadata::<E>::decode(slot, &mut buf)?;
            if !metadata.is_deleted() {
                let in_bounds = metadata.file_position >= 0
                    && metadata.length >= 0
                    && (metadata.file_position as u64 + metadata.length as u64) <= self.disk.len();
                if in_bounds {
                    self.flags.index(slot, metadata.flags);
                    self.index.index(&metadata);
                    self.live += 1;
                } else {
                    error!("store: skipping corrupt record {}", metadata);
                    metadata.mark_for_delete();
                    self.dirty = true;
                }
            }
            self.metadata.push(metadata);
            slot += 1;
        }
        while self.metadata.last().is_some_and(Metadata::is_deleted) {
            self.metadata.pop();
        }
        Ok(())
    }
}

/// A record store guarded by one read/write lock.
///
/// Every public operation holds the lock for its whole duration. Compound
/// operations of the typed stores go through [`read`](Self::read) and
/// [`write`](Self::write).
pub struct Database<C, E, X> {
    options: DatabaseOptions,
    paths: Option<StorePaths>,
    state: RwLock<State<C, E, X>>,
}

impl<C, E, X> Database<C, E, X>
where
    C: RecordContent,
    E: MetadataExtra,
    X: IndexingService<E>,
{
    /// Open the store under `parent`, or in memory when `parent` is `None`.
    pub fn open(parent: Option<&Path>, options: DatabaseOptions) -> Result<Self> {
        let Some(parent) = parent else {
            let state = State::new(DiskManager::memory(), options.slot_policy);
            return Ok(Self {
                options,
                paths: None,
                state: RwLock::new(state),
            });
        };

        let paths = StorePaths::new(parent, &options);
        fs::create_dir_all(&paths.dir)?;
        let mut state = State::new(DiskManager::open(&paths.data)?, options.slot_policy);

        if let Some(bytes) = read_optional(&paths.metadata)? {
            state.load_metadata(&bytes)?;
        }
        if let Some(bytes) = read_optional(&paths.free_list)? {
            if let Err(e) = state.disk.load_free_list(&bytes) {
                warn!("store {}: ignoring free list: {}", options.name, e);
            }
        }
        debug!(
            "store {}: opened {} records from {}",
            options.name,
            state.count(),
            paths.dir.display()
        );

        Ok(Self {
            options,
            paths: Some(paths),
            state: RwLock::new(state),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn is_persistent(&self) -> bool {
        self.paths.is_some()
    }

    /// Run `f` under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&State<C, E, X>) -> R) -> R {
        f(&self.state.read())
    }

    /// Run `f` under the write lock.
    pub fn write<R>(&self, f: impl FnOnce(&mut State<C, E, X>) -> R) -> R {
        f(&mut self.state.write())
    }

    pub fn insert(&self, content: &C, flags: MetadataFlags, extra: E) -> Result<usize> {
        self.state.write().insert(content, flags, extra)
    }

    pub fn load(&self, slot: usize) -> Result<C> {
        self.state.read().load(slot)
    }

    pub fn delete(&self, slot: usize) -> Result<bool> {
        self.state.write().delete(slot)
    }

    pub fn count(&self) -> usize {
        self.state.read().count()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    /// Delete every record that is not locked, keeping user-added records
    /// too when `keep_user_added` is set. Returns the number deleted.
    pub fn clear(&self, keep_user_added: bool) -> Result<usize> {
        let mut state = self.state.write();
        let candidates: Vec<usize> = state
            .records()
            .filter(|m| !m.is_locked() && !(keep_user_added && m.is_user_added()))
            .map(|m| m.index)
            .collect();

        let mut deleted = 0;
        for slot in candidates {
            if state.delete(slot)? {
                deleted += 1;
            }
        }

        if state.count() == 0 {
            state.metadata.clear();
            state.disk.clear()?;
            state.flags.clear();
            state.index.clear();
            state.dirty = true;
        }
        Ok(deleted)
    }

    /// Persist metadata, free list and digest. Does nothing when unchanged.
    pub fn save(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.dirty {
            return Ok(());
        }

        if let Some(paths) = &self.paths {
            let mut metadata = Vec::new();
            for entry in &state.metadata {
                entry.encode(&mut metadata);
            }
            fs::write(&paths.metadata, metadata)?;
            fs::write(&paths.free_list, state.disk.encode_free_list())?;
            if self.options.use_hash_file {
                let hash = state.disk.calculate_hash()?;
                fs::write(&paths.hash, hash.to_be_bytes())?;
            }
            state.disk.sync()?;
            trace!("store {}: saved {} slots", self.options.name, state.metadata.len());
        }

        state.dirty = false;
        Ok(())
    }

    /// Compare the digest written by the last save with the payload area.
    ///
    /// Stores without a hash file always verify.
    pub fn verify_hash(&self) -> Result<bool> {
        let Some(paths) = &self.paths else {
            return Ok(true);
        };
        if !self.options.use_hash_file {
            return Ok(true);
        }
        let Some(stored) = read_optional(&paths.hash)? else {
            return Ok(false);
        };
        let Ok(stored) = <[u8; 8]>::try_from(stored.as_slice()) else {
            return Ok(false);
        };
        let actual = self.state.read().disk.calculate_hash()?;
        Ok(u64::from_be_bytes(stored) == actual)
    }

    /// Remove the store's directory from disk.
    pub fn delete_files(&self) -> Result<()> {
        let Some(paths) = &self.paths else {
            return Ok(());
        };
        match fs::remove_dir_all(&paths.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Blobs = Database<String, (), ()>;

    fn options(policy: SlotPolicy) -> DatabaseOptions {
        DatabaseOptions::new("Blobs", policy)
    }

    #[test]
    fn test_round_trip_in_memory() {
        let db = Blobs::open(None, options(SlotPolicy::AppendOnly)).unwrap();
        let a = db.insert(&"alpha".to_string(), MetadataFlags::NONE, ()).unwrap();
        let b = db.insert(&String::new(), MetadataFlags::NONE, ()).unwrap();
        assert_eq!(db.load(a).unwrap(), "alpha");
        assert_eq!(db.load(b).unwrap(), "");
        assert_eq!(db.count(), 2);
    }

    #[test]
    fn test_round_trip_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let payloads = ["", "x", "hello world", "\u{1F600} unicode"];

        let slots: Vec<usize> = {
            let db = Blobs::open(Some(dir.path()), options(SlotPolicy::AppendOnly)).unwrap();
            let slots = payloads
                .iter()
                .map(|p| db.insert(&p.to_string(), MetadataFlags::NONE, ()).unwrap())
                .collect();
            db.save().unwrap();
            assert!(db.verify_hash().unwrap());
            slots
        };

        let db = Blobs::open(Some(dir.path()), options(SlotPolicy::AppendOnly)).unwrap();
        assert_eq!(db.count(), payloads.len());
        for (slot, payload) in slots.iter().zip(payloads) {
            assert_eq!(db.load(*slot).unwrap(), payload);
        }
        assert!(db.verify_hash().unwrap());
    }

    #[test]
    fn test_verify_hash_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let db = Blobs::open(Some(dir.path()), options(SlotPolicy::AppendOnly)).unwrap();
        db.insert(&"payload".to_string(), MetadataFlags::NONE, ()).unwrap();
        db.save().unwrap();

        let data = dir.path().join("Blobs").join("Blobs.db");
        fs::write(&data, b"PAYLOAD").unwrap();
        assert!(!db.verify_hash().unwrap());
    }

    #[test]
    fn test_append_only_keeps_slots_stable() {
        let db = Blobs::open(None, options(SlotPolicy::AppendOnly)).unwrap();
        let a = db.insert(&"a".to_string(), MetadataFlags::NONE, ()).unwrap();
        let b = db.insert(&"b".to_string(), MetadataFlags::NONE, ()).unwrap();
        let c = db.insert(&"c".to_string(), MetadataFlags::NONE, ()).unwrap();

        assert!(db.delete(a).unwrap());
        let d = db.insert(&"d".to_string(), MetadataFlags::NONE, ()).unwrap();
        assert_eq!(d, 3);
        assert_eq!(db.load(b).unwrap(), "b");
        assert_eq!(db.load(c).unwrap(), "c");
        assert!(db.load(a).is_err());

        // Trailing deleted slots are released.
        assert!(db.delete(d).unwrap());
        assert!(db.delete(c).unwrap());
        db.read(|s| assert_eq!(s.slot_count(), 2));
    }

    #[test]
    fn test_reuse_deleted_slot() {
        let db = Blobs::open(None, options(SlotPolicy::ReuseDeleted)).unwrap();
        let a = db.insert(&"a".to_string(), MetadataFlags::NONE, ()).unwrap();
        db.insert(&"b".to_string(), MetadataFlags::NONE, ()).unwrap();
        db.delete(a).unwrap();
        assert_eq!(db.insert(&"c".to_string(), MetadataFlags::NONE, ()).unwrap(), a);
        assert_eq!(db.load(a).unwrap(), "c");
    }

    #[test]
    fn test_locked_records_survive() {
        let db = Blobs::open(None, options(SlotPolicy::AppendOnly)).unwrap();
        let locked = db.insert(&"l".to_string(), MetadataFlags::LOCKED, ()).unwrap();
        let user = db.insert(&"u".to_string(), MetadataFlags::USER_ADDED, ()).unwrap();
        let plain = db.insert(&"p".to_string(), MetadataFlags::NONE, ()).unwrap();

        assert!(!db.delete(locked).unwrap());

        assert_eq!(db.clear(true).unwrap(), 1);
        assert!(db.load(plain).is_err());
        assert_eq!(db.load(user).unwrap(), "u");

        assert_eq!(db.clear(false).unwrap(), 1);
        assert_eq!(db.load(locked).unwrap(), "l");
        assert_eq!(db.count(), 1);

        db.write(|s| s.set_flag(locked, MetadataFlags::LOCKED, false));
        assert_eq!(db.clear(false).unwrap(), 1);
        assert_eq!(db.count(), 0);
    }

    #[test]
    fn test_save_only_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let db = Blobs::open(Some(dir.path()), options(SlotPolicy::AppendOnly)).unwrap();
        assert!(!db.is_dirty());
        db.insert(&"a".to_string(), MetadataFlags::NONE, ()).unwrap();
        assert!(db.is_dirty());
        db.save().unwrap();
        assert!(!db.is_dirty());
        assert!(dir.path().join("Blobs").join("Blobs.metadata").exists());
        assert!(dir.path().join("Blobs").join("Blobs.freelist").exists());
        assert!(dir.path().join("Blobs").join("Blobs.hash").exists());

        db.delete_files().unwrap();
        assert!(!dir.path().join("Blobs").exists());
    }
}
