//! Embedded record store.
//!
//! Each store keeps its records as metadata entries (position, length,
//! flags and store-specific extras) separate from the payload bytes, with
//! AVL-backed secondary indexes for lookups. A persistent store lives in
//! its own directory with a payload file, a free-list file, a metadata file
//! and an optional digest file.

pub mod avl;
pub mod database;
pub mod disk;
pub mod index;
pub mod metadata;

pub use avl::AvlTree;
pub use database::{Database, DatabaseOptions, RecordContent, SlotPolicy, State};
pub use index::{FlagIndex, IndexingService};
pub use metadata::{Metadata, MetadataExtra, MetadataFlags};

/// File extensions used by persistent stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFileOptions {
    pub data_extension: String,
    pub free_list_extension: String,
    pub metadata_extension: String,
    pub hash_extension: String,
}

impl Default for StoreFileOptions {
    fn default() -> Self {
        Self {
            data_extension: "db".to_string(),
            free_list_extension: "freelist".to_string(),
            metadata_extension: "metadata".to_string(),
            hash_extension: "hash".to_string(),
        }
    }
}
