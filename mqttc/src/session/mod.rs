//! Durable client sessions.
//!
//! A [`Session`] bundles the five stores that carry QoS state across
//! reconnects and restarts. Sessions are looked up through a
//! [`SessionRegistry`], which keeps a per-host JSON index of known client
//! ids and which one was used last.
//!
//! On-disk layout, per host:
//!
//! ```text
//! <root>/MQTT/Sessions/<host>/SessionStore.json
//! <root>/MQTT/Sessions/<host>/<client id>/PublishReceivedPacketIDs/
//! <root>/MQTT/Sessions/<host>/<client id>/QoS/{UnacknowledgedPackets,QueuedPackets,
//!                                             PublishReleasedPacketIDs,ClientTopicAliasMapping}/
//! ```
//!
//! Host and client id directory names are base64 with `/` replaced by `-`.

mod outgoing;
mod packet_ids;
mod topic_alias;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::store::StoreFileOptions;

pub use outgoing::OutgoingPacketStore;
pub use packet_ids::PacketIdSet;
pub use topic_alias::TopicAliasStore;

const SESSION_INDEX_FILE: &str = "SessionStore.json";
const GENERATED_ID_PREFIX: &str = "giztoy_";

/// Encode `name` for use as a directory name.
fn to_file_name(name: &str) -> String {
    BASE64.encode(name.as_bytes()).replace('/', "-")
}

/// QoS state of one client id on one host.
pub struct Session {
    host: String,
    client_id: Option<String>,
    directory: Option<PathBuf>,
    unacknowledged: OutgoingPacketStore,
    queued: OutgoingPacketStore,
    received: PacketIdSet,
    released: PacketIdSet,
    topic_aliases: TopicAliasStore,
}

impl Session {
    fn open(
        host: &str,
        client_id: Option<String>,
        directory: Option<PathBuf>,
        files: &StoreFileOptions,
    ) -> Result<Self> {
        let root = directory.as_deref();
        let qos = directory.as_ref().map(|d| d.join("QoS"));
        let qos = qos.as_deref();

        Ok(Self {
            host: host.to_string(),
            unacknowledged: OutgoingPacketStore::open(qos, "UnacknowledgedPackets", files)?,
            queued: OutgoingPacketStore::open(qos, "QueuedPackets", files)?,
            received: PacketIdSet::open(root, "PublishReceivedPacketIDs", files)?,
            released: PacketIdSet::open(qos, "PublishReleasedPacketIDs", files)?,
            topic_aliases: TopicAliasStore::open(qos, "ClientTopicAliasMapping", files)?,
            client_id,
            directory,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Client id, or `None` for the null session.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// A null session lets the server assign the client id.
    pub fn is_null(&self) -> bool {
        self.client_id.is_none()
    }

    pub fn is_persistent(&self) -> bool {
        self.directory.is_some()
    }

    /// QoS 1/2 PUBLISH packets sent and not yet acknowledged.
    pub fn unacknowledged(&self) -> &OutgoingPacketStore {
        &self.unacknowledged
    }

    /// QoS 1/2 PUBLISH packets waiting for send quota.
    pub fn queued(&self) -> &OutgoingPacketStore {
        &self.queued
    }

    /// Ids of inbound QoS 2 publishes answered with PUBREC.
    pub fn received(&self) -> &PacketIdSet {
        &self.received
    }

    /// Ids of outbound QoS 2 publishes answered with PUBREL.
    pub fn released(&self) -> &PacketIdSet {
        &self.released
    }

    pub fn topic_aliases(&self) -> &TopicAliasStore {
        &self.topic_aliases
    }

    /// Persist every store that changed since the last save.
    pub fn save(&self) -> Result<()> {
        self.unacknowledged.save()?;
        self.queued.save()?;
        self.received.save()?;
        self.released.save()?;
        self.topic_aliases.save()
    }

    fn delete_files(&self) -> Result<()> {
        self.unacknowledged.delete_files()?;
        self.queued.delete_files()?;
        self.received.delete_files()?;
        self.released.delete_files()?;
        self.topic_aliases.delete_files()?;
        if let Some(directory) = &self.directory {
            match fs::remove_dir_all(directory) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("client_id", &self.client_id)
            .field("persistent", &self.is_persistent())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionEntry {
    client_id: String,
    encoded: String,
}

/// Per-host list of known sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionIndex {
    host: String,
    #[serde(default)]
    last_used_session_id: Option<String>,
    #[serde(default)]
    sessions: Vec<SessionEntry>,
}

impl SessionIndex {
    fn find(&self, client_id: &str) -> Option<&SessionEntry> {
        self.sessions.iter().find(|s| s.client_id == client_id)
    }
}

/// Where sessions keep their stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStorage {
    /// Persist under the given root directory.
    Disk(PathBuf),
    /// Keep everything in memory for the lifetime of the registry.
    Memory,
}

/// Resolves `(host, client id)` pairs to sessions.
///
/// Sessions handed out are shared: asking twice for the same pair returns
/// the same [`Session`].
pub struct SessionRegistry {
    storage: SessionStorage,
    files: StoreFileOptions,
    memory_indexes: Mutex<HashMap<String, SessionIndex>>,
    open: Mutex<HashMap<(String, String), Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(storage: SessionStorage, files: StoreFileOptions) -> Self {
        Self {
            storage,
            files,
            memory_indexes: Mutex::new(HashMap::new()),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Registry persisting under `root`.
    pub fn disk(root: impl Into<PathBuf>) -> Self {
        Self::new(SessionStorage::Disk(root.into()), StoreFileOptions::default())
    }

    /// Registry that never touches the filesystem.
    pub fn memory() -> Self {
        Self::new(SessionStorage::Memory, StoreFileOptions::default())
    }

    pub fn storage(&self) -> &SessionStorage {
        &self.storage
    }

    fn host_dir(&self, host: &str) -> Option<PathBuf> {
        match &self.storage {
            SessionStorage::Disk(root) => Some(
                root.join("MQTT")
                    .join("Sessions")
                    .join(to_file_name(host)),
            ),
            SessionStorage::Memory => None,
        }
    }

    fn load_index(&self, host: &str) -> Result<SessionIndex> {
        let Some(dir) = self.host_dir(host) else {
            let indexes = self.memory_indexes.lock();
            return Ok(indexes.get(host).cloned().unwrap_or_else(|| SessionIndex {
                host: host.to_string(),
                ..Default::default()
            }));
        };

        match fs::read(dir.join(SESSION_INDEX_FILE)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(SessionIndex {
                host: host.to_string(),
                ..Default::default()
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn save_index(&self, host: &str, index: &SessionIndex) -> Result<()> {
        let Some(dir) = self.host_dir(host) else {
            self.memory_indexes
                .lock()
                .insert(host.to_string(), index.clone());
            return Ok(());
        };

        fs::create_dir_all(&dir)?;
        fs::write(dir.join(SESSION_INDEX_FILE), serde_json::to_vec_pretty(index)?)?;
        Ok(())
    }

    fn open_session(&self, host: &str, entry: &SessionEntry) -> Result<Arc<Session>> {
        let key = (host.to_string(), entry.client_id.clone());
        let mut open = self.open.lock();
        if let Some(session) = open.get(&key) {
            return Ok(session.clone());
        }

        let directory = self.host_dir(host).map(|dir| dir.join(&entry.encoded));
        let session = Arc::new(Session::open(
            host,
            Some(entry.client_id.clone()),
            directory,
            &self.files,
        )?);
        debug!("session: opened {} for {}", entry.client_id, host);
        open.insert(key, session.clone());
        Ok(session)
    }

    /// The session for `client_id`, created if unknown. Without a client
    /// id, the last used session for the host, or a new one with a
    /// generated id.
    pub fn get(&self, host: &str, client_id: Option<&str>) -> Result<Arc<Session>> {
        let mut index = self.load_index(host)?;

        if let Some(client_id) = client_id.filter(|id| !id.is_empty()) {
            let entry = match index.find(client_id) {
                Some(entry) => entry.clone(),
                None => {
                    let entry = SessionEntry {
                        client_id: client_id.to_string(),
                        encoded: to_file_name(client_id),
                    };
                    index.sessions.push(entry.clone());
                    entry
                }
            };
            if index.last_used_session_id.as_deref() != Some(client_id) {
                index.last_used_session_id = Some(client_id.to_string());
            }
            self.save_index(host, &index)?;
            return self.open_session(host, &entry);
        }

        if let Some(last) = index.last_used_session_id.as_deref() {
            if let Some(entry) = index.find(last) {
                let entry = entry.clone();
                return self.open_session(host, &entry);
            }
        }

        let client_id = format!("{}{}", GENERATED_ID_PREFIX, Uuid::new_v4().simple());
        let entry = SessionEntry {
            encoded: to_file_name(&client_id),
            client_id: client_id.clone(),
        };
        index.sessions.push(entry.clone());
        index.last_used_session_id = Some(client_id);
        self.save_index(host, &index)?;
        info!("session: created {} for {}", entry.client_id, host);
        self.open_session(host, &entry)
    }

    /// Every session known for `host`.
    pub fn get_sessions(&self, host: &str) -> Result<Vec<Arc<Session>>> {
        let index = self.load_index(host)?;
        index
            .sessions
            .iter()
            .map(|entry| self.open_session(host, entry))
            .collect()
    }

    pub fn has_any(&self, host: &str) -> Result<bool> {
        Ok(!self.load_index(host)?.sessions.is_empty())
    }

    /// Client id used last for `host`.
    pub fn last_used(&self, host: &str) -> Result<Option<String>> {
        Ok(self.load_index(host)?.last_used_session_id)
    }

    /// Forget `session` and remove its files.
    pub fn delete(&self, host: &str, session: &Session) -> Result<()> {
        let Some(client_id) = session.client_id() else {
            return Ok(());
        };

        let mut index = self.load_index(host)?;
        index.sessions.retain(|s| s.client_id != client_id);
        if index.last_used_session_id.as_deref() == Some(client_id) {
            index.last_used_session_id = None;
        }
        self.open
            .lock()
            .remove(&(host.to_string(), client_id.to_string()));
        session.delete_files()?;
        self.save_index(host, &index)?;
        info!("session: deleted {} for {}", client_id, host);
        Ok(())
    }

    /// An in-memory session without a client id.
    pub fn null_session(&self, host: &str) -> Result<Arc<Session>> {
        Ok(Arc::new(Session::open(host, None, None, &self.files)?))
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("storage", &self.storage)
            .finish()
    }
}

/// Default session root: the user cache directory, if there is one.
pub fn default_session_root() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("giztoy"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::protocol::Publish;
    use crate::types::QoS;

    fn session_dir(root: &Path, host: &str, client_id: &str) -> PathBuf {
        root.join("MQTT")
            .join("Sessions")
            .join(to_file_name(host))
            .join(to_file_name(client_id))
    }

    #[test]
    fn test_file_names_are_path_safe() {
        assert_eq!(to_file_name("broker.local"), "YnJva2VyLmxvY2Fs");
        assert!(!to_file_name("\u{ff}\u{ff}\u{ff}").contains('/'));
    }

    #[test]
    fn test_get_by_client_id_and_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::disk(dir.path());

        assert!(!registry.has_any("broker").unwrap());
        let a = registry.get("broker", Some("device-a")).unwrap();
        assert_eq!(a.client_id(), Some("device-a"));
        assert!(a.is_persistent());

        let again = registry.get("broker", None).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert!(registry.has_any("broker").unwrap());
        assert!(!registry.has_any("other").unwrap());

        registry.get("broker", Some("device-b")).unwrap();
        assert_eq!(registry.last_used("broker").unwrap().as_deref(), Some("device-b"));
        assert_eq!(registry.get_sessions("broker").unwrap().len(), 2);
    }

    #[test]
    fn test_generated_client_id() {
        let registry = SessionRegistry::memory();
        let session = registry.get("broker", None).unwrap();
        let id = session.client_id().unwrap();
        assert!(id.starts_with("giztoy_"));
        assert_eq!(id.len(), "giztoy_".len() + 32);
        assert!(!session.is_persistent());

        let again = registry.get("broker", None).unwrap();
        assert_eq!(again.client_id(), Some(id));
    }

    #[test]
    fn test_session_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = SessionRegistry::disk(dir.path());
            let session = registry.get("broker", Some("device")).unwrap();
            let mut publish = Publish::new("a/b", QoS::AtLeastOnce, "hello", None);
            publish.pkid = 3;
            session.unacknowledged().add(3, &publish).unwrap();
            session.released().add(9).unwrap();
            session.received().add(12).unwrap();
            session.save().unwrap();
        }

        let registry = SessionRegistry::disk(dir.path());
        assert_eq!(registry.last_used("broker").unwrap().as_deref(), Some("device"));
        let session = registry.get("broker", None).unwrap();
        assert_eq!(session.unacknowledged().packet_ids(), vec![3]);
        assert!(session.released().contains(9));
        assert!(session.received().contains(12));
        assert!(
            session_dir(dir.path(), "broker", "device")
                .join("QoS")
                .join("UnacknowledgedPackets")
                .exists()
        );
    }

    #[test]
    fn test_delete_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::disk(dir.path());
        let session = registry.get("broker", Some("device")).unwrap();
        session.received().add(1).unwrap();
        session.save().unwrap();

        registry.delete("broker", &session).unwrap();
        assert!(!registry.has_any("broker").unwrap());
        assert_eq!(registry.last_used("broker").unwrap(), None);
        assert!(!session_dir(dir.path(), "broker", "device").exists());

        let fresh = registry.get("broker", Some("device")).unwrap();
        assert_eq!(fresh.received().count(), 0);
    }

    #[test]
    fn test_null_session() {
        let registry = SessionRegistry::memory();
        let session = registry.null_session("broker").unwrap();
        assert!(session.is_null());
        assert!(!registry.has_any("broker").unwrap());
    }
}
