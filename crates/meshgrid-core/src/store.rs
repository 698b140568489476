//! Key/value persistence
//!
//! Neighbors and channels survive reboot as JSON blobs under fixed keys.
//! [`MemoryStore`] backs tests and the simulator; [`JsonFileStore`] keeps
//! one JSON object per file on hosts with a filesystem.

use crate::channel::ChannelRecord;
use crate::error::{MeshError, MeshResult};
use crate::neighbor::NeighborStore;
use crate::traits::KvStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const NEIGHBORS_KEY: &str = "neighbors";
pub const CHANNELS_KEY: &str = "channels";

/// Volatile store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: &str, value: &[u8]) -> MeshResult<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// File-backed store: every key is written to `<path>` as a single JSON map
/// of key to hex-encoded value.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when the file does not exist yet
    pub fn open(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(MeshError::Storage(format!("{}: {}", path.display(), e))),
        };
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> MeshResult<()> {
        let text = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, text)
            .map_err(|e| MeshError::Storage(format!("{}: {}", self.path.display(), e)))
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).and_then(|v| hex::decode(v).ok())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> MeshResult<()> {
        self.entries.insert(key.to_string(), hex::encode(value));
        self.flush()
    }
}

/// Serialize `value` under `key`
pub fn save_json<S: KvStore + ?Sized, T: Serialize>(
    store: &mut S,
    key: &str,
    value: &T,
) -> MeshResult<()> {
    let bytes = serde_json::to_vec(value)?;
    debug!("Saving {} ({} bytes)", key, bytes.len());
    store.put(key, &bytes)
}

/// Load `key`; missing or unreadable blobs come back as `None`
pub fn load_json<S: KvStore + ?Sized, T: DeserializeOwned>(store: &S, key: &str) -> Option<T> {
    let bytes = store.get(key)?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring corrupt {} blob: {}", key, e);
            None
        }
    }
}

pub fn save_neighbors<S: KvStore + ?Sized>(store: &mut S, neighbors: &NeighborStore) -> MeshResult<()> {
    save_json(store, NEIGHBORS_KEY, neighbors)
}

pub fn load_neighbors<S: KvStore + ?Sized>(store: &S) -> Option<NeighborStore> {
    load_json(store, NEIGHBORS_KEY)
}

pub fn save_channels<S: KvStore + ?Sized>(store: &mut S, channels: &[ChannelRecord]) -> MeshResult<()> {
    save_json(store, CHANNELS_KEY, &channels)
}

pub fn load_channels<S: KvStore + ?Sized>(store: &S) -> Vec<ChannelRecord> {
    load_json(store, CHANNELS_KEY).unwrap_or_default()
}
