//! Persistence adapter: everything the overlay keeps across restarts,
//! laid out under the OS config directory (`dirs::config_dir()`) the
//! way a desktop/CLI peer is expected to, one `bincode`-encoded file
//! per concern rather than a single monolithic database.
//!
//! ```text
//! $CONFIG_DIR/peerns/
//!   identity.bin
//!   contacts.bin
//!   chats/{fingerprint-hex}.bin
//!   groups.bin
//!   group-msgs-{group_id}.bin
//!   custom-ns.bin
//!   runtime-flags.bin
//!   blobs/{transfer-id}          (raw file bytes)
//!   blobs/{transfer-id}.meta     (bincode-encoded BlobMeta)
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use bincode::{Decode, Encode};

use crate::group::StoredGroupMessage;
use crate::types::{ChatMessage, Contact, Fingerprint, GroupInfo};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error accessing {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to encode data for {0}")]
    Encode(PathBuf),
    #[error("failed to decode data from {0} (corrupt or from an incompatible version)")]
    Decode(PathBuf),
    #[error("no config directory is available on this platform")]
    NoConfigDir,
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Encode, Decode, Default)]
pub struct RuntimeFlags {
    pub auto_reconnect: bool,
    pub last_started_ms: u64,
}

#[derive(Debug, Clone, Encode, Decode, Default)]
pub struct CustomNamespaces {
    pub slugs: Vec<String>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct BlobMeta {
    pub name: String,
    pub size: u64,
    pub total_chunks: u32,
}

pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Resolve `$CONFIG_DIR/peerns` and ensure it (and its `chats/` and
    /// `blobs/` subdirectories) exist.
    pub fn open_default() -> Result<Self> {
        let base = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Self::open(base.join("peerns"))
    }

    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        fs::create_dir_all(root.join("chats")).map_err(|e| io_err(&root, e))?;
        fs::create_dir_all(root.join("blobs")).map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn chat_path(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join("chats").join(format!("{}.bin", fp.to_hex()))
    }

    fn group_msgs_path(&self, group_id: &str) -> PathBuf {
        self.root.join(format!("group-msgs-{group_id}.bin"))
    }

    pub fn blob_path(&self, transfer_id: &str) -> PathBuf {
        self.root.join("blobs").join(transfer_id)
    }

    fn blob_meta_path(&self, transfer_id: &str) -> PathBuf {
        self.root.join("blobs").join(format!("{transfer_id}.meta"))
    }

    // --- identity ---

    pub fn save_identity_bytes(&self, raw_scalar: &[u8]) -> Result<()> {
        let path = self.path("identity.bin");
        fs::write(&path, raw_scalar).map_err(|e| io_err(&path, e))
    }

    pub fn load_identity_bytes(&self) -> Result<Option<Vec<u8>>> {
        let path = self.path("identity.bin");
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path).map(Some).map_err(|e| io_err(&path, e))
    }

    // --- contacts ---

    pub fn save_contacts(&self, contacts: &HashMap<Fingerprint, Contact>) -> Result<()> {
        let values: Vec<&Contact> = contacts.values().collect();
        write_bincode(&self.path("contacts.bin"), &values)
    }

    pub fn load_contacts(&self) -> Result<HashMap<Fingerprint, Contact>> {
        let path = self.path("contacts.bin");
        let list: Vec<Contact> = read_bincode_or_default(&path)?;
        Ok(list.into_iter().map(|c| (c.fingerprint, c)).collect())
    }

    // --- chat history ---

    pub fn save_chat_history(&self, fp: &Fingerprint, messages: &[ChatMessage]) -> Result<()> {
        write_bincode(&self.chat_path(fp), &messages.to_vec())
    }

    pub fn load_chat_history(&self, fp: &Fingerprint) -> Result<Vec<ChatMessage>> {
        read_bincode_or_default(&self.chat_path(fp))
    }

    // --- groups ---

    pub fn save_groups(&self, groups: &HashMap<String, GroupInfo>) -> Result<()> {
        let values: Vec<&GroupInfo> = groups.values().collect();
        write_bincode(&self.path("groups.bin"), &values)
    }

    pub fn load_groups(&self) -> Result<HashMap<String, GroupInfo>> {
        let list: Vec<GroupInfo> = read_bincode_or_default(&self.path("groups.bin"))?;
        Ok(list.into_iter().map(|g| (g.group_id.clone(), g)).collect())
    }

    pub fn save_group_messages(&self, group_id: &str, messages: &[StoredGroupMessage]) -> Result<()> {
        write_bincode(&self.group_msgs_path(group_id), &messages.to_vec())
    }

    pub fn load_group_messages(&self, group_id: &str) -> Result<Vec<StoredGroupMessage>> {
        read_bincode_or_default(&self.group_msgs_path(group_id))
    }

    // --- misc config ---

    pub fn save_custom_namespaces(&self, ns: &CustomNamespaces) -> Result<()> {
        write_bincode(&self.path("custom-ns.bin"), ns)
    }

    pub fn load_custom_namespaces(&self) -> Result<CustomNamespaces> {
        read_bincode_or_default(&self.path("custom-ns.bin"))
    }

    pub fn save_runtime_flags(&self, flags: &RuntimeFlags) -> Result<()> {
        write_bincode(&self.path("runtime-flags.bin"), flags)
    }

    pub fn load_runtime_flags(&self) -> Result<RuntimeFlags> {
        read_bincode_or_default(&self.path("runtime-flags.bin"))
    }

    // --- blobs (file transfers) ---

    pub fn save_blob(&self, transfer_id: &str, meta: &BlobMeta, bytes: &[u8]) -> Result<()> {
        let blob_path = self.blob_path(transfer_id);
        fs::write(&blob_path, bytes).map_err(|e| io_err(&blob_path, e))?;
        write_bincode(&self.blob_meta_path(transfer_id), meta)
    }

    pub fn load_blob(&self, transfer_id: &str) -> Result<(BlobMeta, Vec<u8>)> {
        let meta = read_bincode(&self.blob_meta_path(transfer_id))?;
        let blob_path = self.blob_path(transfer_id);
        let bytes = fs::read(&blob_path).map_err(|e| io_err(&blob_path, e))?;
        Ok((meta, bytes))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io { path: path.to_path_buf(), source }
}

fn write_bincode<T: Encode>(path: &Path, value: &T) -> Result<()> {
    let config = bincode::config::standard();
    let bytes = bincode::encode_to_vec(value, config).map_err(|_| StorageError::Encode(path.to_path_buf()))?;
    fs::write(path, bytes).map_err(|e| io_err(path, e))
}

fn read_bincode<T: Decode<()>>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| io_err(path, e))?;
    let config = bincode::config::standard();
    bincode::decode_from_slice(&bytes, config)
        .map(|(value, _)| value)
        .map_err(|_| StorageError::Decode(path.to_path_buf()))
}

fn read_bincode_or_default<T: Decode<()> + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    read_bincode(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PendingState;

    fn tmp_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_path_buf()).unwrap();
        (storage, dir)
    }

    #[test]
    fn contacts_roundtrip() {
        let (storage, _dir) = tmp_storage();
        let fp = Fingerprint::from_bytes([1; 8]);
        let mut contacts = HashMap::new();
        contacts.insert(
            fp,
            Contact {
                fingerprint: fp,
                friendly_name: "alice".into(),
                public_key: vec![1, 2, 3],
                current_address: None,
                known_addresses: Default::default(),
                shared_key_fingerprint: None,
                pending: PendingState::None,
                last_seen_ms: 0,
            },
        );
        storage.save_contacts(&contacts).unwrap();
        let loaded = storage.load_contacts().unwrap();
        assert_eq!(loaded.get(&fp).unwrap().friendly_name, "alice");
    }

    #[test]
    fn missing_file_loads_as_default_not_error() {
        let (storage, _dir) = tmp_storage();
        let flags = storage.load_runtime_flags().unwrap();
        assert!(!flags.auto_reconnect);
    }

    #[test]
    fn blob_roundtrips_with_sidecar_meta() {
        let (storage, _dir) = tmp_storage();
        let meta = BlobMeta { name: "photo.jpg".into(), size: 5, total_chunks: 1 };
        storage.save_blob("transfer-1", &meta, b"hello").unwrap();
        let (loaded_meta, bytes) = storage.load_blob("transfer-1").unwrap();
        assert_eq!(loaded_meta.name, "photo.jpg");
        assert_eq!(bytes, b"hello");
    }
}
