//! File-based Snapshot Store
//!
//! One file per record under a base directory, written to a temp file and
//! renamed into place. With a passphrase, records are sealed with AES-256-GCM
//! under an Argon2-derived key (fresh salt and nonce per write).

use crate::core_mls::traits::storage::{SnapshotKey, StateSnapshotStore, StoreError, StoreResult};
use crate::core_mls::types::GroupId;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use async_trait::async_trait;
use rand::RngCore;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Magic header for snapshot files
const MAGIC_HEADER: &[u8; 8] = b"GWSS0001";

/// Current snapshot format version
const FORMAT_VERSION: u8 = 1;

/// Salt length for Argon2 KDF
const SALT_LEN: usize = 16;

/// Nonce length for AES-GCM
const NONCE_LEN: usize = 12;

const HEADER_LEN: usize = MAGIC_HEADER.len() + 1;

const FILE_EXTENSION: &str = "snapshot";

pub struct FileSnapshotStore {
    base_path: PathBuf,
    passphrase: Option<Zeroizing<String>>,
}

impl FileSnapshotStore {
    /// Open (and create if needed) a store rooted at `base_path`.
    ///
    /// # Arguments
    /// * `base_path` - Directory holding one file per record
    /// * `passphrase` - Optional passphrase for encryption at rest
    pub fn new(base_path: impl Into<PathBuf>, passphrase: Option<&str>) -> StoreResult<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path).map_err(|e| {
            StoreError::Io(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(Self {
            base_path,
            passphrase: passphrase.map(|s| Zeroizing::new(s.to_string())),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path(&self, key: &SnapshotKey) -> PathBuf {
        self.base_path
            .join(format!("{}.{}", key.name(), FILE_EXTENSION))
    }

    fn derive_key(passphrase: &str, salt: &[u8]) -> StoreResult<Zeroizing<[u8; 32]>> {
        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
            .map_err(|e| StoreError::Io(format!("Key derivation failed: {}", e)))?;
        Ok(key)
    }

    /// Layout: [magic][version][salt][nonce][ciphertext+tag], or
    /// [magic][version][plaintext] without a passphrase
    fn seal(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        let mut sealed = Vec::with_capacity(HEADER_LEN + SALT_LEN + NONCE_LEN + data.len() + 16);
        sealed.extend_from_slice(MAGIC_HEADER);
        sealed.push(FORMAT_VERSION);

        let Some(passphrase) = &self.passphrase else {
            sealed.extend_from_slice(data);
            return Ok(sealed);
        };

        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce_bytes);

        let key = Self::derive_key(passphrase, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| StoreError::Io(format!("Invalid key: {}", e)))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), data)
            .map_err(|e| StoreError::Io(format!("Encryption failed: {}", e)))?;

        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, key: &SnapshotKey, sealed: &[u8]) -> StoreResult<Vec<u8>> {
        let corrupt = |reason: &str| StoreError::Corrupt {
            key: key.name(),
            reason: reason.to_string(),
        };

        if sealed.len() < HEADER_LEN || &sealed[..MAGIC_HEADER.len()] != MAGIC_HEADER {
            return Err(corrupt("invalid snapshot header"));
        }
        if sealed[MAGIC_HEADER.len()] != FORMAT_VERSION {
            return Err(corrupt("unsupported format version"));
        }

        let body = &sealed[HEADER_LEN..];
        let Some(passphrase) = &self.passphrase else {
            return Ok(body.to_vec());
        };

        if body.len() < SALT_LEN + NONCE_LEN {
            return Err(corrupt("truncated encrypted snapshot"));
        }
        let (salt, rest) = body.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let derived = Self::derive_key(passphrase, salt)?;
        let cipher = Aes256Gcm::new_from_slice(derived.as_ref())
            .map_err(|e| StoreError::Io(format!("Invalid key: {}", e)))?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| corrupt("decryption failed"))
    }
}

#[async_trait]
impl StateSnapshotStore for FileSnapshotStore {
    async fn save(&self, key: &SnapshotKey, bytes: &[u8]) -> StoreResult<()> {
        let sealed = self.seal(bytes)?;

        let path = self.record_path(key);
        let temp_path = path.with_extension("tmp");

        tokio::fs::write(&temp_path, sealed)
            .await
            .map_err(|e| StoreError::Io(format!("Write failed for {}: {}", key, e)))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StoreError::Io(format!("Atomic rename failed for {}: {}", key, e)))?;

        debug!(record = %key, bytes = bytes.len(), "snapshot saved");
        Ok(())
    }

    async fn load(&self, key: &SnapshotKey) -> StoreResult<Option<Vec<u8>>> {
        let path = self.record_path(key);
        let sealed = match tokio::fs::read(&path).await {
            Ok(sealed) => sealed,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(format!("Read failed for {}: {}", key, e))),
        };

        self.open(key, &sealed).map(Some)
    }

    async fn delete(&self, key: &SnapshotKey) -> StoreResult<()> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!("Delete failed for {}: {}", key, e))),
        }
    }

    async fn list_groups(&self) -> StoreResult<Vec<GroupId>> {
        let mut groups = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to read directory: {}", e)))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(format!("Failed to read entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match SnapshotKey::from_name(stem) {
                Some(SnapshotKey::Group(id)) => groups.push(id),
                Some(_) => {}
                None => warn!(file = %path.display(), "ignoring unrecognised snapshot file"),
            }
        }

        groups.sort();
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp_dir.path(), None).unwrap();
        let key = SnapshotKey::Group(GroupId::new(vec![1, 2, 3, 4]));

        store.save(&key, &[10, 20, 30]).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), Some(vec![10, 20, 30]));
        assert!(store.load(&SnapshotKey::Service).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_encrypted_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let key = SnapshotKey::Service;

        {
            let store = FileSnapshotStore::new(temp_dir.path(), Some("correct horse")).unwrap();
            store.save(&key, b"outstanding key packages").await.unwrap();
        }

        let raw = std::fs::read(temp_dir.path().join("service.snapshot")).unwrap();
        assert!(!raw.windows(11).any(|w| w == b"outstanding"));

        let reopened = FileSnapshotStore::new(temp_dir.path(), Some("correct horse")).unwrap();
        assert_eq!(
            reopened.load(&key).await.unwrap().as_deref(),
            Some(&b"outstanding key packages"[..])
        );

        let wrong = FileSnapshotStore::new(temp_dir.path(), Some("wrong")).unwrap();
        assert!(matches!(
            wrong.load(&key).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_header_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp_dir.path(), None).unwrap();
        std::fs::write(temp_dir.path().join("journal.snapshot"), b"garbage").unwrap();

        let err = store.load(&SnapshotKey::Journal).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref key, .. } if key == "journal"));
    }

    #[tokio::test]
    async fn test_list_groups_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp_dir.path(), None).unwrap();
        let a = GroupId::new(vec![0xaa]);
        let b = GroupId::new(vec![0xbb]);

        store.save(&SnapshotKey::Group(b.clone()), b"b").await.unwrap();
        store.save(&SnapshotKey::Group(a.clone()), b"a").await.unwrap();
        store.save(&SnapshotKey::Journal, b"{}").await.unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(store.list_groups().await.unwrap(), vec![a.clone(), b.clone()]);

        store.delete(&SnapshotKey::Group(a)).await.unwrap();
        store.delete(&SnapshotKey::Group(GroupId::new(vec![0xcc]))).await.unwrap();
        assert_eq!(store.list_groups().await.unwrap(), vec![b]);
    }
}
