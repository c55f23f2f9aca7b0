//! Paired-host record kept by a client between runs.
//!
//! A client remembers a single host: pairing with a new one replaces the old
//! record.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Everything a returning client needs to reconnect without a QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedHostRecord {
    /// Relay the pairing happened on.
    pub relay_url: String,
    /// Host identifier.
    pub host_id: String,
    /// Host display name, for status lines.
    pub host_name: String,
    /// Base64 Ed25519 public key of the host.
    pub host_public_key: String,
}

/// Storage for the paired-host record.
pub trait CredentialStore: Send + Sync {
    /// The stored record, if any.
    fn paired_host(&self) -> Option<PairedHostRecord>;

    /// Replace the stored record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    fn save_paired_host(&self, record: &PairedHostRecord) -> Result<(), String>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    paired_host: Option<PairedHostRecord>,
}

/// Record persisted as TOML on disk.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    cached: Mutex<Option<PairedHostRecord>>,
}

impl FileCredentialStore {
    /// Open the store at `path`. A missing file means "never paired".
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let file = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            toml::from_str::<CredentialsFile>(&contents)?
        } else {
            CredentialsFile::default()
        };
        Ok(Self {
            path,
            cached: Mutex::new(file.paired_host),
        })
    }
}

impl CredentialStore for FileCredentialStore {
    fn paired_host(&self) -> Option<PairedHostRecord> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save_paired_host(&self, record: &PairedHostRecord) -> Result<(), String> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let file = CredentialsFile {
            paired_host: Some(record.clone()),
        };
        let contents =
            toml::to_string_pretty(&file).map_err(|e| format!("serialize error: {e}"))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("create dir error: {e}"))?;
        }
        // Atomic save: write to temp file, then rename
        let tmp_path = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, &contents).map_err(|e| format!("write error: {e}"))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| format!("rename error: {e}"))?;
        *cached = Some(record.clone());
        Ok(())
    }
}

/// In-process store for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    record: Mutex<Option<PairedHostRecord>>,
}

impl CredentialStore for MemoryCredentialStore {
    fn paired_host(&self) -> Option<PairedHostRecord> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save_paired_host(&self, record: &PairedHostRecord) -> Result<(), String> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(host_id: &str) -> PairedHostRecord {
        PairedHostRecord {
            relay_url: "wss://relay.example".to_string(),
            host_id: host_id.to_string(),
            host_name: "Mac-Mini".to_string(),
            host_public_key: "cHVibGljLWtleQ==".to_string(),
        }
    }

    #[test]
    fn missing_file_means_unpaired() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::load(dir.path().join("paired.toml")).unwrap();
        assert_eq!(store.paired_host(), None);
    }

    #[test]
    fn saved_record_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("paired.toml");
        let store = FileCredentialStore::load(path.clone()).unwrap();
        store.save_paired_host(&record("h1")).unwrap();
        assert!(!path.with_extension("toml.tmp").exists());

        let reloaded = FileCredentialStore::load(path).unwrap();
        assert_eq!(reloaded.paired_host(), Some(record("h1")));
    }

    #[test]
    fn pairing_again_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paired.toml");
        let store = FileCredentialStore::load(path.clone()).unwrap();
        store.save_paired_host(&record("h1")).unwrap();
        store.save_paired_host(&record("h2")).unwrap();
        assert_eq!(store.paired_host().unwrap().host_id, "h2");
        assert_eq!(
            FileCredentialStore::load(path).unwrap().paired_host().unwrap().host_id,
            "h2"
        );
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paired.toml");
        std::fs::write(&path, "paired_host = 7").unwrap();
        assert!(FileCredentialStore::load(path).is_err());
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryCredentialStore::default();
        assert!(store.paired_host().is_none());
        store.save_paired_host(&record("h1")).unwrap();
        assert_eq!(store.paired_host(), Some(record("h1")));
    }
}
