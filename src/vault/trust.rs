//! Local trust store for vault files.
//!
//! Decryption only proceeds against files the user has explicitly
//! trusted, keyed by absolute path and a SHA-256 fingerprint of the file
//! bytes at trust time. Operations that rewrite a trusted file re-record
//! the fingerprint so trust follows legitimate edits made through the
//! CLI; out-of-band edits demote the file to `Modified`.

use crate::error::{Error, Result};
use crate::util;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEntry {
    pub fingerprint: String,
    pub trusted_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStatus {
    /// Path recorded and fingerprint matches the current bytes.
    Trusted,
    /// Path recorded but the file changed since it was trusted.
    Modified,
    /// Path never trusted.
    Unknown,
}

impl TrustStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustStatus::Trusted => "trusted",
            TrustStatus::Modified => "modified",
            TrustStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct TrustFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    files: BTreeMap<String, TrustEntry>,
}

const TRUST_FILE_VERSION: u32 = 1;

#[derive(Debug)]
pub struct TrustStore {
    file_path: PathBuf,
    lock_path: PathBuf,
    entries: BTreeMap<String, TrustEntry>,
}

fn canonical_key(file: &Path) -> String {
    util::clean_path(file).display().to_string()
}

impl TrustStore {
    /// Load the trust store under `<state_root>/vault/`. A missing file
    /// is an empty store.
    pub fn open(state_root: &Path) -> Result<Self> {
        let dir = state_root.join("vault");
        let file_path = dir.join("trust.json");
        let lock_path = dir.join("trust.lock");
        let entries = match std::fs::read(&file_path) {
            Ok(data) => {
                let parsed: TrustFile = serde_json::from_slice(&data).map_err(|e| {
                    Error::Internal(anyhow::anyhow!(
                        "corrupt trust store {}: {e}",
                        file_path.display()
                    ))
                })?;
                parsed.files
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            file_path,
            lock_path,
            entries,
        })
    }

    pub fn status(&self, file: &Path, bytes: &[u8]) -> TrustStatus {
        match self.entries.get(&canonical_key(file)) {
            None => TrustStatus::Unknown,
            Some(entry) => {
                if entry.fingerprint == util::sha256_hex(bytes) {
                    TrustStatus::Trusted
                } else {
                    TrustStatus::Modified
                }
            }
        }
    }

    /// Gate for decryption: the file must currently be `Trusted` unless
    /// `force` overrides the check.
    pub fn require(&self, file: &Path, bytes: &[u8], force: bool) -> Result<()> {
        if force || self.status(file, bytes) == TrustStatus::Trusted {
            Ok(())
        } else {
            Err(Error::TrustRequired {
                file: file.to_path_buf(),
            })
        }
    }

    /// Record (or refresh) trust for the current bytes of `file`.
    pub fn record(&mut self, file: &Path, bytes: &[u8]) {
        self.entries.insert(
            canonical_key(file),
            TrustEntry {
                fingerprint: util::sha256_hex(bytes),
                trusted_at: util::now_rfc3339(),
            },
        );
    }

    /// Drop the entry for `file`. Returns whether one existed.
    pub fn forget(&mut self, file: &Path) -> bool {
        self.entries.remove(&canonical_key(file)).is_some()
    }

    pub fn entries(&self) -> &BTreeMap<String, TrustEntry> {
        &self.entries
    }

    /// Persist under an exclusive lock. The store file is mode 0600.
    pub fn save(&self) -> Result<()> {
        let _lock = util::FileLock::acquire(&self.lock_path)?;
        let body = TrustFile {
            version: TRUST_FILE_VERSION,
            files: self.entries.clone(),
        };
        let mut bytes = serde_json::to_vec_pretty(&body)?;
        bytes.push(b'\n');
        util::write_file_atomic(&self.file_path, &bytes, 0o600)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unknown_then_trusted_then_modified() {
        let tmp = TempDir::new().unwrap();
        let mut store = TrustStore::open(tmp.path()).unwrap();
        let file = tmp.path().join(".env");

        assert_eq!(store.status(&file, b"A=1\n"), TrustStatus::Unknown);
        store.record(&file, b"A=1\n");
        assert_eq!(store.status(&file, b"A=1\n"), TrustStatus::Trusted);
        assert_eq!(store.status(&file, b"A=2\n"), TrustStatus::Modified);
    }

    #[test]
    fn require_rejects_untrusted_unless_forced() {
        let tmp = TempDir::new().unwrap();
        let store = TrustStore::open(tmp.path()).unwrap();
        let file = tmp.path().join(".env");

        let err = store.require(&file, b"A=1\n", false).unwrap_err();
        assert!(matches!(err, Error::TrustRequired { .. }));
        assert_eq!(err.exit_code(), 4);
        store.require(&file, b"A=1\n", true).unwrap();
    }

    #[test]
    fn save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join(".env");
        {
            let mut store = TrustStore::open(tmp.path()).unwrap();
            store.record(&file, b"A=1\n");
            store.save().unwrap();
        }
        let store = TrustStore::open(tmp.path()).unwrap();
        assert_eq!(store.status(&file, b"A=1\n"), TrustStatus::Trusted);
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn forget_removes_entry() {
        let tmp = TempDir::new().unwrap();
        let mut store = TrustStore::open(tmp.path()).unwrap();
        let file = tmp.path().join(".env");
        store.record(&file, b"A=1\n");
        assert!(store.forget(&file));
        assert!(!store.forget(&file));
        assert_eq!(store.status(&file, b"A=1\n"), TrustStatus::Unknown);
    }

    #[test]
    fn corrupt_store_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("vault");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("trust.json"), b"not json").unwrap();
        assert!(TrustStore::open(tmp.path()).is_err());
    }

    #[test]
    fn path_key_is_lexically_cleaned() {
        let tmp = TempDir::new().unwrap();
        let mut store = TrustStore::open(tmp.path()).unwrap();
        let file = tmp.path().join("sub/../.env");
        store.record(&file, b"A=1\n");
        assert_eq!(
            store.status(&tmp.path().join(".env"), b"A=1\n"),
            TrustStatus::Trusted
        );
    }
}
