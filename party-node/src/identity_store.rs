//! Persisted local identity: one record under a fixed key in the data directory.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use party_core::wire::{decode_body, encode_body};
use party_core::{Keypair, LocalIdentity};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StorageError;

/// File name of the identity record.
pub const IDENTITY_KEY: &str = "recycled-peer-id";

const RECORD_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    version: u8,
    display_name: String,
    secret: [u8; 32],
}

pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Use `dir` if given, else the platform data directory.
    pub fn from_config(dir: Option<&Path>) -> Result<Self, StorageError> {
        match dir {
            Some(d) => Ok(Self::new(d)),
            None => Ok(Self::new(data_dir()?)),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(IDENTITY_KEY)
    }

    /// Read the stored identity, `None` if nothing has been stored yet.
    pub fn load(&self) -> Result<Option<LocalIdentity>, StorageError> {
        let path = self.path();
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        let record: IdentityRecord = decode_body(&bytes).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if record.version != RECORD_VERSION {
            return Err(StorageError::UnsupportedVersion(record.version));
        }
        Ok(Some(LocalIdentity::new(
            Keypair::from_secret_bytes(record.secret),
            record.display_name,
        )))
    }

    /// Return the stored identity, creating and persisting one on first use.
    /// `display_name` only matters on creation; the stored name wins afterwards.
    pub fn get_or_create_identity(&self, display_name: &str) -> Result<LocalIdentity, StorageError> {
        if let Some(identity) = self.load()? {
            return Ok(identity);
        }
        let identity = LocalIdentity::generate(display_name);
        self.store(&identity)?;
        info!(
            "created identity {} at {}",
            identity.peer_id(),
            self.path().display()
        );
        Ok(identity)
    }

    fn store(&self, identity: &LocalIdentity) -> Result<(), StorageError> {
        let record = IdentityRecord {
            version: RECORD_VERSION,
            display_name: identity.display_name().to_string(),
            secret: identity.keypair().secret_bytes(),
        };
        let bytes = encode_body(&record).map_err(|e| StorageError::Corrupt {
            path: self.path(),
            reason: e.to_string(),
        })?;
        std::fs::create_dir_all(&self.dir).map_err(|source| StorageError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let tmp = self.dir.join(format!("{}.tmp", IDENTITY_KEY));
        write_private(&tmp, &bytes).map_err(|source| StorageError::Io {
            path: tmp.clone(),
            source,
        })?;
        let path = self.path();
        std::fs::rename(&tmp, &path).map_err(|source| StorageError::Io { path, source })
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(bytes)?;
    f.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

/// Platform data directory for the node (identity, default inbox).
pub fn data_dir() -> Result<PathBuf, StorageError> {
    ProjectDirs::from("org", "multiparty", "party")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}

/// Host name, used when no display name is given.
pub fn default_display_name() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "party-peer".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_call_returns_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let first = store.get_or_create_identity("laptop").unwrap();
        let second = store.get_or_create_identity("laptop").unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(
            first.keypair().public_key(),
            second.keypair().public_key()
        );
    }

    #[test]
    fn survives_a_fresh_store_instance() {
        let dir = tempfile::tempdir().unwrap();
        let id = IdentityStore::new(dir.path())
            .get_or_create_identity("laptop")
            .unwrap()
            .peer_id();
        let reopened = IdentityStore::new(dir.path()).load().unwrap().unwrap();
        assert_eq!(reopened.peer_id(), id);
        assert!(dir.path().join(IDENTITY_KEY).exists());
    }

    #[test]
    fn stored_display_name_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        store.get_or_create_identity("first").unwrap();
        let again = store.get_or_create_identity("second").unwrap();
        assert_eq!(again.display_name(), "first");
    }

    #[test]
    fn missing_record_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IdentityStore::new(dir.path().join("nested"))
            .load()
            .unwrap()
            .is_none());
    }

    #[test]
    fn corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IDENTITY_KEY), b"\xff\xff").unwrap();
        let store = IdentityStore::new(dir.path());
        assert!(matches!(
            store.get_or_create_identity("x"),
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[test]
    fn unknown_version_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let record = IdentityRecord {
            version: 9,
            display_name: "x".into(),
            secret: [3; 32],
        };
        std::fs::write(dir.path().join(IDENTITY_KEY), encode_body(&record).unwrap()).unwrap();
        assert!(matches!(
            IdentityStore::new(dir.path()).load(),
            Err(StorageError::UnsupportedVersion(9))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn record_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        store.get_or_create_identity("x").unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
