//! Persistence for long-term signing keys.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::sign::Signer;

/// Maximum key name length.
pub const MAX_KEY_NAME_LEN: usize = 64;

/// Key store errors.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Name is empty, too long, or contains characters outside
    /// `[A-Za-z0-9_-]`.
    #[error("invalid key name: {name:?}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// No key is stored under this name.
    #[error("key not found: {name}")]
    NotFound {
        /// Requested name.
        name: String,
    },

    /// Stored key material has the wrong length.
    #[error("key file {path} is corrupt: expected 32 bytes, found {len}")]
    Corrupt {
        /// File that failed to load.
        path: PathBuf,
        /// Bytes found.
        len: usize,
    },

    /// Underlying I/O failure.
    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of long-term signing keys.
pub trait KeyStore: Send + Sync {
    /// Loads the key stored under `name`.
    fn load(&self, name: &str) -> Result<Signer, KeyStoreError>;

    /// Stores `signer` under `name`, replacing any existing key.
    fn store(&self, name: &str, signer: &Signer) -> Result<(), KeyStoreError>;

    /// Loads the key under `name`, generating and storing one if absent.
    fn load_or_generate(&self, name: &str) -> Result<Signer, KeyStoreError> {
        match self.load(name) {
            Ok(signer) => Ok(signer),
            Err(KeyStoreError::NotFound { .. }) => {
                let signer = Signer::generate();
                self.store(name, &signer)?;
                info!(key = name, "generated new signing key");
                Ok(signer)
            },
            Err(e) => Err(e),
        }
    }
}

fn validate_name(name: &str) -> Result<(), KeyStoreError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_KEY_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(KeyStoreError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// In-memory key store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, Zeroizing<[u8; 32]>>>,
}

impl MemoryKeyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self, name: &str) -> Result<Signer, KeyStoreError> {
        validate_name(name)?;
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.get(name)
            .map(|secret| Signer::from_secret_bytes(secret))
            .ok_or_else(|| KeyStoreError::NotFound {
                name: name.to_string(),
            })
    }

    fn store(&self, name: &str, signer: &Signer) -> Result<(), KeyStoreError> {
        validate_name(name)?;
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.insert(name.to_string(), signer.secret_bytes());
        Ok(())
    }
}

/// Directory-backed key store.
///
/// Each key is a raw 32-byte file `<dir>/<name>.key`, written with mode 0600
/// on Unix.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// Opens (and creates if needed) a key directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Key directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.key"))
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self, name: &str) -> Result<Signer, KeyStoreError> {
        validate_name(name)?;
        let path = self.path_for(name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyStoreError::NotFound {
                    name: name.to_string(),
                });
            },
            Err(e) => return Err(e.into()),
        };
        let secret: Zeroizing<[u8; 32]> =
            Zeroizing::new(bytes.as_slice().try_into().map_err(|_| {
                KeyStoreError::Corrupt {
                    path: path.clone(),
                    len: bytes.len(),
                }
            })?);
        debug!(key = name, path = %path.display(), "loaded signing key");
        Ok(Signer::from_secret_bytes(&secret))
    }

    fn store(&self, name: &str, signer: &Signer) -> Result<(), KeyStoreError> {
        validate_name(name)?;
        let path = self.path_for(name);
        let tmp = self.dir.join(format!(".{name}.key.tmp"));

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(signer.secret_bytes().as_slice())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}
