use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::error::Error;

/// The three values a session persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CredentialKey {
    AccessToken,
    RefreshToken,
    /// JSON-serialized [`Identity`](crate::types::Identity).
    Identity,
}

impl CredentialKey {
    pub const ALL: [Self; 3] = [Self::AccessToken, Self::RefreshToken, Self::Identity];

    /// Storage key name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessToken => "auth_token",
            Self::RefreshToken => "refresh_token",
            Self::Identity => "user_data",
        }
    }
}

/// Client-local persistence for session credentials.
///
/// Plain get/set/clear; all session logic lives in [`Session`](crate::Session),
/// which is the only writer.
///
/// # Example
///
/// ```rust,ignore
/// impl CredentialStore for KeyringStore {
///     fn get(&self, key: CredentialKey) -> Result<Option<String>, Error> {
///         self.entry(key.as_str()).get_password().map(Some).or_else(not_found_is_none)
///     }
///     // ...
/// }
/// ```
pub trait CredentialStore: Send + Sync + 'static {
    /// Read a stored value.
    fn get(&self, key: CredentialKey) -> Result<Option<String>, Error>;

    /// Store a value, replacing any previous one.
    fn set(&self, key: CredentialKey, value: &str) -> Result<(), Error>;

    /// Remove all three values together.
    fn clear(&self) -> Result<(), Error>;
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: Mutex<BTreeMap<CredentialKey, String>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, Error> {
        Ok(self.values.lock().get(&key).cloned())
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), Error> {
        self.values.lock().insert(key, value.to_owned());
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        self.values.lock().clear();
        Ok(())
    }
}

/// JSON document on disk, one per client profile.
///
/// Values are cached in memory and every write replaces the file atomically
/// (temp file + rename), so a crash never leaves a half-written document.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileCredentialStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if an existing file cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| Error::Storage(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Storage(format!("{}: {e}", path.display()))),
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<(), Error> {
        let content = serde_json::to_vec_pretty(values)
            .map_err(|e| Error::Storage(e.to_string()))?;
        atomic_write(&self.path, &content)
            .map_err(|e| Error::Storage(format!("{}: {e}", self.path.display())))
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, Error> {
        Ok(self.values.lock().get(key.as_str()).cloned())
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), Error> {
        let mut values = self.values.lock();
        values.insert(key.as_str().to_owned(), value.to_owned());
        self.persist(&values)
    }

    fn clear(&self) -> Result<(), Error> {
        let mut values = self.values.lock();
        for key in CredentialKey::ALL {
            values.remove(key.as_str());
        }
        self.persist(&values)
    }
}

fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
