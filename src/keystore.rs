//! Persistent storage for the local identity.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use tracing::info;

use crate::crypto::Keys;

/// Loads and saves the local secret key. Storage is owned by the
/// implementation; callers only ask for load and save.
pub trait KeyStore: Send + Sync {
    /// The stored identity, or `None` if nothing has been saved yet.
    fn load(&self) -> Result<Option<Keys>>;
    fn save(&self, keys: &Keys) -> Result<()>;
}

/// Hex secret key in a single file.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<Keys>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("reading key file {}", self.path.display()))?;
        let keys = Keys::from_secret_hex(&data)
            .with_context(|| format!("invalid key in {}", self.path.display()))?;
        Ok(Some(keys))
    }

    fn save(&self, keys: &Keys) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            Some(_) => PathBuf::from("."),
            None => return Err(anyhow!("key file path has no parent directory")),
        };
        fs::create_dir_all(&parent)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        fs::write(tmp.path(), format!("{}\n", keys.secret_hex()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
        }
        tmp.persist(&self.path)?;
        Ok(())
    }
}

/// Load the stored identity or create and save a fresh one. The flag is
/// `true` when a new identity was generated.
pub fn load_or_generate(store: &dyn KeyStore) -> Result<(Keys, bool)> {
    if let Some(keys) = store.load()? {
        return Ok((keys, false));
    }
    let keys = Keys::generate();
    store.save(&keys)?;
    info!(pubkey = %keys.public_hex(), "generated new identity");
    Ok((keys, true))
}
