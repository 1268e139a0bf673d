//! Requester file storage.
//!
//! Every requester key owns a directory under the storage root: uploads
//! land there, and captured job output goes to an `output/` subdirectory.
//! Digests are remembered per upload so `open` can return a manifest and
//! the facade can fingerprint submissions without re-hashing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Whether a requester-supplied name is a safe single path component.
pub fn valid_component(name: &str) -> bool {
    check_component(name).is_ok()
}

/// File names from requesters must be single path components.
fn check_component(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        Err(Error::InvalidPath(name.to_string()))
    } else {
        Ok(())
    }
}

pub struct Storage {
    root: PathBuf,
    digests: Mutex<HashMap<(String, String), String>>,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            digests: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, key: &str) -> Result<PathBuf> {
        check_component(key)?;
        Ok(self.root.join(key))
    }

    /// Ensure the requester directory exists and return a manifest of its
    /// files and their digests.
    pub async fn open(&self, key: &str) -> Result<HashMap<String, String>> {
        let dir = self.dir(key)?;
        tokio::fs::create_dir_all(&dir).await?;
        let mut manifest = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let bytes = tokio::fs::read(entry.path()).await?;
                let digest = sha256_hex(&bytes);
                self.digests
                    .lock()
                    .await
                    .insert((key.to_string(), name.clone()), digest.clone());
                manifest.insert(name, digest);
            }
        }
        Ok(manifest)
    }

    /// Store an upload and return its digest.
    pub async fn upload(&self, key: &str, filename: &str, bytes: &[u8]) -> Result<String> {
        check_component(filename)?;
        let dir = self.dir(key)?;
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(filename), bytes).await?;
        let digest = sha256_hex(bytes);
        self.digests
            .lock()
            .await
            .insert((key.to_string(), filename.to_string()), digest.clone());
        Ok(digest)
    }

    /// Digest of a previously uploaded file, computing and caching it if
    /// the file predates this process.
    pub async fn digest_of(&self, key: &str, filename: &str) -> Result<String> {
        {
            let digests = self.digests.lock().await;
            if let Some(digest) = digests.get(&(key.to_string(), filename.to_string())) {
                return Ok(digest.clone());
            }
        }
        let bytes = tokio::fs::read(self.input_path(key, filename)?).await?;
        let digest = sha256_hex(&bytes);
        self.digests
            .lock()
            .await
            .insert((key.to_string(), filename.to_string()), digest.clone());
        Ok(digest)
    }

    /// Host path of an uploaded input file.
    pub fn input_path(&self, key: &str, filename: &str) -> Result<PathBuf> {
        check_component(filename)?;
        Ok(self.dir(key)?.join(filename))
    }

    /// Whether an uploaded input file exists.
    pub async fn input_exists(&self, key: &str, filename: &str) -> bool {
        match self.input_path(key, filename) {
            Ok(path) => tokio::fs::metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Requester-side destination for captured output.
    pub fn output_path(&self, key: &str, dest: &str) -> Result<PathBuf> {
        check_component(dest)?;
        Ok(self.dir(key)?.join("output").join(dest))
    }

    /// Current captured output, or `None` if nothing has been written yet.
    pub async fn read_output(&self, key: &str, dest: &str) -> Result<Option<Vec<u8>>> {
        let path = self.output_path(key, dest)?;
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
