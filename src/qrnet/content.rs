//! Content-addressed store: hash to bytes, optionally mirrored to a
//! directory with one file per hash named by its lowercase hex digest.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::crypto::{hash, Digest};

/// Append-only hash to bytes map.
#[derive(Debug, Default)]
pub struct ContentStore {
    entries: HashMap<Digest, Vec<u8>>,
    dir: Option<PathBuf>,
}

impl ContentStore {
    /// Memory-only store.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Store mirrored to `dir`, loading any files already there.
    ///
    /// Files whose name is not a digest, or whose bytes do not hash to their
    /// name, are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut entries = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(digest) = Digest::from_hex(name) else {
                continue;
            };
            let bytes = std::fs::read(&path)?;
            if hash(&bytes) != digest {
                warn!(path = %path.display(), "content file does not match its name; skipped");
                continue;
            }
            entries.insert(digest, bytes);
        }
        debug!(dir = %dir.display(), items = entries.len(), "content store opened");
        Ok(Self {
            entries,
            dir: Some(dir.to_path_buf()),
        })
    }

    /// Whether `digest` is stored.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.entries.contains_key(digest)
    }

    /// Stored bytes for `digest`.
    pub fn get(&self, digest: &Digest) -> Option<&[u8]> {
        self.entries.get(digest).map(Vec::as_slice)
    }

    /// Items stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write `bytes` to the mirror directory, if any, without recording them.
    ///
    /// Uses a temp file and rename so a reader never sees a partial file.
    pub(crate) fn persist(&self, digest: &Digest, bytes: &[u8]) -> io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let final_path = dir.join(digest.to_hex());
        if final_path.exists() {
            return Ok(());
        }
        let tmp_path = dir.join(format!(".{}.tmp", digest.to_hex()));
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &final_path)
    }

    /// Drop a persisted file that was never recorded.
    pub(crate) fn discard(&self, digest: &Digest) {
        if let Some(dir) = &self.dir {
            if !self.entries.contains_key(digest) {
                let _ = std::fs::remove_file(dir.join(digest.to_hex()));
            }
        }
    }

    /// Record bytes already persisted. Returns whether they were new.
    pub(crate) fn record(&mut self, digest: Digest, bytes: Vec<u8>) -> bool {
        if self.entries.contains_key(&digest) {
            return false;
        }
        self.entries.insert(digest, bytes);
        true
    }
}
