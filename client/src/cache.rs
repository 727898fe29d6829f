//! Resumable download progress.
//!
//! A JSON map of piece index to "stored in the output file". The download
//! side rewrites it after every stored piece; the seeding side reads it to
//! decide which pieces it can serve.

use crate::error::CacheError;
use crate::peer::Bitfield;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCache {
    pub pieces: BTreeMap<u32, bool>,
}

impl ProgressCache {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Loads the cache, treating a missing or unreadable file as empty.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path).await {
            Ok(cache) => cache,
            Err(CacheError::NotFound(path)) => {
                debug!(path = %path.display(), "no progress cache, starting fresh");
                Self::default()
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable progress cache");
                Self::default()
            }
        }
    }

    /// Writes to a sibling temp file and renames it over `path`, so a crash
    /// leaves either the old or the new file, never a torn one.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), CacheError> {
        let path = path.as_ref();
        let tmp = temp_path(path);
        let json = serde_json::to_vec(self)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub fn mark_complete(&mut self, index: u32) {
        self.pieces.insert(index, true);
    }

    pub fn is_complete(&self, index: u32) -> bool {
        self.pieces.get(&index).copied().unwrap_or(false)
    }

    pub fn completed_count(&self) -> usize {
        self.pieces.values().filter(|&&done| done).count()
    }

    /// True once every index below `piece_count` is complete.
    pub fn is_finished(&self, piece_count: usize) -> bool {
        (0..piece_count as u32).all(|i| self.is_complete(i))
    }

    pub fn to_bitfield(&self, piece_count: usize) -> Bitfield {
        let mut bitfield = Bitfield::new(piece_count);
        for (&index, _) in self.pieces.iter().filter(|(_, done)| **done) {
            bitfield.set(index);
        }
        bitfield
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
