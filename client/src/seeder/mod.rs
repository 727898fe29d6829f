//! Seeding side: accepts incoming peers and serves blocks from a local file.

mod connection;

pub use connection::ServeState;

use crate::cache::ProgressCache;
use crate::config::Config;
use crate::error::{CacheError, SeedError};
use crate::peer::{Bitfield, generate_peer_id};
use crate::storage::CACHE_SUFFIX;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tds_core::{TokenBucket, Torrent};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Largest block a peer may ask for in one request.
pub const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// Serves the pieces of one torrent from `source`.
///
/// Shared by every connection task. Only pieces set in `availability` are
/// ever read from disk and sent.
pub struct Seeder {
    torrent: Arc<Torrent>,
    source: PathBuf,
    availability: Bitfield,
    peer_id: [u8; 20],
    config: Arc<Config>,
    limiter: Option<Mutex<TokenBucket>>,
    uploaded: AtomicU64,
}

impl Seeder {
    pub fn new(torrent: Torrent, source: PathBuf, availability: Bitfield, config: Config) -> Self {
        let limiter = config
            .upload_limit
            .map(|rate| Mutex::new(TokenBucket::new(rate as f64, rate as f64)));
        Self {
            torrent: Arc::new(torrent),
            source,
            availability,
            peer_id: generate_peer_id(),
            config: Arc::new(config),
            limiter,
            uploaded: AtomicU64::new(0),
        }
    }

    /// Builds a seeder whose availability comes from a progress cache.
    ///
    /// With `cache` set, that file must exist. Otherwise the cache next to
    /// `source` is used if present, and the file is assumed complete only
    /// when there is none.
    pub async fn from_cache(
        torrent: Torrent,
        source: PathBuf,
        cache: Option<PathBuf>,
        config: Config,
    ) -> Result<Self, SeedError> {
        let actual = tokio::fs::metadata(&source)
            .await
            .map_err(|e| SeedError::Source {
                path: source.clone(),
                source: e,
            })?
            .len();
        if actual != torrent.length {
            return Err(SeedError::SourceLength {
                expected: torrent.length,
                actual,
            });
        }

        let piece_count = torrent.piece_count();
        let availability = match cache {
            Some(path) => ProgressCache::load(path).await?.to_bitfield(piece_count),
            None => match ProgressCache::load(default_cache_path(&source)).await {
                Ok(cache) => cache.to_bitfield(piece_count),
                Err(CacheError::NotFound(_)) => Bitfield::full(piece_count),
                Err(e) => return Err(e.into()),
            },
        };
        info!(
            have = availability.count(),
            total = piece_count,
            "seeding availability"
        );
        Ok(Self::new(torrent, source, availability, config))
    }

    pub fn availability(&self) -> &Bitfield {
        &self.availability
    }

    /// Bytes sent to peers so far.
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Binds `addr` and serves until the process ends.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> Result<(), SeedError> {
        let listener = TcpListener::bind(addr).await.map_err(SeedError::Bind)?;
        info!(%addr, "seeder listening");
        self.serve(listener).await;
        Ok(())
    }

    /// Accepts connections forever, one task per peer.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "accepted connection");
                    let seeder = self.clone();
                    tokio::spawn(async move {
                        let name = addr.to_string();
                        if let Err(e) = seeder.handle_connection(stream, name).await {
                            warn!(peer = %addr, error = %e, "connection ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
    }
}

/// `<source>.progress.json`, where a download of `source` keeps its progress.
fn default_cache_path(source: &Path) -> PathBuf {
    let mut name = OsString::from(source.as_os_str());
    name.push(CACHE_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::sha1;
    use tempfile::tempdir;

    fn torrent() -> Torrent {
        Torrent::new("seed.bin", [4; 20], 10, 18, vec![sha1(b"0123456789"), sha1(b"abcdefgh")])
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_cache_assumes_complete_file() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("seed.bin");
        tokio::fs::write(&source, b"0123456789abcdefgh").await.unwrap();

        let seeder = Seeder::from_cache(torrent(), source, None, Config::default())
            .await
            .unwrap();
        assert!(seeder.availability().is_complete());
    }

    #[tokio::test]
    async fn test_sibling_cache_limits_availability() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("seed.bin");
        tokio::fs::write(&source, b"0123456789\0\0\0\0\0\0\0\0").await.unwrap();

        let mut cache = ProgressCache::default();
        cache.mark_complete(0);
        cache
            .save(dir.path().join("seed.bin.progress.json"))
            .await
            .unwrap();

        let seeder = Seeder::from_cache(torrent(), source, None, Config::default())
            .await
            .unwrap();
        assert!(seeder.availability().has(0));
        assert!(!seeder.availability().has(1));
    }

    #[tokio::test]
    async fn test_explicit_cache_must_exist() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("seed.bin");
        tokio::fs::write(&source, b"0123456789abcdefgh").await.unwrap();

        let missing = dir.path().join("nope.json");
        let err = Seeder::from_cache(torrent(), source, Some(missing), Config::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SeedError::Cache(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_source_length_mismatch() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("seed.bin");
        tokio::fs::write(&source, b"short").await.unwrap();

        let err = Seeder::from_cache(torrent(), source, None, Config::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SeedError::SourceLength {
                expected: 18,
                actual: 5
            }
        ));
    }
}
