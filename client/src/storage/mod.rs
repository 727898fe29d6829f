use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Suffix of the progress cache kept next to the downloaded file.
pub const CACHE_SUFFIX: &str = ".progress.json";

/// Resolves where a download lives on disk.
///
/// Both the output file and its progress cache sit in `download_dir`.
pub struct Storage {
    /// The root directory where files will be stored.
    pub download_dir: PathBuf,
}

impl Storage {
    /// Uses `path` as the download directory, or `./downloads` when `None`,
    /// creating it if needed.
    ///
    /// # Errors
    ///
    /// Fails when the path exists but is not a directory, or cannot be created.
    pub async fn new(path: Option<PathBuf>) -> io::Result<Self> {
        let download_dir = match path {
            Some(p) => p,
            None => std::env::current_dir()?.join("downloads"),
        };

        match fs::metadata(&download_dir).await {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "Path exists but is not a directory",
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&download_dir).await?;
            }
            Err(e) => return Err(e),
        }

        Ok(Self { download_dir })
    }

    pub fn get_file_path(&self, filename: &str) -> PathBuf {
        self.download_dir.join(filename)
    }

    /// Path of the progress cache for the file called `filename`.
    pub fn cache_path(&self, filename: &str) -> PathBuf {
        self.download_dir.join(format!("{filename}{CACHE_SUFFIX}"))
    }

    pub fn dir(&self) -> &Path {
        &self.download_dir
    }
}
