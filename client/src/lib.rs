//! Peer-to-peer file transfer: wire protocol, peer sessions, the seeding
//! service, and the concurrent download scheduler with resumable progress.

pub mod cache;
pub mod config;
pub mod downloader;
pub mod error;
pub mod peer;
pub mod piece;
pub mod seeder;
pub mod storage;

pub use cache::ProgressCache;
pub use config::Config;
pub use downloader::Downloader;
pub use error::{CacheError, DownloadError, FrameError, HandshakeError, PeerError, SeedError};
pub use seeder::Seeder;
