use std::time::Duration;

/// Well-known port the seeder listens on and the port announced to trackers.
pub const DEFAULT_PORT: u16 = 6881;
/// Size of one requested block.
pub const BLOCK_SIZE: u32 = 16 * 1024;
/// Outstanding block requests per peer.
pub const MAX_PIPELINE: usize = 5;

/// Runtime tunables shared by the download and seeding sides.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub block_size: u32,
    pub max_pipeline: usize,
    /// Upper bound for establishing a TCP connection to a peer.
    pub connect_timeout: Duration,
    /// Deadline applied to every read from a peer.
    pub read_timeout: Duration,
    /// Upper bound for downloading one whole piece from one peer.
    pub piece_timeout: Duration,
    /// How long a worker waits for a piece its peer has before giving up.
    pub idle_limit: Duration,
    /// Pending requests buffered per seeding connection.
    pub serve_queue: usize,
    pub max_peers: usize,
    /// Seeder upload cap in bytes per second.
    pub upload_limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            block_size: BLOCK_SIZE,
            max_pipeline: MAX_PIPELINE,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            piece_timeout: Duration::from_secs(60),
            idle_limit: Duration::from_secs(60),
            serve_queue: 16,
            max_peers: 50,
            upload_limit: None,
        }
    }
}
