use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download the file described by a torrent
    Download {
        /// Path to the torrent file
        #[arg(short, long, default_value = "example.torrent")]
        torrent: PathBuf,

        /// Output directory for downloaded files
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Peer to download from, repeatable; skips the trackers when given
        #[arg(short, long = "peer")]
        peers: Vec<SocketAddr>,

        /// Port announced to trackers
        #[arg(long, default_value_t = client::config::DEFAULT_PORT)]
        port: u16,

        /// Hash the data already on disk before downloading
        #[arg(long)]
        recheck: bool,
    },

    /// Serve a complete or partial file to other peers
    Seed {
        /// Path to the torrent file
        #[arg(short, long, default_value = "example.torrent")]
        torrent: PathBuf,

        /// File holding the torrent's data
        #[arg(short, long)]
        file: PathBuf,

        /// Port to listen on
        #[arg(long, default_value_t = client::config::DEFAULT_PORT)]
        port: u16,

        /// Progress cache deciding which pieces are served
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Upload cap in bytes per second
        #[arg(long)]
        upload_limit: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_args() {
        let args = Args::try_parse_from([
            "client",
            "download",
            "-t",
            "file.torrent",
            "--peer",
            "127.0.0.1:6881",
            "--peer",
            "127.0.0.1:6882",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.verbose, 1);
        match args.command {
            Command::Download { torrent, peers, port, recheck, .. } => {
                assert_eq!(torrent, PathBuf::from("file.torrent"));
                assert_eq!(peers.len(), 2);
                assert_eq!(port, 6881);
                assert!(!recheck);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_seed_requires_file() {
        assert!(Args::try_parse_from(["client", "seed"]).is_err());

        let args = Args::try_parse_from([
            "client",
            "seed",
            "--file",
            "data.bin",
            "--upload-limit",
            "1000",
        ])
        .unwrap();
        match args.command {
            Command::Seed { file, upload_limit, cache, .. } => {
                assert_eq!(file, PathBuf::from("data.bin"));
                assert_eq!(upload_limit, Some(1000));
                assert!(cache.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
