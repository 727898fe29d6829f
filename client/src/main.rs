mod cli;

use clap::Parser;
use cli::{Args, Command};
use client::{Config, Downloader, Seeder};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let level = match (args.quiet, args.verbose) {
        (true, _) => LevelFilter::WARN,
        (false, 0) => LevelFilter::INFO,
        (false, 1) => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match args.command {
        Command::Download {
            torrent,
            output,
            peers,
            port,
            recheck,
        } => {
            let config = Config {
                listen_port: port,
                ..Config::default()
            };
            let downloader = Downloader::new(&torrent, output, config).await?;
            if recheck {
                downloader.recheck().await?;
            }

            let peers = if peers.is_empty() {
                downloader.discover_peers().await?
            } else {
                peers
            };
            let summary = downloader.run(peers).await?;
            info!(
                downloaded = summary.downloaded,
                resumed = summary.resumed,
                total = summary.total,
                "done"
            );
        }
        Command::Seed {
            torrent,
            file,
            port,
            cache,
            upload_limit,
        } => {
            let config = Config {
                listen_port: port,
                upload_limit,
                ..Config::default()
            };
            let torrent = tds_core::parse_torrent(&torrent)?;
            let seeder = Arc::new(Seeder::from_cache(torrent, file, cache, config).await?);
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

            tokio::select! {
                res = seeder.clone().listen(addr) => res?,
                _ = tokio::signal::ctrl_c() => {
                    info!(uploaded = seeder.uploaded(), "Ctrl+C received, shutting down");
                }
            }
        }
    }
    Ok(())
}
