use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use piecewise::config::DEFAULT_PORT;
use piecewise::tracker::{self, ReqwestHttp};
use piecewise::{bencode, client, utils, Config, PeerAddress, TcpConnector, TorrentMetadata};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod download;

#[derive(Parser, Debug)]
#[command(version, about = "A BitTorrent client for single-file torrents.")]
struct Cli {
    /// Port reported to the tracker
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Peers downloaded from at the same time
    #[arg(long, global = true, default_value_t = 5)]
    parallelism: usize,

    /// Block requests kept in flight per peer
    #[arg(long, global = true, default_value_t = 5)]
    pipeline: usize,

    /// Attempts per piece before giving up
    #[arg(long, global = true, default_value_t = 3)]
    max_retries: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a bencoded value as JSON
    Decode { value: String },
    /// Print what a torrent file describes
    Info { torrent: PathBuf },
    /// Ask the tracker for peers
    Peers { torrent: PathBuf },
    /// Exchange handshakes with one peer and print its id
    Handshake { torrent: PathBuf, peer: PeerAddress },
    /// Download and verify a single piece
    #[command(name = "download_piece")]
    DownloadPiece {
        #[arg(short = 'o')]
        output: PathBuf,
        torrent: PathBuf,
        index: u32,
    },
    /// Download the whole file
    Download {
        #[arg(short = 'o')]
        output: PathBuf,
        torrent: PathBuf,
    },
}

impl Cli {
    fn config(&self) -> Config {
        Config::default()
            .with_port(self.port)
            .with_parallelism(self.parallelism)
            .with_pipeline_depth(self.pipeline)
            .with_max_retries(self.max_retries)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.config();
    match cli.command {
        Command::Decode { value } => {
            let (decoded, _) = bencode::decode_prefix(value.as_bytes(), 0)
                .with_context(|| format!("could not decode {:?}", value))?;
            println!("{}", serde_json::to_string(&decoded)?);
        }
        Command::Info { torrent } => {
            let torrent = read_torrent(&torrent).await?;
            println!("Tracker URL: {}", torrent.announce);
            println!("Length: {}", torrent.length);
            println!("Info Hash: {}", utils::hex(&torrent.info_hash));
            println!("Piece Length: {}", torrent.piece_length);
            println!("Piece Hashes:");
            for hash in &torrent.piece_hashes {
                println!("{}", utils::hex(hash));
            }
        }
        Command::Peers { torrent } => {
            let torrent = read_torrent(&torrent).await?;
            for peer in find_peers(&torrent, &config).await? {
                println!("{}", peer);
            }
        }
        Command::Handshake { torrent, peer } => {
            let torrent = read_torrent(&torrent).await?;
            let connector = TcpConnector::new(&config);
            let remote = client::handshake(&connector, peer, torrent.info_hash, &config)
                .await
                .with_context(|| format!("handshake with {} failed", peer))?;
            println!("Peer ID: {}", utils::hex(&remote.peer_id));
        }
        Command::DownloadPiece {
            output,
            torrent: path,
            index,
        } => {
            let torrent = read_torrent(&path).await?;
            let peers = find_peers(&torrent, &config).await?;
            let connector = TcpConnector::new(&config);
            let piece = piecewise::fetch_piece(&connector, &torrent, &peers, index, &config)
                .await
                .with_context(|| format!("could not download piece {}", index))?;
            write_output(&output, &piece.buf).await?;
            println!("Piece {} downloaded to {}.", index, output.display());
        }
        Command::Download {
            output,
            torrent: path,
        } => {
            let torrent = read_torrent(&path).await?;
            let peers = find_peers(&torrent, &config).await?;
            let buf = download::download_file(torrent, peers, config).await?;
            write_output(&output, &buf).await?;
            println!("Downloaded {} to {}.", path.display(), output.display());
        }
    }
    Ok(())
}

async fn read_torrent(path: &Path) -> Result<TorrentMetadata> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("could not read {}", path.display()))?;
    TorrentMetadata::parse(&bytes).with_context(|| format!("could not parse {}", path.display()))
}

async fn find_peers(torrent: &TorrentMetadata, config: &Config) -> Result<Vec<PeerAddress>> {
    let http = ReqwestHttp::new()?;
    let response = tracker::announce_any(&http, torrent, &config.peer_id, config.port)
        .await
        .context("tracker announce failed")?;
    info!(peers = response.peers.len(), "tracker answered");
    Ok(response.peers)
}

async fn write_output(path: &Path, buf: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .await
        .with_context(|| format!("could not create {}", path.display()))?;
    file.write_all(buf).await?;
    file.sync_all().await?;
    Ok(())
}
