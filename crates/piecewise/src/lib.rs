pub mod bencode;
pub mod bitfield;
pub mod client;
pub mod config;
pub mod download;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod protocol;
pub mod torrent;
pub mod tracker;
pub mod utils;

pub use bencode::{BencodeError, Value};
pub use client::{Client, Connector, TcpConnector};
pub use config::Config;
pub use download::{download_file, download_piece, fetch_piece, DownloadError, Downloader, FailureKind};
pub use peer::PeerAddress;
pub use protocol::{PeerSession, SessionError, SessionState};
pub use torrent::{MetainfoError, TorrentMetadata};
pub use tracker::{announce, ReqwestHttp, TrackerError};
