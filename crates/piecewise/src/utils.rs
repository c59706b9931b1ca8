use rand::Rng;
use tracing::{error, trace, Instrument};

use crate::torrent::TorrentMetadata;

pub const BLOCK_SIZE: u32 = 16384;

pub fn calculate_bounds_for_piece(torrent: &TorrentMetadata, index: usize) -> (usize, usize) {
    let torrent_length = torrent.length as usize;
    let start = (index * torrent.piece_length as usize).min(torrent_length);
    let end = start + torrent.piece_length as usize;

    if end > torrent_length {
        (start, torrent_length)
    } else {
        (start, end)
    }
}

pub fn calculate_piece_size(torrent: &TorrentMetadata, index: usize) -> usize {
    let (start, end) = calculate_bounds_for_piece(torrent, index);
    end - start
}

pub fn calculate_block_size(piece_length: u32, requested: u32, block_size: u32) -> u32 {
    if piece_length - requested < block_size {
        return piece_length - requested;
    };
    block_size
}

/// Splits a piece into consecutive `(begin, length)` blocks of at most
/// `block_size` bytes.
pub fn blocks(piece_length: u32, block_size: u32) -> Vec<(u32, u32)> {
    let mut blocks = Vec::with_capacity(piece_length.div_ceil(block_size) as usize);
    let mut requested = 0;
    while requested < piece_length {
        let length = calculate_block_size(piece_length, requested, block_size);
        blocks.push((requested, length));
        requested += length;
    }
    blocks
}

pub fn sha1(buf: &[u8]) -> [u8; 20] {
    let mut hasher = sha1_smol::Sha1::new();
    hasher.update(buf);
    hasher.digest().bytes()
}

pub fn check_integrity(hash: &[u8], buf: &[u8]) -> bool {
    sha1(buf) == hash
}

/// Azureus-style peer id: client tag followed by random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-PW0100-");
    rand::thread_rng().fill(&mut peer_id[8..]);
    peer_id
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Spawns a future inside `span`, logging when it starts, finishes, or fails.
pub fn spawn<E>(
    span: tracing::Span,
    fut: impl std::future::Future<Output = Result<(), E>> + Send + 'static,
) -> tokio::task::JoinHandle<()>
where
    E: std::fmt::Display + Send + 'static,
{
    let fut = async move {
        trace!("started");
        match fut.await {
            Ok(_) => trace!("finished"),
            Err(e) => error!("finished with error: {}", e),
        }
    };
    tokio::task::spawn(fut.instrument(span))
}
