use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use flume::{Receiver, Sender};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::bitfield::Bitfield;
use crate::client::{Client, Connector};
use crate::config::Config;
use crate::peer::PeerAddress;
use crate::protocol::{PeerSession, SessionError};
use crate::torrent::TorrentMetadata;
use crate::utils;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("piece {index} failed its checksum")]
    PieceChecksumFailed { index: u32 },
    #[error("peer does not have piece {0}")]
    PeerMissingPiece(u32),
    #[error("unexpected block: piece {index} offset {begin} length {length}")]
    UnexpectedBlock { index: u32, begin: u32, length: usize },
    #[error("piece index {0} is out of range")]
    InvalidPieceIndex(u32),
    #[error("piece {index} failed after {attempts} attempts ({kind})")]
    PieceFailed {
        index: u32,
        kind: FailureKind,
        attempts: u32,
    },
    #[error("no usable peers left, {remaining} pieces missing")]
    NoPeers { remaining: usize },
    #[error("download cancelled")]
    Cancelled,
}

/// Why a piece attempt failed, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    ConnectionReset,
    Protocol,
    Checksum,
    MissingPiece,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionReset => "connection reset",
            FailureKind::Protocol => "protocol violation",
            FailureKind::Checksum => "checksum mismatch",
            FailureKind::MissingPiece => "piece not offered",
        };
        write!(f, "{}", kind)
    }
}

impl DownloadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DownloadError::Session(SessionError::Timeout) => FailureKind::Timeout,
            DownloadError::Session(SessionError::ConnectionReset | SessionError::Io(_)) => {
                FailureKind::ConnectionReset
            }
            DownloadError::PieceChecksumFailed { .. } => FailureKind::Checksum,
            DownloadError::PeerMissingPiece(_) => FailureKind::MissingPiece,
            DownloadError::PieceFailed { kind, .. } => *kind,
            _ => FailureKind::Protocol,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PieceWork {
    pub index: u32,
    pub length: u32,
    pub hash: [u8; 20],
}

impl PieceWork {
    pub fn new(torrent: &TorrentMetadata, index: usize) -> Self {
        PieceWork {
            index: index as u32,
            length: torrent.piece_size(index),
            hash: torrent.piece_hashes[index],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PieceResult {
    pub index: u32,
    pub length: u32,
    pub buf: Vec<u8>,
}

/// Downloads and verifies one piece over an unchoked session.
pub async fn download_piece<S>(
    session: &mut PeerSession<S>,
    torrent: &TorrentMetadata,
    index: u32,
    config: &Config,
) -> Result<PieceResult, DownloadError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if index as usize >= torrent.piece_count() {
        return Err(DownloadError::InvalidPieceIndex(index));
    }
    let pw = PieceWork::new(torrent, index as usize);
    download_work(session, &pw, config).await
}

async fn download_from_client<S>(
    client: &mut Client<S>,
    pw: &PieceWork,
    config: &Config,
) -> Result<PieceResult, DownloadError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if !client.bitfield.has_piece(pw.index as usize) {
        return Err(DownloadError::PeerMissingPiece(pw.index));
    }
    download_work(&mut client.session, pw, config).await
}

async fn download_work<S>(
    session: &mut PeerSession<S>,
    pw: &PieceWork,
    config: &Config,
) -> Result<PieceResult, DownloadError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let depth = config.pipeline_depth.max(1);
    let mut buf = vec![0u8; pw.length as usize];
    let mut pending = utils::blocks(pw.length, config.block_size).into_iter();
    // begin offset -> requested length
    let mut in_flight: HashMap<u32, u32> = HashMap::with_capacity(depth);
    let mut downloaded = 0u32;

    while downloaded < pw.length {
        while in_flight.len() < depth {
            let Some((begin, length)) = pending.next() else {
                break;
            };
            session.send_request(pw.index, begin, length).await?;
            in_flight.insert(begin, length);
        }

        let chunk = session.recv_piece().await?;
        let requested = if chunk.index == pw.index {
            in_flight.remove(&chunk.begin)
        } else {
            None
        };
        match requested {
            Some(length) if length as usize == chunk.data.len() => {
                let begin = chunk.begin as usize;
                buf[begin..begin + chunk.data.len()].copy_from_slice(&chunk.data);
                downloaded += length;
            }
            _ => {
                return Err(DownloadError::UnexpectedBlock {
                    index: chunk.index,
                    begin: chunk.begin,
                    length: chunk.data.len(),
                })
            }
        }
    }

    if !utils::check_integrity(&pw.hash, &buf) {
        return Err(DownloadError::PieceChecksumFailed { index: pw.index });
    }

    Ok(PieceResult {
        index: pw.index,
        length: pw.length,
        buf,
    })
}

/// Tries `peers` in order until one of them delivers a verified `index`.
pub async fn fetch_piece<C: Connector>(
    connector: &C,
    torrent: &TorrentMetadata,
    peers: &[PeerAddress],
    index: u32,
    config: &Config,
) -> Result<PieceResult, DownloadError> {
    if index as usize >= torrent.piece_count() {
        return Err(DownloadError::InvalidPieceIndex(index));
    }
    let pw = PieceWork::new(torrent, index as usize);
    let mut last_error = DownloadError::NoPeers { remaining: 1 };

    for &peer in peers {
        let result = match Client::connect(connector, peer, torrent.info_hash, config).await {
            Ok(mut client) => download_from_client(&mut client, &pw, config).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(piece) => return Ok(piece),
            Err(e) => {
                warn!(%peer, error = %e, "piece {} attempt failed", index);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// One verified piece landing in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub index: u32,
    pub length: u32,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug)]
enum WorkerEvent {
    Verified(PieceResult),
    /// An attempt failed and the piece went back on the queue.
    Retrying {
        index: u32,
        kind: FailureKind,
        attempts: u32,
    },
    Failed {
        index: u32,
        kind: FailureKind,
        attempts: u32,
    },
}

struct Worker<C> {
    id: usize,
    torrent: Arc<TorrentMetadata>,
    config: Config,
    connector: Arc<C>,
    peers: Receiver<PeerAddress>,
    peers_tx: Sender<PeerAddress>,
    work_tx: Sender<PieceWork>,
    work_rx: Receiver<PieceWork>,
    events: Sender<WorkerEvent>,
    attempts: Arc<DashMap<u32, u32>>,
    peer_failures: Arc<DashMap<PeerAddress, u32>>,
    cancel: CancellationToken,
}

impl<C: Connector> Worker<C> {
    async fn run(self) -> Result<(), DownloadError> {
        loop {
            let Ok(peer) = self.peers.try_recv() else {
                debug!(worker = self.id, "no peers left");
                return Ok(());
            };

            let info_hash = self.torrent.info_hash;
            let connect = Client::connect(&*self.connector, peer, info_hash, &self.config);
            let mut client = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                client = connect => match client {
                    Ok(client) => client,
                    Err(e) => {
                        debug!(%peer, error = %e, "could not set up peer");
                        continue;
                    }
                },
            };

            // Consecutive pieces this peer did not have.
            let mut misses = 0usize;
            loop {
                let pw = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    pw = self.work_rx.recv_async() => match pw {
                        Ok(pw) => pw,
                        Err(_) => return Ok(()),
                    },
                };

                let result = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    result = download_from_client(&mut client, &pw, &self.config) => result,
                };

                match result {
                    Ok(piece) => {
                        misses = 0;
                        debug!(%peer, index = piece.index, "piece verified");
                        if self.events.send(WorkerEvent::Verified(piece)).is_err() {
                            return Ok(());
                        }
                    }
                    Err(DownloadError::PeerMissingPiece(_)) => {
                        misses += 1;
                        if self.work_tx.send(pw).is_err() {
                            return Ok(());
                        }
                        if misses > self.work_rx.len() {
                            debug!(%peer, "peer has none of the missing pieces");
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                    Err(e) => {
                        if !self.retry(pw, &e) {
                            return Ok(());
                        }
                        if self.reconnect_later(peer) {
                            debug!(%peer, error = %e, "reconnecting to peer");
                        } else {
                            warn!(%peer, error = %e, "dropping peer");
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Puts `pw` back on the queue, or reports it failed once it has used up
    /// its attempts. Returns false when the download is over.
    fn retry(&self, pw: PieceWork, error: &DownloadError) -> bool {
        let attempts = {
            let mut entry = self.attempts.entry(pw.index).or_insert(0);
            *entry += 1;
            *entry
        };

        if attempts >= self.config.max_retries {
            let failed = WorkerEvent::Failed {
                index: pw.index,
                kind: error.kind(),
                attempts,
            };
            let _ = self.events.send(failed);
            return false;
        }

        debug!(index = pw.index, attempts, "requeueing piece");
        let retrying = WorkerEvent::Retrying {
            index: pw.index,
            kind: error.kind(),
            attempts,
        };
        self.events.send(retrying).is_ok() && self.work_tx.send(pw).is_ok()
    }

    /// Puts a peer whose session broke back on the peer queue, unless it has
    /// already failed `max_retries` times.
    fn reconnect_later(&self, peer: PeerAddress) -> bool {
        let failures = {
            let mut entry = self.peer_failures.entry(peer).or_insert(0);
            *entry += 1;
            *entry
        };
        failures < self.config.max_retries && self.peers_tx.send(peer).is_ok()
    }
}

/// Downloads a whole torrent into memory with a pool of peer workers.
///
/// Verified pieces are remembered, so calling [`Downloader::run`] again after
/// a failure or cancellation only fetches what is still missing.
pub struct Downloader {
    torrent: Arc<TorrentMetadata>,
    config: Config,
    output: Vec<u8>,
    have: Bitfield,
    progress_tx: Sender<Progress>,
    progress_rx: Receiver<Progress>,
}

impl Downloader {
    pub fn new(torrent: TorrentMetadata, config: Config) -> Self {
        let (progress_tx, progress_rx) = flume::unbounded();
        Self {
            output: vec![0u8; torrent.length as usize],
            have: Bitfield::with_pieces(torrent.piece_count()),
            torrent: Arc::new(torrent),
            config,
            progress_tx,
            progress_rx,
        }
    }

    /// Receives one [`Progress`] per verified piece.
    pub fn progress(&self) -> Receiver<Progress> {
        self.progress_rx.clone()
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn missing(&self) -> usize {
        self.torrent.piece_count() - self.have.count()
    }

    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn into_output(self) -> Vec<u8> {
        self.output
    }

    pub async fn run<C: Connector>(
        &mut self,
        connector: Arc<C>,
        peers: Vec<PeerAddress>,
        cancel: CancellationToken,
    ) -> Result<(), DownloadError> {
        let mut remaining = self.missing();
        if remaining == 0 {
            return Ok(());
        }
        if peers.is_empty() {
            return Err(DownloadError::NoPeers { remaining });
        }

        let (pw_tx, pw_rx) = flume::unbounded::<PieceWork>();
        (0..self.torrent.piece_count())
            .filter(|&index| !self.have.has_piece(index))
            .map(|index| PieceWork::new(&self.torrent, index))
            .for_each(|pw| {
                let _ = pw_tx.send(pw);
            });

        let workers = self.config.parallelism.max(1).min(peers.len());
        let (peer_tx, peer_rx) = flume::unbounded::<PeerAddress>();
        for peer in peers {
            let _ = peer_tx.send(peer);
        }

        let (event_tx, event_rx) = flume::unbounded::<WorkerEvent>();
        let attempts = Arc::new(DashMap::new());
        let peer_failures = Arc::new(DashMap::new());
        let workers_cancel = cancel.child_token();
        info!(pieces = remaining, workers, "starting download");

        let handles = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    torrent: self.torrent.clone(),
                    config: self.config.clone(),
                    connector: connector.clone(),
                    peers: peer_rx.clone(),
                    peers_tx: peer_tx.clone(),
                    work_tx: pw_tx.clone(),
                    work_rx: pw_rx.clone(),
                    events: event_tx.clone(),
                    attempts: attempts.clone(),
                    peer_failures: peer_failures.clone(),
                    cancel: workers_cancel.clone(),
                };
                utils::spawn(info_span!("worker", id), worker.run())
            })
            .collect::<Vec<_>>();
        drop(event_tx);
        drop(peer_tx);

        // Latest failure of each piece that is still missing.
        let mut failures: HashMap<u32, (FailureKind, u32)> = HashMap::new();
        let result = loop {
            if remaining == 0 {
                break Ok(());
            }
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(DownloadError::Cancelled),
                event = event_rx.recv_async() => event,
            };
            match event {
                Ok(WorkerEvent::Verified(piece)) => {
                    failures.remove(&piece.index);
                    if self.store(piece) {
                        remaining -= 1;
                    }
                }
                Ok(WorkerEvent::Retrying {
                    index,
                    kind,
                    attempts,
                }) => {
                    failures.insert(index, (kind, attempts));
                }
                Ok(WorkerEvent::Failed {
                    index,
                    kind,
                    attempts,
                }) => {
                    break Err(DownloadError::PieceFailed {
                        index,
                        kind,
                        attempts,
                    })
                }
                // Every worker ran out of peers. Report the piece that was
                // tried the most, if any attempt was made at all.
                Err(_) => {
                    let worst = failures
                        .iter()
                        .max_by_key(|&(&index, &(_, attempts))| (attempts, Reverse(index)));
                    break Err(match worst {
                        Some((&index, &(kind, attempts))) => DownloadError::PieceFailed {
                            index,
                            kind,
                            attempts,
                        },
                        None => DownloadError::NoPeers { remaining },
                    });
                }
            }
        };

        workers_cancel.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        match &result {
            Ok(()) => info!("download complete"),
            Err(e) => warn!(error = %e, missing = self.missing(), "download stopped"),
        }
        result
    }

    /// Copies a verified piece into place. Returns false for duplicates.
    fn store(&mut self, piece: PieceResult) -> bool {
        let index = piece.index as usize;
        if self.have.has_piece(index) {
            return false;
        }
        let (start, end) = self.torrent.piece_bounds(index);
        self.output[start..end].copy_from_slice(&piece.buf);
        self.have.set_piece(index);

        let _ = self.progress_tx.send(Progress {
            index: piece.index,
            length: piece.length,
            completed: self.have.count(),
            total: self.torrent.piece_count(),
        });
        true
    }
}

/// Downloads the whole file from `peers` and returns its bytes.
pub async fn download_file<C: Connector>(
    connector: C,
    torrent: &TorrentMetadata,
    peers: &[PeerAddress],
    config: &Config,
) -> Result<Vec<u8>, DownloadError> {
    let mut downloader = Downloader::new(torrent.clone(), config.clone());
    downloader
        .run(Arc::new(connector), peers.to_vec(), CancellationToken::new())
        .await?;
    Ok(downloader.into_output())
}
