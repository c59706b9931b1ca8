use std::fmt::Write;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::bencode::{self, BencodeError};
use crate::peer::{self, PeerAddress};
use crate::torrent::TorrentMetadata;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("tracker responded with status {0}")]
    Status(u16),
    #[error("malformed tracker response: {0}")]
    Bencode(#[from] BencodeError),
    #[error("tracker response is not a dictionary")]
    NotADictionary,
    #[error("tracker response has no compact `peers` string")]
    MissingPeers,
    #[error("compact peer list length {0} is not a multiple of 6")]
    MalformedPeers(usize),
    #[error("tracker returned no peers")]
    NoPeers,
    #[error("tracker failure: {0}")]
    Failure(String),
    #[error("no http tracker available")]
    NoTracker,
}

/// Sends a GET to a fully built URL and hands back the response body.
pub trait HttpGet {
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, TrackerError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new() -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

impl HttpGet for ReqwestHttp {
    async fn get(&self, url: &str) -> Result<Vec<u8>, TrackerError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Option<u64>,
    pub peers: Vec<PeerAddress>,
}

/// Percent-encodes raw bytes; unreserved ASCII passes through unchanged.
pub fn url_encode_bytes(content: &[u8]) -> String {
    let mut out = String::with_capacity(content.len() * 3);
    for byte in content {
        match *byte as char {
            '0'..='9' | 'a'..='z' | 'A'..='Z' | '.' | '-' | '_' | '~' => out.push(*byte as char),
            _ => {
                let _ = write!(&mut out, "%{:02X}", byte);
            }
        };
    }
    out
}

pub fn build_tracker_url(
    tracker_url: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> String {
    let separator = if tracker_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        tracker_url,
        separator,
        url_encode_bytes(info_hash),
        url_encode_bytes(peer_id),
        port,
        left,
    )
}

pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = bencode::decode(body)?;
    if value.as_dict().is_none() {
        return Err(TrackerError::NotADictionary);
    }
    if let Some(reason) = value.get(b"failure reason") {
        let reason = String::from_utf8_lossy(reason.as_bytes().map(|b| b.as_ref()).unwrap_or(b""));
        return Err(TrackerError::Failure(reason.into_owned()));
    }

    let peers_bin = value
        .get(b"peers")
        .and_then(|v| v.as_bytes())
        .ok_or(TrackerError::MissingPeers)?;
    let peers = peer::parse_compact_peers(peers_bin)
        .ok_or(TrackerError::MalformedPeers(peers_bin.len()))?;
    if peers.is_empty() {
        return Err(TrackerError::NoPeers);
    }
    let interval = value
        .get(b"interval")
        .and_then(|v| v.as_integer())
        .and_then(|i| u64::try_from(i).ok());

    Ok(AnnounceResponse { interval, peers })
}

/// Announces to a single tracker URL.
pub async fn announce_to<H: HttpGet>(
    http: &H,
    tracker_url: &str,
    torrent: &TorrentMetadata,
    peer_id: &[u8; 20],
    port: u16,
) -> Result<AnnounceResponse, TrackerError> {
    let url = build_tracker_url(tracker_url, &torrent.info_hash, peer_id, port, torrent.length);
    debug!(tracker = tracker_url, "announcing");
    let body = http.get(&url).await?;
    let response = parse_announce_response(&body)?;
    debug!(tracker = tracker_url, peers = response.peers.len(), "tracker answered");
    Ok(response)
}

/// Announces to the torrent's primary tracker and returns its peer list.
pub async fn announce<H: HttpGet>(
    http: &H,
    torrent: &TorrentMetadata,
    peer_id: &[u8; 20],
    port: u16,
) -> Result<Vec<PeerAddress>, TrackerError> {
    Ok(announce_to(http, &torrent.announce, torrent, peer_id, port)
        .await?
        .peers)
}

/// Tries every HTTP tracker of the torrent in order until one answers.
pub async fn announce_any<H: HttpGet>(
    http: &H,
    torrent: &TorrentMetadata,
    peer_id: &[u8; 20],
    port: u16,
) -> Result<AnnounceResponse, TrackerError> {
    let mut last_error = TrackerError::NoTracker;
    let http_trackers = torrent
        .trackers()
        .into_iter()
        .filter(|t| t.starts_with("http://") || t.starts_with("https://"));

    for tracker in http_trackers {
        match announce_to(http, &tracker, torrent, peer_id, port).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                warn!(tracker = tracker.as_str(), error = %e, "tracker announce failed");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use crate::torrent::tests::{info_dict, torrent_bytes};

    #[derive(Default)]
    struct FakeHttp {
        responses: HashMap<String, Vec<u8>>,
        requested: Mutex<Vec<String>>,
    }

    impl FakeHttp {
        fn respond(mut self, prefix: &str, body: &[u8]) -> Self {
            self.responses.insert(prefix.to_string(), body.to_vec());
            self
        }
    }

    impl HttpGet for FakeHttp {
        async fn get(&self, url: &str) -> Result<Vec<u8>, TrackerError> {
            self.requested.lock().unwrap().push(url.to_string());
            self.responses
                .iter()
                .find(|(prefix, _)| url.starts_with(prefix.as_str()))
                .map(|(_, body)| body.clone())
                .ok_or_else(|| TrackerError::Transport("connection refused".into()))
        }
    }

    fn torrent() -> TorrentMetadata {
        TorrentMetadata::parse(&torrent_bytes(info_dict(1000, 500, &[0; 40]))).unwrap()
    }

    #[test]
    fn url_encoding_is_byte_oriented() {
        assert_eq!(url_encode_bytes(b"aZ9.-_~"), "aZ9.-_~");
        assert_eq!(url_encode_bytes(&[0x00, 0xff, b' ', b'%', 0x12]), "%00%FF%20%25%12");
    }

    #[test]
    fn builds_query_string() {
        let info_hash = [0xAB; 20];
        let peer_id = *b"-PW0100-abcdefghijkl";
        let url = build_tracker_url("http://t.example/announce", &info_hash, &peer_id, 6881, 1000);
        assert_eq!(
            url,
            format!(
                "http://t.example/announce?info_hash={}&peer_id=-PW0100-abcdefghijkl&port=6881&uploaded=0&downloaded=0&left=1000&compact=1",
                "%AB".repeat(20)
            )
        );

        let url = build_tracker_url("http://t.example/a?key=1", &info_hash, &peer_id, 1, 2);
        assert!(url.starts_with("http://t.example/a?key=1&info_hash="));
    }

    #[test]
    fn parses_compact_response() {
        let body = b"d8:intervali900e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x00\x50e";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(response.interval, Some(900));
        assert_eq!(
            response.peers,
            vec![
                PeerAddress::new(Ipv4Addr::new(127, 0, 0, 1), 6881),
                PeerAddress::new(Ipv4Addr::new(10, 0, 0, 2), 80),
            ]
        );
    }

    #[test]
    fn rejects_bad_responses() {
        assert!(matches!(
            parse_announce_response(b"d8:intervali900ee"),
            Err(TrackerError::MissingPeers)
        ));
        assert!(matches!(
            parse_announce_response(b"d5:peers5:abcdee"),
            Err(TrackerError::MalformedPeers(5))
        ));
        assert!(matches!(
            parse_announce_response(b"d5:peersld2:ip3:abceee"),
            Err(TrackerError::MissingPeers)
        ));
        assert!(matches!(
            parse_announce_response(b"le"),
            Err(TrackerError::NotADictionary)
        ));
        assert!(matches!(
            parse_announce_response(b"5:peers"),
            Err(TrackerError::NotADictionary)
        ));
        assert!(matches!(
            parse_announce_response(b"d5:peers"),
            Err(TrackerError::Bencode(_))
        ));
        assert!(matches!(
            parse_announce_response(b"d8:intervali900e5:peers0:e"),
            Err(TrackerError::NoPeers)
        ));
        match parse_announce_response(b"d14:failure reason9:forbiddene") {
            Err(TrackerError::Failure(reason)) => assert_eq!(reason, "forbidden"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn announce_sends_raw_info_hash() {
        let torrent = torrent();
        let http = FakeHttp::default().respond(
            "http://tracker.example/announce",
            b"d5:peers6:\x7f\x00\x00\x01\x1a\xe1e",
        );
        let peer_id = [b'x'; 20];

        let peers = announce(&http, &torrent, &peer_id, 6881).await.unwrap();
        assert_eq!(peers, vec![PeerAddress::new(Ipv4Addr::LOCALHOST, 6881)]);

        let requested = http.requested.lock().unwrap();
        assert_eq!(requested.len(), 1);
        assert!(requested[0].contains(&format!("info_hash={}", url_encode_bytes(&torrent.info_hash))));
        assert!(requested[0].contains("left=1000"));
        assert!(requested[0].ends_with("&compact=1"));
    }

    #[tokio::test]
    async fn empty_peer_list_is_an_error() {
        let http = FakeHttp::default().respond("http://tracker.example", b"d5:peers0:e");
        assert!(matches!(
            announce(&http, &torrent(), &[0; 20], 6881).await,
            Err(TrackerError::NoPeers)
        ));
    }

    #[tokio::test]
    async fn announce_any_falls_back() {
        let mut torrent = torrent();
        torrent.announce_list = vec![vec![
            "udp://skipped.example".to_string(),
            "http://backup.example/announce".to_string(),
        ]];
        let http = FakeHttp::default()
            .respond("http://tracker.example", b"d5:peers0:e")
            .respond("http://backup.example", b"d5:peers6:\x0a\x00\x00\x07\x1a\xe1e");

        let response = announce_any(&http, &torrent, &[0; 20], 6881).await.unwrap();
        assert_eq!(
            response.peers,
            vec![PeerAddress::new(Ipv4Addr::new(10, 0, 0, 7), 6881)]
        );
        let requested = http.requested.lock().unwrap();
        assert_eq!(requested.len(), 2);
        assert!(requested[0].starts_with("http://tracker.example/announce?"));
        assert!(requested[1].starts_with("http://backup.example/announce?"));
    }
}
