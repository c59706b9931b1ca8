use std::ops::Range;

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use crate::bencode::{self, Value};
use crate::utils;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetainfoError {
    #[error("not a torrent file: {0}")]
    NotATorrentFile(String),
    #[error("missing key `{0}`")]
    MissingKey(&'static str),
    #[error("invalid value for `{0}`")]
    InvalidField(&'static str),
    #[error("piece table length {0} is not a multiple of 20")]
    CorruptPieceTable(usize),
    #[error("expected {expected} piece hashes, found {found}")]
    PieceCountMismatch { expected: u64, found: usize },
}

/// Typed view over a decoded single-file `.torrent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub name: Option<String>,
    pub length: u64,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    /// SHA-1 of the canonical encoding of the `info` dictionary.
    pub info_hash: [u8; 20],
    raw_info: Bytes,
}

impl TorrentMetadata {
    pub fn parse(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let root = bencode::decode(bytes).map_err(|e| MetainfoError::NotATorrentFile(e.to_string()))?;
        if root.as_dict().is_none() {
            return Err(MetainfoError::NotATorrentFile(
                "top-level value is not a dictionary".to_string(),
            ));
        }

        let announce = root
            .get(b"announce")
            .ok_or(MetainfoError::MissingKey("announce"))?
            .as_str()
            .ok_or(MetainfoError::InvalidField("announce"))?
            .to_string();
        let announce_list = parse_announce_list(root.get(b"announce-list"))?;

        let info = root.get(b"info").ok_or(MetainfoError::MissingKey("info"))?;
        if info.as_dict().is_none() {
            return Err(MetainfoError::InvalidField("info"));
        }

        let length = positive_integer(info, "length")?;
        let piece_length = u32::try_from(positive_integer(info, "piece length")?)
            .map_err(|_| MetainfoError::InvalidField("piece length"))?;

        let pieces = info
            .get(b"pieces")
            .ok_or(MetainfoError::MissingKey("pieces"))?
            .as_bytes()
            .ok_or(MetainfoError::InvalidField("pieces"))?;
        if pieces.len() % 20 != 0 {
            return Err(MetainfoError::CorruptPieceTable(pieces.len()));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut array = [0u8; 20];
                array.copy_from_slice(chunk);
                array
            })
            .collect();

        let expected = length.div_ceil(piece_length as u64);
        if expected != piece_hashes.len() as u64 {
            return Err(MetainfoError::PieceCountMismatch {
                expected,
                found: piece_hashes.len(),
            });
        }

        let name = match info.get(b"name") {
            None => None,
            Some(v) => Some(v.as_str().ok_or(MetainfoError::InvalidField("name"))?.to_string()),
        };

        let canonical = bencode::encode(info);
        let info_hash = utils::sha1(&canonical);
        let raw_info = match raw_value_span(bytes, b"info") {
            Some(span) => Bytes::copy_from_slice(&bytes[span]),
            None => Bytes::from(canonical),
        };
        if utils::sha1(&raw_info) != info_hash {
            warn!("info dictionary is not canonically encoded, info hash may differ from other clients");
        }

        Ok(Self {
            announce,
            announce_list,
            name,
            length,
            piece_length,
            piece_hashes,
            info_hash,
            raw_info,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Logical length of piece `index`; only the last piece may be short.
    pub fn piece_size(&self, index: usize) -> u32 {
        utils::calculate_piece_size(self, index) as u32
    }

    /// Byte range of piece `index` inside the whole file.
    pub fn piece_bounds(&self, index: usize) -> (usize, usize) {
        utils::calculate_bounds_for_piece(self, index)
    }

    /// SHA-1 of the `info` dictionary exactly as it appeared in the file.
    pub fn raw_info_hash(&self) -> [u8; 20] {
        utils::sha1(&self.raw_info)
    }

    /// `announce` followed by every distinct `announce-list` entry.
    pub fn trackers(&self) -> Vec<String> {
        let mut trackers = vec![self.announce.clone()];
        for tracker in self.announce_list.iter().flatten() {
            if !trackers.contains(tracker) {
                trackers.push(tracker.clone());
            }
        }
        trackers
    }
}

pub fn parse_torrent(bytes: &[u8]) -> Result<TorrentMetadata, MetainfoError> {
    TorrentMetadata::parse(bytes)
}

fn positive_integer(info: &Value, key: &'static str) -> Result<u64, MetainfoError> {
    let value = info
        .get(key.as_bytes())
        .ok_or(MetainfoError::MissingKey(key))?
        .as_integer()
        .ok_or(MetainfoError::InvalidField(key))?;
    match u64::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(MetainfoError::InvalidField(key)),
    }
}

fn parse_announce_list(value: Option<&Value>) -> Result<Vec<Vec<String>>, MetainfoError> {
    let Some(value) = value else {
        return Ok(vec![]);
    };
    let invalid = || MetainfoError::InvalidField("announce-list");
    value
        .as_list()
        .ok_or_else(invalid)?
        .iter()
        .map(|tier| {
            tier.as_list()
                .ok_or_else(invalid)?
                .iter()
                .map(|url| url.as_str().map(str::to_string).ok_or_else(invalid))
                .collect()
        })
        .collect()
}

/// Byte range of the value stored under `wanted` in the top-level dictionary
/// of `buf`. The last occurrence wins, as in the decoder.
fn raw_value_span(buf: &[u8], wanted: &[u8]) -> Option<Range<usize>> {
    if buf.first() != Some(&b'd') {
        return None;
    }
    let mut pos = 1;
    let mut span = None;
    while buf.get(pos) != Some(&b'e') {
        let (key, key_len) = bencode::decode_prefix(buf, pos).ok()?;
        pos += key_len;
        let (_, value_len) = bencode::decode_prefix(buf, pos).ok()?;
        if key.as_bytes().map(|k| k.as_ref()) == Some(wanted) {
            span = Some(pos..pos + value_len);
        }
        pos += value_len;
    }
    span
}
