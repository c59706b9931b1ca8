use std::time::Duration;

use crate::utils::{self, BLOCK_SIZE};

pub const DEFAULT_PORT: u16 = 6881;
const CONNECT_TIMEOUT: u64 = 6;
const HANDSHAKE_TIMEOUT: u64 = 3;
const READ_TIMEOUT: u64 = 10;

/// Settings shared by sessions and the downloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub peer_id: [u8; 20],
    pub port: u16,
    /// Bytes per Request; 16 KiB is what every client expects.
    pub block_size: u32,
    /// Requests kept in flight per connection. 1 means strictly one at a time.
    pub pipeline_depth: usize,
    /// Upper bound on concurrent peer connections.
    pub parallelism: usize,
    /// Attempts per piece before the download gives up.
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: utils::generate_peer_id(),
            port: DEFAULT_PORT,
            block_size: BLOCK_SIZE,
            pipeline_depth: 5,
            parallelism: 5,
            max_retries: 3,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT),
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT),
            read_timeout: Duration::from_secs(READ_TIMEOUT),
        }
    }
}

impl Config {
    pub fn with_peer_id(mut self, peer_id: [u8; 20]) -> Self {
        self.peer_id = peer_id;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth.max(1);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, handshake: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.handshake_timeout = handshake;
        self.read_timeout = read;
        self
    }
}
