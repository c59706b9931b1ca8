use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder};

const PEER_SIZE: usize = 6;

/// An IPv4 peer as listed in a compact tracker response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(pub SocketAddrV4);

impl PeerAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        PeerAddress(SocketAddrV4::new(ip, port))
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<PeerAddress> for SocketAddr {
    fn from(peer: PeerAddress) -> Self {
        SocketAddr::V4(peer.0)
    }
}

impl FromStr for PeerAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(PeerAddress)
    }
}

/// Splits a compact peer list into addresses. Returns `None` when the length
/// is not a multiple of six.
pub fn parse_compact_peers(peers_bin: &[u8]) -> Option<Vec<PeerAddress>> {
    if peers_bin.len() % PEER_SIZE != 0 {
        return None;
    }
    let peers = peers_bin
        .chunks_exact(PEER_SIZE)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = BigEndian::read_u16(&chunk[4..6]);
            PeerAddress::new(ip, port)
        })
        .collect();
    Some(peers)
}
