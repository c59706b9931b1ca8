use thiserror::Error;

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

#[derive(Debug, PartialEq, Eq, Clone, Error)]
pub enum HandshakeError {
    #[error("handshake is {0} bytes, expected {HANDSHAKE_LEN}")]
    TooShort(usize),
    #[error("protocol string length is {0}, expected 19")]
    ProtocolLength(u8),
    #[error("protocol identifier does not match")]
    ProtocolMismatch,
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut handshake = [0u8; HANDSHAKE_LEN];
        handshake[0] = PROTOCOL.len() as u8;
        handshake[1..20].copy_from_slice(PROTOCOL);
        handshake[20..28].copy_from_slice(&self.reserved);
        handshake[28..48].copy_from_slice(&self.info_hash);
        handshake[48..68].copy_from_slice(&self.peer_id);
        handshake
    }

    pub fn read(handshake_buf: &[u8]) -> Result<Handshake, HandshakeError> {
        if handshake_buf.len() < HANDSHAKE_LEN {
            return Err(HandshakeError::TooShort(handshake_buf.len()));
        }
        if handshake_buf[0] as usize != PROTOCOL.len() {
            return Err(HandshakeError::ProtocolLength(handshake_buf[0]));
        }
        if &handshake_buf[1..20] != PROTOCOL {
            return Err(HandshakeError::ProtocolMismatch);
        }

        let mut handshake = Handshake::new([0u8; 20], [0u8; 20]);
        handshake.reserved.copy_from_slice(&handshake_buf[20..28]);
        handshake.info_hash.copy_from_slice(&handshake_buf[28..48]);
        handshake.peer_id.copy_from_slice(&handshake_buf[48..68]);
        Ok(handshake)
    }
}
