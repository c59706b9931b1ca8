use std::fmt::Display;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageId {
    MsgChoke = 0,
    MsgUnchoke = 1,
    MsgInterested = 2,
    MsgNotInterested = 3,
    MsgHave = 4,
    MsgBitfield = 5,
    MsgRequest = 6,
    MsgPiece = 7,
    MsgCancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = MessageError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        let message_id = match id {
            0 => MessageId::MsgChoke,
            1 => MessageId::MsgUnchoke,
            2 => MessageId::MsgInterested,
            3 => MessageId::MsgNotInterested,
            4 => MessageId::MsgHave,
            5 => MessageId::MsgBitfield,
            6 => MessageId::MsgRequest,
            7 => MessageId::MsgPiece,
            8 => MessageId::MsgCancel,
            _ => return Err(MessageError::InvalidMessageId(id)),
        };
        Ok(message_id)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id = match self {
            MessageId::MsgChoke => "CHOKE",
            MessageId::MsgUnchoke => "UNCHOKE",
            MessageId::MsgInterested => "INTERESTED",
            MessageId::MsgNotInterested => "NOT_INTERESTED",
            MessageId::MsgHave => "HAVE",
            MessageId::MsgBitfield => "BITFIELD",
            MessageId::MsgRequest => "REQUEST",
            MessageId::MsgPiece => "PIECE",
            MessageId::MsgCancel => "CANCEL",
        };
        write!(f, "{}", id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("invalid message id {0}")]
    InvalidMessageId(u8),
    #[error("invalid {id} payload of {len} bytes")]
    InvalidPayload { id: MessageId, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceChunk {
    pub index: u32,
    pub begin: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(BlockRequest),
    Piece(PieceChunk),
    Cancel(BlockRequest),
}

impl Message {
    /// `None` for keep-alives, which carry no id byte.
    pub fn id(&self) -> Option<MessageId> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::MsgChoke,
            Message::Unchoke => MessageId::MsgUnchoke,
            Message::Interested => MessageId::MsgInterested,
            Message::NotInterested => MessageId::MsgNotInterested,
            Message::Have(_) => MessageId::MsgHave,
            Message::Bitfield(_) => MessageId::MsgBitfield,
            Message::Request(_) => MessageId::MsgRequest,
            Message::Piece(_) => MessageId::MsgPiece,
            Message::Cancel(_) => MessageId::MsgCancel,
        };
        Some(id)
    }

    /// Parses one frame body, i.e. everything after the length prefix.
    pub fn parse(frame: &[u8]) -> Result<Message, MessageError> {
        let Some((&id, payload)) = frame.split_first() else {
            return Ok(Message::KeepAlive);
        };
        let id = MessageId::try_from(id)?;
        let invalid = || MessageError::InvalidPayload {
            id,
            len: payload.len(),
        };

        let message = match id {
            MessageId::MsgChoke => Message::Choke,
            MessageId::MsgUnchoke => Message::Unchoke,
            MessageId::MsgInterested => Message::Interested,
            MessageId::MsgNotInterested => Message::NotInterested,
            MessageId::MsgHave => {
                if payload.len() != 4 {
                    return Err(invalid());
                }
                Message::Have(BigEndian::read_u32(payload))
            }
            MessageId::MsgBitfield => Message::Bitfield(payload.to_vec()),
            MessageId::MsgRequest => Message::Request(parse_block_request(payload).ok_or_else(invalid)?),
            MessageId::MsgCancel => Message::Cancel(parse_block_request(payload).ok_or_else(invalid)?),
            MessageId::MsgPiece => {
                if payload.len() < 8 {
                    return Err(invalid());
                }
                Message::Piece(PieceChunk {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    data: payload[8..].to_vec(),
                })
            }
        };
        Ok(message)
    }
}

fn parse_block_request(payload: &[u8]) -> Option<BlockRequest> {
    if payload.len() != 12 {
        return None;
    }
    Some(BlockRequest {
        index: BigEndian::read_u32(&payload[0..4]),
        begin: BigEndian::read_u32(&payload[4..8]),
        length: BigEndian::read_u32(&payload[8..12]),
    })
}

fn block_request_payload(request: &BlockRequest) -> Vec<u8> {
    let mut payload = vec![0u8; 12];
    BigEndian::write_u32(&mut payload[0..4], request.index);
    BigEndian::write_u32(&mut payload[4..8], request.begin);
    BigEndian::write_u32(&mut payload[8..12], request.length);
    payload
}

pub fn format_request(index: u32, begin: u32, length: u32) -> Message {
    Message::Request(BlockRequest {
        index,
        begin,
        length,
    })
}

/// Wire form: `[u32 length][u8 id][payload]`, or four zero bytes for a
/// keep-alive.
pub fn serialize(msg: &Message) -> Vec<u8> {
    let payload = match msg {
        Message::KeepAlive => return vec![0, 0, 0, 0],
        Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
            vec![]
        }
        Message::Have(index) => index.to_be_bytes().to_vec(),
        Message::Bitfield(payload) => payload.clone(),
        Message::Request(request) | Message::Cancel(request) => block_request_payload(request),
        Message::Piece(piece) => {
            let mut payload = Vec::with_capacity(8 + piece.data.len());
            payload.extend_from_slice(&piece.index.to_be_bytes());
            payload.extend_from_slice(&piece.begin.to_be_bytes());
            payload.extend_from_slice(&piece.data);
            payload
        }
    };
    let id = msg.id().map(|id| id as u8).unwrap_or_default();

    let length = payload.len() + 1;
    let mut buf = vec![0u8; 4];
    BigEndian::write_u32(&mut buf, length as u32);
    buf.push(id);
    buf.extend_from_slice(&payload);
    buf
}
