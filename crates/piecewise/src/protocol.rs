use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bitfield::Bitfield;
use crate::config::Config;
use crate::handshake::{Handshake, HandshakeError, HANDSHAKE_LEN};
use crate::message::{self, Message, MessageError, PieceChunk};

/// Largest frame accepted from a peer. A bitfield for a million pieces still
/// fits.
pub const MAX_MESSAGE_LEN: usize = 1 << 21;

/// Progress of one peer connection. Steps only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    HandshakeSent,
    HandshakeVerified,
    AwaitingBitfield,
    BitfieldReceived,
    InterestedSent,
    AwaitingUnchoke,
    Unchoked,
    RequestSent,
    PieceReceived,
    Done,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    ConnectionReset,
    #[error("timed out waiting for peer")]
    Timeout,
    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(HandshakeError),
    #[error("peer answered for a different info hash")]
    InfoHashMismatch,
    #[error("expected {expected} message, received {received}")]
    UnexpectedMessage {
        expected: &'static str,
        received: String,
    },
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("message of {0} bytes exceeds the frame limit")]
    MessageTooLong(usize),
    #[error("not allowed in state {actual:?}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },
}

impl SessionError {
    fn unexpected(expected: &'static str, received: &Message) -> Self {
        SessionError::UnexpectedMessage {
            expected,
            received: received
                .id()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "KEEP_ALIVE".to_string()),
        }
    }
}

/// Folds the I/O errors a dropped or silent peer produces into the transport
/// variants the downloader retries on.
pub fn io_error(e: std::io::Error) -> SessionError {
    match e.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => SessionError::ConnectionReset,
        ErrorKind::TimedOut => SessionError::Timeout,
        _ => SessionError::Io(e),
    }
}

async fn with_deadline<T>(
    deadline: Instant,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T, SessionError> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(io_error(e)),
        Err(_) => Err(SessionError::Timeout),
    }
}

/// One peer-wire connection: handshake, framing, and the strict
/// bitfield → interested → unchoke → request/piece sequence.
///
/// Any error moves the session to [`SessionState::Done`]; a failed session
/// is never reused.
#[derive(Debug)]
pub struct PeerSession<S> {
    stream: S,
    state: SessionState,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    handshake_timeout: Duration,
    read_timeout: Duration,
    outstanding: usize,
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, info_hash: [u8; 20], config: &Config) -> Self {
        Self {
            stream,
            state: SessionState::Connected,
            info_hash,
            peer_id: config.peer_id,
            handshake_timeout: config.handshake_timeout,
            read_timeout: config.read_timeout,
            outstanding: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Requests sent whose Piece has not arrived yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub async fn handshake(&mut self) -> Result<Handshake, SessionError> {
        self.expect_state(&[SessionState::Connected], "connected")?;
        let result = self.exchange_handshake().await;
        self.settle(result)
    }

    pub async fn recv_bitfield(&mut self) -> Result<Bitfield, SessionError> {
        self.expect_state(
            &[SessionState::HandshakeVerified, SessionState::AwaitingBitfield],
            "handshake verified",
        )?;
        self.state = SessionState::AwaitingBitfield;
        let result = match self.next_message().await {
            Ok(Message::Bitfield(bytes)) => {
                debug!(len = bytes.len(), "received bitfield");
                self.state = SessionState::BitfieldReceived;
                Ok(Bitfield::new(bytes))
            }
            Ok(other) => Err(SessionError::unexpected("bitfield", &other)),
            Err(e) => Err(e),
        };
        self.settle(result)
    }

    pub async fn send_interested(&mut self) -> Result<(), SessionError> {
        self.expect_state(&[SessionState::BitfieldReceived], "bitfield received")?;
        let result = self.write_message(&Message::Interested).await;
        if result.is_ok() {
            self.state = SessionState::InterestedSent;
        }
        self.settle(result)
    }

    pub async fn recv_unchoke(&mut self) -> Result<(), SessionError> {
        self.expect_state(
            &[SessionState::InterestedSent, SessionState::AwaitingUnchoke],
            "interested sent",
        )?;
        self.state = SessionState::AwaitingUnchoke;
        let result = match self.next_message().await {
            Ok(Message::Unchoke) => {
                debug!("peer unchoked us");
                self.state = SessionState::Unchoked;
                Ok(())
            }
            Ok(other) => Err(SessionError::unexpected("unchoke", &other)),
            Err(e) => Err(e),
        };
        self.settle(result)
    }

    pub async fn send_request(
        &mut self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<(), SessionError> {
        self.expect_state(
            &[
                SessionState::Unchoked,
                SessionState::RequestSent,
                SessionState::PieceReceived,
            ],
            "unchoked",
        )?;
        trace!(index, begin, length, "requesting block");
        let msg = message::format_request(index, begin, length);
        let result = self.write_message(&msg).await;
        if result.is_ok() {
            self.outstanding += 1;
            self.state = SessionState::RequestSent;
        }
        self.settle(result)
    }

    pub async fn recv_piece(&mut self) -> Result<PieceChunk, SessionError> {
        self.expect_state(
            &[SessionState::RequestSent, SessionState::PieceReceived],
            "request sent",
        )?;
        if self.outstanding == 0 {
            return Err(SessionError::InvalidState {
                expected: "outstanding request",
                actual: self.state,
            });
        }
        let result = match self.next_message().await {
            Ok(Message::Piece(chunk)) => {
                trace!(index = chunk.index, begin = chunk.begin, len = chunk.data.len(), "received block");
                self.outstanding -= 1;
                self.state = SessionState::PieceReceived;
                Ok(chunk)
            }
            Ok(other) => Err(SessionError::unexpected("piece", &other)),
            Err(e) => Err(e),
        };
        self.settle(result)
    }

    /// Shuts the write half down and ends the session.
    pub async fn close(&mut self) {
        self.state = SessionState::Done;
        let _ = self.stream.shutdown().await;
    }

    fn expect_state(
        &self,
        allowed: &[SessionState],
        expected: &'static str,
    ) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn settle<T>(&mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if result.is_err() {
            self.state = SessionState::Done;
        }
        result
    }

    async fn exchange_handshake(&mut self) -> Result<Handshake, SessionError> {
        let deadline = Instant::now() + self.handshake_timeout;
        let handshake = Handshake::new(self.info_hash, self.peer_id);
        with_deadline(deadline, self.stream.write_all(&handshake.serialize())).await?;
        self.state = SessionState::HandshakeSent;

        let mut reply = [0u8; HANDSHAKE_LEN];
        let read = with_deadline(deadline, read_full(&mut self.stream, &mut reply)).await?;
        let remote = Handshake::read(&reply[..read]).map_err(SessionError::HandshakeMismatch)?;
        if remote.info_hash != self.info_hash {
            return Err(SessionError::InfoHashMismatch);
        }

        debug!(peer_id = %String::from_utf8_lossy(&remote.peer_id), "handshake verified");
        self.state = SessionState::HandshakeVerified;
        Ok(remote)
    }

    /// Next message that is not a keep-alive. Keep-alives do not extend the
    /// read timeout.
    async fn next_message(&mut self) -> Result<Message, SessionError> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            match self.read_message(deadline).await? {
                Message::KeepAlive => trace!("keep-alive"),
                msg => return Ok(msg),
            }
        }
    }

    async fn read_message(&mut self, deadline: Instant) -> Result<Message, SessionError> {
        let mut length_buf = [0u8; 4];
        with_deadline(deadline, self.stream.read_exact(&mut length_buf)).await?;

        let length = BigEndian::read_u32(&length_buf) as usize;
        if length > MAX_MESSAGE_LEN {
            return Err(SessionError::MessageTooLong(length));
        }

        let mut msg_bytes = vec![0u8; length];
        with_deadline(deadline, self.stream.read_exact(&mut msg_bytes)).await?;
        Ok(Message::parse(&msg_bytes)?)
    }

    async fn write_message(&mut self, msg: &Message) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.read_timeout;
        let msg_bytes = message::serialize(msg);
        with_deadline(deadline, self.stream.write_all(&msg_bytes)).await
    }
}

/// Reads until `buf` is full or the peer closes; returns the bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::PROTOCOL;
    use crate::message::BlockRequest;
    use tokio::io::DuplexStream;

    const INFO_HASH: [u8; 20] = [7u8; 20];
    const REMOTE_ID: [u8; 20] = *b"-XX0001-remotepeerid";

    fn session() -> (PeerSession<DuplexStream>, DuplexStream) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let config = Config::default()
            .with_peer_id([1u8; 20])
            .with_timeouts(
                Duration::from_secs(1),
                Duration::from_millis(500),
                Duration::from_millis(500),
            );
        (PeerSession::new(client, INFO_HASH, &config), server)
    }

    async fn answer_handshake(server: &mut DuplexStream, reply: &[u8]) {
        let mut handshake = [0u8; HANDSHAKE_LEN];
        server.read_exact(&mut handshake).await.unwrap();
        assert_eq!(handshake[0], 19);
        assert_eq!(&handshake[1..20], PROTOCOL);
        assert_eq!(&handshake[28..48], &INFO_HASH);
        assert_eq!(&handshake[48..68], &[1u8; 20]);
        server.write_all(reply).await.unwrap();
    }

    async fn read_frame(server: &mut DuplexStream) -> Message {
        let mut len = [0u8; 4];
        server.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; BigEndian::read_u32(&len) as usize];
        server.read_exact(&mut body).await.unwrap();
        Message::parse(&body).unwrap()
    }

    fn good_reply() -> [u8; HANDSHAKE_LEN] {
        Handshake::new(INFO_HASH, REMOTE_ID).serialize()
    }

    #[tokio::test]
    async fn walks_every_state() {
        let (mut session, mut server) = session();
        let peer = tokio::spawn(async move {
            answer_handshake(&mut server, &good_reply()).await;
            server.write_all(&message::serialize(&Message::KeepAlive)).await.unwrap();
            server
                .write_all(&message::serialize(&Message::Bitfield(vec![0b1000_0000])))
                .await
                .unwrap();
            assert_eq!(read_frame(&mut server).await, Message::Interested);
            server.write_all(&message::serialize(&Message::Unchoke)).await.unwrap();
            assert_eq!(
                read_frame(&mut server).await,
                Message::Request(BlockRequest {
                    index: 0,
                    begin: 0,
                    length: 4
                })
            );
            let piece = Message::Piece(PieceChunk {
                index: 0,
                begin: 0,
                data: vec![1, 2, 3, 4],
            });
            server.write_all(&message::serialize(&piece)).await.unwrap();
            server
        });

        assert_eq!(session.state(), SessionState::Connected);
        let remote = session.handshake().await.unwrap();
        assert_eq!(remote.peer_id, REMOTE_ID);
        assert_eq!(session.state(), SessionState::HandshakeVerified);

        let bitfield = session.recv_bitfield().await.unwrap();
        assert!(bitfield.has_piece(0));
        assert_eq!(session.state(), SessionState::BitfieldReceived);

        session.send_interested().await.unwrap();
        assert_eq!(session.state(), SessionState::InterestedSent);

        session.recv_unchoke().await.unwrap();
        assert_eq!(session.state(), SessionState::Unchoked);

        session.send_request(0, 0, 4).await.unwrap();
        assert_eq!(session.state(), SessionState::RequestSent);
        assert_eq!(session.outstanding(), 1);

        let chunk = session.recv_piece().await.unwrap();
        assert_eq!(chunk.data, vec![1, 2, 3, 4]);
        assert_eq!(session.state(), SessionState::PieceReceived);
        assert_eq!(session.outstanding(), 0);

        session.close().await;
        assert_eq!(session.state(), SessionState::Done);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn bad_protocol_identifier_fails_before_messages() {
        let (mut session, mut server) = session();
        let mut reply = good_reply();
        reply[1..20].copy_from_slice(b"BitTorrent protocoX");
        let peer = tokio::spawn(async move {
            answer_handshake(&mut server, &reply).await;
            server
                .write_all(&message::serialize(&Message::Bitfield(vec![0xff])))
                .await
                .unwrap();
            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let err = session.handshake().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::HandshakeMismatch(HandshakeError::ProtocolMismatch)
        ));
        assert_eq!(session.state(), SessionState::Done);
        assert!(matches!(
            session.recv_bitfield().await,
            Err(SessionError::InvalidState { .. })
        ));

        drop(session);
        // Nothing was sent after the handshake.
        assert!(peer.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn short_handshake_reply_is_a_mismatch() {
        let (mut session, mut server) = session();
        tokio::spawn(async move {
            answer_handshake(&mut server, &good_reply()[..30]).await;
        });
        let err = session.handshake().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::HandshakeMismatch(HandshakeError::TooShort(30))
        ));
    }

    #[tokio::test]
    async fn wrong_info_hash_is_rejected() {
        let (mut session, mut server) = session();
        let reply = Handshake::new([9u8; 20], REMOTE_ID).serialize();
        tokio::spawn(async move {
            answer_handshake(&mut server, &reply).await;
            server
        });
        assert!(matches!(
            session.handshake().await,
            Err(SessionError::InfoHashMismatch)
        ));
    }

    #[tokio::test]
    async fn bitfield_must_come_first() {
        let (mut session, mut server) = session();
        tokio::spawn(async move {
            answer_handshake(&mut server, &good_reply()).await;
            server.write_all(&message::serialize(&Message::Unchoke)).await.unwrap();
            server
        });
        session.handshake().await.unwrap();
        match session.recv_bitfield().await {
            Err(SessionError::UnexpectedMessage { expected, received }) => {
                assert_eq!(expected, "bitfield");
                assert_eq!(received, "UNCHOKE");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Done);
    }

    #[tokio::test]
    async fn unchoke_must_follow_interested() {
        let (mut session, mut server) = session();
        tokio::spawn(async move {
            answer_handshake(&mut server, &good_reply()).await;
            server
                .write_all(&message::serialize(&Message::Bitfield(vec![0xff])))
                .await
                .unwrap();
            read_frame(&mut server).await;
            server.write_all(&message::serialize(&Message::Have(3))).await.unwrap();
            server
        });
        session.handshake().await.unwrap();
        session.recv_bitfield().await.unwrap();
        session.send_interested().await.unwrap();
        assert!(matches!(
            session.recv_unchoke().await,
            Err(SessionError::UnexpectedMessage {
                expected: "unchoke",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn only_a_piece_may_answer_a_request() {
        for reply in [Message::Have(1), Message::Choke] {
            let (mut session, mut server) = session();
            let sent = message::serialize(&reply);
            tokio::spawn(async move {
                answer_handshake(&mut server, &good_reply()).await;
                server
                    .write_all(&message::serialize(&Message::Bitfield(vec![0xff])))
                    .await
                    .unwrap();
                read_frame(&mut server).await;
                server.write_all(&message::serialize(&Message::Unchoke)).await.unwrap();
                read_frame(&mut server).await;
                server.write_all(&sent).await.unwrap();
                server
            });
            session.handshake().await.unwrap();
            session.recv_bitfield().await.unwrap();
            session.send_interested().await.unwrap();
            session.recv_unchoke().await.unwrap();
            session.send_request(0, 0, 4).await.unwrap();

            match session.recv_piece().await {
                Err(SessionError::UnexpectedMessage { expected, received }) => {
                    assert_eq!(expected, "piece");
                    assert_eq!(received, reply.id().unwrap().to_string());
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(session.state(), SessionState::Done);
        }
    }

    #[tokio::test]
    async fn steps_cannot_be_skipped() {
        let (mut session, _server) = session();
        assert!(matches!(
            session.send_interested().await,
            Err(SessionError::InvalidState {
                actual: SessionState::Connected,
                ..
            })
        ));
        assert!(matches!(
            session.send_request(0, 0, 1).await,
            Err(SessionError::InvalidState { .. })
        ));
        assert!(matches!(
            session.recv_piece().await,
            Err(SessionError::InvalidState { .. })
        ));
        // Rejected calls leave the session usable.
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn truncated_frame_is_connection_reset() {
        let (mut session, mut server) = session();
        tokio::spawn(async move {
            answer_handshake(&mut server, &good_reply()).await;
            server.write_all(&[0, 0, 0, 10, 5, 0xff, 0xff]).await.unwrap();
        });
        session.handshake().await.unwrap();
        assert!(matches!(
            session.recv_bitfield().await,
            Err(SessionError::ConnectionReset)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut session, mut server) = session();
        tokio::spawn(async move {
            answer_handshake(&mut server, &good_reply()).await;
            server.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
            server
        });
        session.handshake().await.unwrap();
        assert!(matches!(
            session.recv_bitfield().await,
            Err(SessionError::MessageTooLong(_))
        ));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (mut session, mut server) = session();
        let peer = tokio::spawn(async move {
            answer_handshake(&mut server, &good_reply()).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            server
        });
        session.handshake().await.unwrap();
        assert!(matches!(
            session.recv_bitfield().await,
            Err(SessionError::Timeout)
        ));
        peer.abort();
    }

    #[tokio::test]
    async fn keep_alives_do_not_extend_the_read_timeout() {
        let (mut session, mut server) = session();
        let peer = tokio::spawn(async move {
            answer_handshake(&mut server, &good_reply()).await;
            server
                .write_all(&message::serialize(&Message::Bitfield(vec![0xff])))
                .await
                .unwrap();
            read_frame(&mut server).await;
            // Always inside the 500ms window, never an unchoke.
            let keep_alive = message::serialize(&Message::KeepAlive);
            while server.write_all(&keep_alive).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        });
        session.handshake().await.unwrap();
        session.recv_bitfield().await.unwrap();
        session.send_interested().await.unwrap();

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(3), session.recv_unchoke())
            .await
            .expect("recv_unchoke kept waiting");
        assert!(matches!(result, Err(SessionError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(session.state(), SessionState::Done);
        peer.abort();
    }
}
