use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::bitfield::Bitfield;
use crate::config::Config;
use crate::handshake::Handshake;
use crate::peer::PeerAddress;
use crate::protocol::{self, PeerSession, SessionError};

/// Opens byte streams to peers. TCP in production, in-memory pipes in tests.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, peer: PeerAddress) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            timeout: config.connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, peer: PeerAddress) -> io::Result<TcpStream> {
        let func = TcpStream::connect(SocketAddr::from(peer));
        match tokio::time::timeout(self.timeout, func).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }
}

/// A peer that completed handshake, bitfield, interested and unchoke, ready
/// for block requests.
#[derive(Debug)]
pub struct Client<S> {
    pub peer: PeerAddress,
    pub peer_id: [u8; 20],
    pub bitfield: Bitfield,
    pub session: PeerSession<S>,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn connect<C>(
        connector: &C,
        peer: PeerAddress,
        info_hash: [u8; 20],
        config: &Config,
    ) -> Result<Self, SessionError>
    where
        C: Connector<Stream = S>,
    {
        let stream = connector.connect(peer).await.map_err(protocol::io_error)?;
        let mut session = PeerSession::new(stream, info_hash, config);

        let handshake = session.handshake().await?;
        let bitfield = session.recv_bitfield().await?;
        session.send_interested().await?;
        session.recv_unchoke().await?;
        debug!(%peer, pieces = bitfield.count(), "peer ready");

        Ok(Self {
            peer,
            peer_id: handshake.peer_id,
            bitfield,
            session,
        })
    }
}

/// Connects and exchanges handshakes only, returning the remote handshake.
pub async fn handshake<C: Connector>(
    connector: &C,
    peer: PeerAddress,
    info_hash: [u8; 20],
    config: &Config,
) -> Result<Handshake, SessionError> {
    let stream = connector.connect(peer).await.map_err(protocol::io_error)?;
    let mut session = PeerSession::new(stream, info_hash, config);
    let remote = session.handshake().await?;
    session.close().await;
    Ok(remote)
}
