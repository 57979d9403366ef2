//! Connection session
//!
//! Owns the TCP socket to the server:
//! - Connect with timeout and write the magic number handshake
//! - Frame and write outbound message bodies
//! - Hand the read half to the listener
//! - Idempotent close

use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::NetworkConfig;
use crate::protocol::{hex_preview, CodecError, FrameEncoder, MAGIC_NUMBER};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(std::io::Error),

    #[error("Connection timeout")]
    Timeout,

    #[error("Session closed")]
    Closed,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// State of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake sent, frames may flow
    Connected,
    /// Socket released
    Closed,
}

/// Session statistics
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Frames sent
    pub frames_sent: u64,
    /// Bytes sent, prefixes and handshake included
    pub bytes_sent: u64,
}

/// Destination for framed message bodies
#[async_trait]
pub trait FrameSink: Send {
    /// Frame `body` and deliver it in order
    async fn send_frame(&mut self, body: &[u8]) -> SessionResult<()>;
}

/// An open connection to the server
pub struct Session {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// Read half, until taken by the listener
    reader: Option<OwnedReadHalf>,
    /// Write half, `None` once closed
    writer: Option<OwnedWriteHalf>,
    /// Frame encoder
    encoder: FrameEncoder,
    /// Write buffer
    write_buf: BytesMut,
    /// Statistics
    stats: SessionStats,
}

impl Session {
    /// Resolve `host`, connect and send the handshake
    pub async fn connect(host: &str, port: u16, config: &NetworkConfig) -> SessionResult<Self> {
        let addr = super::resolve_host(host, port).await?;
        Self::connect_addr(addr, config).await
    }

    /// Connect to a resolved address and send the handshake
    pub async fn connect_addr(addr: SocketAddr, config: &NetworkConfig) -> SessionResult<Self> {
        tracing::info!("Connecting to {}", addr);

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::Timeout)??;
        stream.set_nodelay(true)?;

        let mut session = Self::from_stream(stream, addr, config);
        session.handshake().await?;

        tracing::info!("Connected to {}", addr);
        Ok(session)
    }

    fn from_stream(stream: TcpStream, remote_addr: SocketAddr, config: &NetworkConfig) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            remote_addr,
            reader: Some(reader),
            writer: Some(writer),
            encoder: FrameEncoder::new(config.length_prefix),
            write_buf: BytesMut::with_capacity(1024),
            stats: SessionStats::default(),
        }
    }

    /// One-way announcement; the server sends no acknowledgement
    async fn handshake(&mut self) -> SessionResult<()> {
        let writer = self.writer.as_mut().ok_or(SessionError::Closed)?;
        let magic = MAGIC_NUMBER.to_le_bytes();

        writer
            .write_all(&magic)
            .await
            .map_err(SessionError::HandshakeFailed)?;
        writer.flush().await.map_err(SessionError::HandshakeFailed)?;

        self.stats.bytes_sent += magic.len() as u64;
        tracing::info!("Magic number {:#010X} sent", MAGIC_NUMBER);
        Ok(())
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        if self.writer.is_some() {
            SessionState::Connected
        } else {
            SessionState::Closed
        }
    }

    /// Get session statistics
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Take the read half for the listener (only once)
    pub fn take_reader(&mut self) -> Option<OwnedReadHalf> {
        self.reader.take()
    }

    /// Frame and write one message body
    pub async fn send_frame(&mut self, body: &[u8]) -> SessionResult<()> {
        let writer = self.writer.as_mut().ok_or(SessionError::Closed)?;

        self.write_buf.clear();
        self.encoder.encode(body, &mut self.write_buf)?;

        tracing::debug!(
            "Sending {} byte frame: {}",
            self.write_buf.len(),
            hex_preview(&self.write_buf, 32)
        );

        writer.write_all(&self.write_buf).await?;
        writer.flush().await?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;
        Ok(())
    }

    /// Release the socket
    ///
    /// Returns `true` if this call closed the session and `false` if it was
    /// already closed. Shutdown errors are logged, never returned.
    pub async fn close(&mut self) -> bool {
        let reader = self.reader.take();
        let Some(mut writer) = self.writer.take() else {
            return false;
        };

        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Socket shutdown for {} failed: {}", self.remote_addr, e);
        }
        drop(reader);

        tracing::info!(
            "Session to {} closed ({} frames, {} bytes sent)",
            self.remote_addr,
            self.stats.frames_sent,
            self.stats.bytes_sent
        );
        true
    }
}

#[async_trait]
impl FrameSink for Session {
    async fn send_frame(&mut self, body: &[u8]) -> SessionResult<()> {
        Session::send_frame(self, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_state, encode_state, Entity, LengthPrefix, Node, Vec3, Vec4};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn loopback() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn node(id: u64) -> Entity {
        Entity::Node(Node {
            id,
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Vec4::IDENTITY,
            velocity: Vec3::ZERO,
            error: 0.0,
        })
    }

    #[tokio::test]
    async fn test_handshake_then_frame() {
        let (listener, addr) = loopback().await;
        let config = NetworkConfig::default();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut magic = [0u8; 4];
            socket.read_exact(&mut magic).await.unwrap();

            let len = socket.read_u32_le().await.unwrap() as usize;
            let mut body = vec![0u8; len];
            socket.read_exact(&mut body).await.unwrap();
            (magic, body)
        });

        let mut session = Session::connect_addr(addr, &config).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        let body = encode_state(&[node(42)]).unwrap();
        session.send_frame(&body).await.unwrap();

        let (magic, received) = server.await.unwrap();
        assert_eq!(magic, [0x45, 0x69, 0x47, 0x23]);
        assert_eq!(decode_state(&received).unwrap(), vec![node(42)]);
        assert_eq!(session.stats().frames_sent, 1);
        assert_eq!(session.stats().bytes_sent, (4 + 4 + body.len()) as u64);
    }

    #[tokio::test]
    async fn test_inclusive_prefix_on_the_wire() {
        let (listener, addr) = loopback().await;
        let config = NetworkConfig {
            length_prefix: LengthPrefix::Inclusive,
            ..Default::default()
        };

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _magic = socket.read_u32_le().await.unwrap();
            socket.read_u32_le().await.unwrap()
        });

        let mut session = Session::connect_addr(addr, &config).await.unwrap();
        session.send_frame(&[0u8; 10]).await.unwrap();
        assert_eq!(server.await.unwrap(), 14);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (listener, addr) = loopback().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut session = Session::connect_addr(addr, &NetworkConfig::default())
            .await
            .unwrap();
        let (mut socket, _) = accept.await.unwrap();

        assert!(session.take_reader().is_some());
        assert!(session.take_reader().is_none());

        assert!(session.close().await);
        assert!(!session.close().await);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.send_frame(&[1, 2, 3]).await,
            Err(SessionError::Closed)
        ));

        // Peer sees the magic number then end of stream
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, MAGIC_NUMBER.to_le_bytes());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, addr) = loopback().await;
        drop(listener);

        let result = Session::connect_addr(addr, &NetworkConfig::default()).await;
        assert!(matches!(
            result,
            Err(SessionError::Io(_)) | Err(SessionError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_connect_resolves_host() {
        let (listener, addr) = loopback().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut session = Session::connect("127.0.0.1", addr.port(), &NetworkConfig::default())
            .await
            .unwrap();
        assert_eq!(session.remote_addr(), addr);
        assert!(session.close().await);
        accept.await.unwrap();
    }
}
