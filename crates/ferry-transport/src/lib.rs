//! Ferry wire layer.
//!
//! Moves coded packets (`code` byte + opaque payload) between two peers.
//! The protocol layer only ever sees the [`MsgReadWriter`] trait; this crate
//! provides a length-prefixed framing over any tokio byte stream and an
//! in-memory pipe used by decorators and tests.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use ferry_transport::{FramedConn, MsgReadWriter, Packet, TransportConfig};
//!
//! # async fn example() -> Result<(), ferry_transport::TransportError> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:30303").await?;
//! let conn = FramedConn::from_tcp(stream, &TransportConfig::new());
//! conn.write_msg(Packet::new(1, b"hello".to_vec())).await?;
//! let reply = conn.read_msg().await?;
//! println!("code {} with {} bytes", reply.code, reply.size());
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod framed;
mod pipe;

pub use config::{TransportConfig, DEFAULT_MAX_MESSAGE_SIZE, MAX_MESSAGE_SIZE};
pub use error::TransportError;
pub use framed::{read_framed, write_framed, FramedConn};
pub use pipe::{msg_pipe, MsgPipeEnd};

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use bytes::Bytes;

/// One unit on the wire: a single-byte code plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Bidirectional packet stream to one remote peer.
///
/// Reads and writes may happen concurrently from different tasks. After
/// [`close`](MsgReadWriter::close) every pending and future call returns
/// [`TransportError::Closed`].
#[async_trait::async_trait]
pub trait MsgReadWriter: Send + Sync {
    /// Wait for the next inbound packet.
    async fn read_msg(&self) -> Result<Packet, TransportError>;

    /// Send one packet.
    async fn write_msg(&self, packet: Packet) -> Result<(), TransportError>;

    /// Tear the connection down.
    fn close(&self);
}

/// Remote node identity (32 bytes), displayed and parsed as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| TransportError::InvalidPeerId(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| TransportError::InvalidPeerId(format!("{} bytes", v.len())))?;
        Ok(Self(bytes))
    }
}

/// What the session layer tells us about the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemotePeer {
    pub id: PeerId,
    pub ip: Option<IpAddr>,
}

impl RemotePeer {
    pub fn new(id: PeerId, ip: Option<IpAddr>) -> Self {
        Self { id, ip }
    }
}
