use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{MsgReadWriter, Packet, TransportConfig, TransportError};

/// Write one frame: `len (4B BE) || code || payload`, where `len` counts the
/// code byte plus the payload.
pub async fn write_framed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), TransportError> {
    let len = u32::try_from(packet.payload.len() + 1).map_err(|_| {
        TransportError::MessageTooLarge {
            size: packet.payload.len(),
            max: u32::MAX as usize - 1,
        }
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[packet.code]).await?;
    writer.write_all(&packet.payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, refusing payloads larger than `max_size`.
pub async fn read_framed<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Packet, TransportError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(TransportError::MalformedFrame("missing code byte".into()));
    }
    let payload_len = len - 1;
    if payload_len > max_size {
        return Err(TransportError::MessageTooLarge {
            size: payload_len,
            max: max_size,
        });
    }

    let mut code = [0u8; 1];
    reader.read_exact(&mut code).await?;
    let mut buf = vec![0u8; payload_len];
    reader.read_exact(&mut buf).await?;

    Ok(Packet::new(code[0], buf))
}

/// A framed connection over a split byte stream.
pub struct FramedConn<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    max_message_size: usize,
    closed: CancellationToken,
}

impl<R, W> FramedConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, config: &TransportConfig) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_message_size: config.max_message_size,
            closed: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl FramedConn<OwnedReadHalf, OwnedWriteHalf> {
    /// Wrap an established TCP stream.
    pub fn from_tcp(stream: TcpStream, config: &TransportConfig) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {e}");
        }
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, config)
    }
}

#[async_trait::async_trait]
impl<R, W> MsgReadWriter for FramedConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_msg(&self) -> Result<Packet, TransportError> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            res = read_framed(&mut *reader, self.max_message_size) => {
                if let Err(e) = &res {
                    if !e.is_closed() {
                        tracing::debug!("frame read failed: {e}");
                    }
                }
                res
            }
        }
    }

    async fn write_msg(&self, packet: Packet) -> Result<(), TransportError> {
        if packet.size() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: packet.size(),
                max: self.max_message_size,
            });
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            res = write_framed(&mut *writer, &packet) => res,
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
