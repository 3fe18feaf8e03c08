use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{MsgReadWriter, Packet, TransportError};

/// One end of an in-memory packet pipe.
///
/// Closing either end closes both.
pub struct MsgPipeEnd {
    tx: mpsc::Sender<Packet>,
    rx: Mutex<mpsc::Receiver<Packet>>,
    closed: CancellationToken,
}

/// Create a connected pair of in-memory packet streams.
///
/// Packets written on one end are read, in order, on the other.
pub fn msg_pipe(buffer: usize) -> (MsgPipeEnd, MsgPipeEnd) {
    let (a_tx, a_rx) = mpsc::channel(buffer.max(1));
    let (b_tx, b_rx) = mpsc::channel(buffer.max(1));
    let closed = CancellationToken::new();
    (
        MsgPipeEnd {
            tx: a_tx,
            rx: Mutex::new(b_rx),
            closed: closed.clone(),
        },
        MsgPipeEnd {
            tx: b_tx,
            rx: Mutex::new(a_rx),
            closed,
        },
    )
}

impl MsgPipeEnd {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait::async_trait]
impl MsgReadWriter for MsgPipeEnd {
    async fn read_msg(&self) -> Result<Packet, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            packet = rx.recv() => packet.ok_or(TransportError::Closed),
        }
    }

    async fn write_msg(&self, packet: Packet) -> Result<(), TransportError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            res = self.tx.send(packet) => res.map_err(|_| TransportError::Closed),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for MsgPipeEnd {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_order() {
        let (a, b) = msg_pipe(4);
        for code in 0..4u8 {
            a.write_msg(Packet::new(code, vec![code])).await.unwrap();
        }
        for code in 0..4u8 {
            assert_eq!(b.read_msg().await.unwrap().code, code);
        }
    }

    #[tokio::test]
    async fn closing_one_end_closes_both() {
        let (a, b) = msg_pipe(1);
        a.close();
        assert!(b.is_closed());
        assert!(matches!(b.read_msg().await, Err(TransportError::Closed)));
        assert!(matches!(
            b.write_msg(Packet::new(1, Vec::new())).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn dropping_an_end_closes_the_other() {
        let (a, b) = msg_pipe(1);
        drop(a);
        assert!(matches!(b.read_msg().await, Err(TransportError::Closed)));
    }
}
