use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};

use strato_core::error::{CoreError, Result};
use strato_core::frame::{self, Frame};

/// One duplex session to the scheduling peer. The TLS/certificate layer
/// wrapping production sessions lives outside the core; implementations
/// here exchange already-authenticated frames.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn send(&self, frame: &Frame) -> Result<()>;
    async fn recv(&self) -> Result<Frame>;
}

/// Length-prefixed JSON frames over a TCP stream.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpTransport {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CoreError::Transient(format!("cannot connect to {addr}: {e}")))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

#[async_trait]
impl NodeTransport for TcpTransport {
    async fn send(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        frame::send_frame(&mut *writer, frame).await
    }

    async fn recv(&self) -> Result<Frame> {
        let mut reader = self.reader.lock().await;
        frame::recv_frame(&mut *reader).await
    }
}

/// In-memory transport for tests: frames sent by the controller surface
/// on `PeerHandle::from_controller`, frames pushed into
/// `PeerHandle::to_controller` arrive on `recv`.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

/// The fake scheduling peer held by a test.
pub struct PeerHandle {
    pub from_controller: mpsc::UnboundedReceiver<Frame>,
    pub to_controller: mpsc::UnboundedSender<Frame>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, PeerHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                inbound: Mutex::new(inbound_rx),
            },
            PeerHandle {
                from_controller: outbound_rx,
                to_controller: inbound_tx,
            },
        )
    }
}

#[async_trait]
impl NodeTransport for ChannelTransport {
    async fn send(&self, frame: &Frame) -> Result<()> {
        self.outbound
            .send(frame.clone())
            .map_err(|_| CoreError::Transient("peer closed".into()))
    }

    async fn recv(&self) -> Result<Frame> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| CoreError::Transient("peer closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_core::frame::Command;
    use strato_core::payloads::InstanceCommandPayload;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_channel_transport_roundtrip() {
        let (transport, mut peer) = ChannelTransport::pair();

        let frame = Frame::Command(Command::Stop(InstanceCommandPayload {
            instance_id: Uuid::new_v4(),
            node_id: "node-1".into(),
        }));
        transport.send(&frame).await.unwrap();
        assert!(peer.from_controller.recv().await.is_some());

        peer.to_controller.send(frame).unwrap();
        transport.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_errors() {
        let (transport, peer) = ChannelTransport::pair();
        drop(peer);
        assert!(transport.recv().await.is_err());
        let frame = Frame::Command(Command::Stop(InstanceCommandPayload {
            instance_id: Uuid::new_v4(),
            node_id: String::new(),
        }));
        assert!(transport.send(&frame).await.is_err());
    }
}
