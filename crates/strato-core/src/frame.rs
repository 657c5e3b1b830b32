//! Node-bus frame envelope and frame IO.
//!
//! Frames come in three kinds (Command, Event, Error), each carrying a
//! typed payload. On the wire a frame is a length-prefixed JSON document;
//! the TLS/certificate session layer below this sits outside the core.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::payloads::*;

/// Maximum frame size on the node bus (1 MiB).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Commands travel controller → fleet, except STATS and CONFIGURE which
/// node agents also send up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "snake_case")]
pub enum Command {
    Start(StartPayload),
    Stop(InstanceCommandPayload),
    Restart(StartPayload),
    Delete(InstanceCommandPayload),
    Evacuate(EvacuatePayload),
    AttachVolume(VolumeCommandPayload),
    DetachVolume(VolumeCommandPayload),
    AssignPublicIp(PublicIpPayload),
    ReleasePublicIp(PublicIpPayload),
    Stats(StatsPayload),
    Configure(ConfigurePayload),
}

/// Events travel fleet → controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "snake_case")]
pub enum Event {
    NodeConnected(NodePayload),
    NodeDisconnected(NodePayload),
    InstanceDeleted(InstanceEventPayload),
    InstanceStopped(InstanceEventPayload),
    ConcentratorInstanceAdded(ConcentratorPayload),
    TraceReport(TraceReportPayload),
    PublicIpAssigned(PublicIpPayload),
    PublicIpUnassigned(PublicIpPayload),
    TenantAdded(TenantEventPayload),
    TenantRemoved(TenantEventPayload),
}

/// Asynchronous command failures reported by the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "snake_case")]
pub enum NodeError {
    StartFailure(StartFailurePayload),
    StopFailure(InstanceFailurePayload),
    RestartFailure(InstanceFailurePayload),
    DeleteFailure(InstanceFailurePayload),
    AttachVolumeFailure(VolumeFailurePayload),
    DetachVolumeFailure(VolumeFailurePayload),
    AssignPublicIpFailure(PublicIpFailurePayload),
    UnassignPublicIpFailure(PublicIpFailurePayload),
}

/// Frame envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Frame {
    Command(Command),
    Event(Event),
    Error(NodeError),
}

/// Flat frame discriminant, used to key reply listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Start,
    Stop,
    Restart,
    Delete,
    Evacuate,
    AttachVolume,
    DetachVolume,
    AssignPublicIp,
    ReleasePublicIp,
    Stats,
    Configure,
    NodeConnected,
    NodeDisconnected,
    InstanceDeleted,
    InstanceStopped,
    ConcentratorInstanceAdded,
    TraceReport,
    PublicIpAssigned,
    PublicIpUnassigned,
    TenantAdded,
    TenantRemoved,
    StartFailure,
    StopFailure,
    RestartFailure,
    DeleteFailure,
    AttachVolumeFailure,
    DetachVolumeFailure,
    AssignPublicIpFailure,
    UnassignPublicIpFailure,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Command(c) => match c {
                Command::Start(_) => FrameKind::Start,
                Command::Stop(_) => FrameKind::Stop,
                Command::Restart(_) => FrameKind::Restart,
                Command::Delete(_) => FrameKind::Delete,
                Command::Evacuate(_) => FrameKind::Evacuate,
                Command::AttachVolume(_) => FrameKind::AttachVolume,
                Command::DetachVolume(_) => FrameKind::DetachVolume,
                Command::AssignPublicIp(_) => FrameKind::AssignPublicIp,
                Command::ReleasePublicIp(_) => FrameKind::ReleasePublicIp,
                Command::Stats(_) => FrameKind::Stats,
                Command::Configure(_) => FrameKind::Configure,
            },
            Frame::Event(e) => match e {
                Event::NodeConnected(_) => FrameKind::NodeConnected,
                Event::NodeDisconnected(_) => FrameKind::NodeDisconnected,
                Event::InstanceDeleted(_) => FrameKind::InstanceDeleted,
                Event::InstanceStopped(_) => FrameKind::InstanceStopped,
                Event::ConcentratorInstanceAdded(_) => FrameKind::ConcentratorInstanceAdded,
                Event::TraceReport(_) => FrameKind::TraceReport,
                Event::PublicIpAssigned(_) => FrameKind::PublicIpAssigned,
                Event::PublicIpUnassigned(_) => FrameKind::PublicIpUnassigned,
                Event::TenantAdded(_) => FrameKind::TenantAdded,
                Event::TenantRemoved(_) => FrameKind::TenantRemoved,
            },
            Frame::Error(e) => match e {
                NodeError::StartFailure(_) => FrameKind::StartFailure,
                NodeError::StopFailure(_) => FrameKind::StopFailure,
                NodeError::RestartFailure(_) => FrameKind::RestartFailure,
                NodeError::DeleteFailure(_) => FrameKind::DeleteFailure,
                NodeError::AttachVolumeFailure(_) => FrameKind::AttachVolumeFailure,
                NodeError::DetachVolumeFailure(_) => FrameKind::DetachVolumeFailure,
                NodeError::AssignPublicIpFailure(_) => FrameKind::AssignPublicIpFailure,
                NodeError::UnassignPublicIpFailure(_) => FrameKind::UnassignPublicIpFailure,
            },
        }
    }
}

/// Read a length-prefixed frame body from a tokio AsyncRead.
pub async fn read_frame<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| CoreError::Transient(format!("failed to read frame length: {e}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(CoreError::BadRequest(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| CoreError::Transient(format!("failed to read frame body: {e}")))?;

    Ok(buf)
}

/// Write a length-prefixed frame body to a tokio AsyncWrite.
pub async fn write_frame<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|e| CoreError::Transient(format!("failed to write frame length: {e}")))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| CoreError::Transient(format!("failed to write frame body: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| CoreError::Transient(format!("failed to flush frame: {e}")))?;
    Ok(())
}

/// Serialize and send one frame.
pub async fn send_frame<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<()> {
    let data = serde_json::to_vec(frame)
        .map_err(|e| CoreError::BadRequest(format!("failed to serialize frame: {e}")))?;
    write_frame(writer, &data).await
}

/// Read and deserialize one frame.
pub async fn recv_frame<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Frame> {
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data)
        .map_err(|e| CoreError::BadRequest(format!("failed to deserialize frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn stop_frame() -> Frame {
        Frame::Command(Command::Stop(InstanceCommandPayload {
            instance_id: Uuid::new_v4(),
            node_id: "node-1".into(),
        }))
    }

    #[test]
    fn test_frame_kind_mapping() {
        assert_eq!(stop_frame().kind(), FrameKind::Stop);
        let evt = Frame::Event(Event::NodeConnected(NodePayload {
            node_id: "node-1".into(),
            role: NodeRole::Compute,
        }));
        assert_eq!(evt.kind(), FrameKind::NodeConnected);
    }

    #[test]
    fn test_frame_json_shape() {
        let json = serde_json::to_value(stop_frame()).unwrap();
        assert_eq!(json["kind"], "command");
        assert_eq!(json["body"]["op"], "stop");
        assert_eq!(json["body"]["payload"]["node_id"], "node-1");
    }

    #[test]
    fn test_frame_json_roundtrip() {
        let frame = Frame::Error(NodeError::StartFailure(StartFailurePayload {
            instance_id: Uuid::new_v4(),
            reason: FailureReason::LaunchFailed,
            restart: false,
        }));
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind(), FrameKind::StartFailure);
    }

    #[tokio::test]
    async fn test_frame_io_roundtrip() {
        let frame = stop_frame();
        let mut buf = Vec::new();
        send_frame(&mut buf, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = recv_frame(&mut cursor).await.unwrap();
        assert_eq!(read_back.kind(), FrameKind::Stop);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        let len = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        buf.extend_from_slice(&len);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(recv_frame(&mut cursor).await.is_err());
    }
}
