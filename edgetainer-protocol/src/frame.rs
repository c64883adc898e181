//! Control-channel framing
//!
//! The control channel carries newline-delimited JSON: command envelopes in
//! one direction, responses and heartbeats in the other. SSH preserves byte
//! order within a channel, so a simple line framing is enough; the buffer
//! enforces a size cap so a misbehaving peer cannot grow memory unbounded.

use crate::{
    envelope::ResponseEnvelope, heartbeat::HeartbeatPayload, CommandEnvelope, Error, Result,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Upper bound for a single frame. Command payloads are small; compose files
/// are the largest legitimate content.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Encode one value as a newline-terminated JSON frame.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one frame (without the trailing newline).
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame)
        .map_err(|e| Error::Protocol(format!("malformed frame: {e}")))
}

/// Traffic a device sends upstream on the control channel.
///
/// The two shapes have disjoint required fields (`command_id` vs
/// `device_id`), so the untagged decode is unambiguous.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ControlMessage {
    Response(ResponseEnvelope),
    Heartbeat(HeartbeatPayload),
}

/// Incremental frame decoder over SSH channel data.
///
/// Channel data arrives in arbitrary chunks; callers append whatever they got
/// and drain complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw channel bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, or `None` when more bytes are needed.
    ///
    /// An unterminated frame beyond [`MAX_FRAME_LEN`] is a protocol error;
    /// the buffer is cleared so the connection can be torn down cleanly.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
            frame.pop(); // trailing newline
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
            return Ok(Some(frame));
        }

        if self.buf.len() > MAX_FRAME_LEN {
            let len = self.buf.len();
            self.buf.clear();
            return Err(Error::Protocol(format!(
                "frame exceeds {MAX_FRAME_LEN} bytes ({len} buffered without terminator)"
            )));
        }

        Ok(None)
    }

    /// Drain and decode every complete frame currently buffered.
    pub fn drain_decoded<T: DeserializeOwned>(&mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame()? {
            if frame.is_empty() {
                continue;
            }
            out.push(decode(&frame)?);
        }
        Ok(out)
    }
}

/// Convenience: encode a command envelope for the control channel.
pub fn encode_command(envelope: &CommandEnvelope) -> Result<Vec<u8>> {
    encode(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CommandPayload, GetStatusCommand};
    use crate::heartbeat::AgentStatus;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_split_frames_reassemble() {
        let hb = HeartbeatPayload {
            device_id: "dev-A".into(),
            status: AgentStatus::Ok,
            timestamp: Utc::now(),
            ip: None,
            version: "0.3.0".into(),
            metrics: None,
            containers: None,
        };
        let bytes = encode(&hb).unwrap();
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        let mut buffer = FrameBuffer::new();
        buffer.extend(head);
        assert!(buffer.next_frame().unwrap().is_none());

        buffer.extend(tail);
        let frame = buffer.next_frame().unwrap().unwrap();
        let decoded: HeartbeatPayload = decode(&frame).unwrap();
        assert_eq!(decoded, hb);
        assert!(buffer.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut chunk = Vec::new();
        for i in 0..3 {
            let resp = ResponseEnvelope::err(Uuid::new_v4(), "execute", format!("fail {i}"));
            chunk.extend(encode(&resp).unwrap());
        }

        let mut buffer = FrameBuffer::new();
        buffer.extend(&chunk);
        let decoded: Vec<ResponseEnvelope> = buffer.drain_decoded().unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[2].message, "fail 2");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&vec![b'x'; MAX_FRAME_LEN + 1]);
        let err = buffer.next_frame().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        // Buffer is cleared so teardown is clean.
        buffer.extend(b"{}\n");
        assert!(buffer.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_control_message_disambiguation() {
        let resp = ResponseEnvelope::err(Uuid::new_v4(), "restart", "no such stack");
        let frame = encode(&resp).unwrap();
        let msg: ControlMessage = decode(&frame[..frame.len() - 1]).unwrap();
        assert!(matches!(msg, ControlMessage::Response(_)));

        let hb = HeartbeatPayload {
            device_id: "dev-A".into(),
            status: AgentStatus::Error,
            timestamp: Utc::now(),
            ip: None,
            version: "0.3.0".into(),
            metrics: None,
            containers: None,
        };
        let frame = encode(&hb).unwrap();
        let msg: ControlMessage = decode(&frame[..frame.len() - 1]).unwrap();
        assert!(matches!(msg, ControlMessage::Heartbeat(_)));
    }

    #[test]
    fn test_command_roundtrip_over_frames() {
        let payload = CommandPayload::GetStatus(GetStatusCommand::default());
        let envelope = CommandEnvelope::new(&payload).unwrap();
        let bytes = encode_command(&envelope).unwrap();

        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes);
        let decoded: Vec<CommandEnvelope> = buffer.drain_decoded().unwrap();
        assert_eq!(decoded, vec![envelope]);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"\r\n\n");
        let decoded: Vec<serde_json::Value> = buffer.drain_decoded().unwrap();
        assert!(decoded.is_empty());
    }
}
