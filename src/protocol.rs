//! Host ↔ mediator frame protocol.
//!
//! # Frame Format
//!
//! ```text
//! | kind (1) | id (8, big-endian) | len (4, big-endian) | payload (len) |
//! ```
//!
//! | Kind | Name | `id` | Payload |
//! |------|------|------|---------|
//! | 0x01 | Control | request id | JSON [`ControlRequest`] |
//! | 0x02 | ControlReply | request id | JSON [`ControlResponse`] |
//! | 0x03 | Command | request id | opaque agent command |
//! | 0x04 | CommandReply | request id | opaque agent reply |
//! | 0x05 | CommandError | request id | UTF-8 error message |
//! | 0x06 | StreamData | stream id | raw bytes |
//! | 0x07 | StreamClose | stream id | empty |
//!
//! # Flow
//!
//! ```text
//! Host                                  Mediator
//!   |  Control{register} id=1              |
//!   |------------------------------------->|
//!   |  ControlReply{ok, streams} id=1      |
//!   |<-------------------------------------|
//!   |  Command id=2  /  Command id=3       |
//!   |------------------------------------->|
//!   |  CommandReply id=3 / CommandReply id=2
//!   |<-------------------------------------|
//!   |  StreamData stream=1  ...            |
//!   |<====================================>|
//! ```
//!
//! Replies carry the id of the request they answer, so several commands
//! may be in flight on one connection and replies may arrive in any order.

use crate::constants::FRAME_HEADER_LEN;
use crate::pod::PodId;
use crate::stream::StreamIds;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// =============================================================================
// Frame
// =============================================================================

/// Frame type tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Control = 0x01,
    ControlReply = 0x02,
    Command = 0x03,
    CommandReply = 0x04,
    CommandError = 0x05,
    StreamData = 0x06,
    StreamClose = 0x07,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0x01 => Self::Control,
            0x02 => Self::ControlReply,
            0x03 => Self::Command,
            0x04 => Self::CommandReply,
            0x05 => Self::CommandError,
            0x06 => Self::StreamData,
            0x07 => Self::StreamClose,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }
}

/// Frame codec error.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Underlying I/O failed or the stream ended mid-frame.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Header carried an unknown kind byte.
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),

    /// Header announced a payload above the configured limit.
    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
}

impl From<FrameError> for crate::Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => crate::Error::Io(e),
            other => crate::Error::Protocol(other.to_string()),
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Request id or stream id, depending on `kind`.
    pub id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame.
    #[must_use]
    pub fn new(kind: FrameKind, id: u64, payload: Vec<u8>) -> Self {
        Self { kind, id, payload }
    }

    /// Creates a control request frame.
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn control(id: u64, request: &ControlRequest) -> Result<Self, serde_json::Error> {
        Ok(Self::new(FrameKind::Control, id, serde_json::to_vec(request)?))
    }

    /// Creates a control reply frame.
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn control_reply(id: u64, response: &ControlResponse) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            FrameKind::ControlReply,
            id,
            serde_json::to_vec(response)?,
        ))
    }

    #[must_use]
    pub fn stream_data(stream_id: u64, bytes: Vec<u8>) -> Self {
        Self::new(FrameKind::StreamData, stream_id, bytes)
    }

    #[must_use]
    pub fn stream_close(stream_id: u64) -> Self {
        Self::new(FrameKind::StreamClose, stream_id, Vec::new())
    }

    /// Encodes header and payload into one buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Writes the frame in a single `write_all` and flushes.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }

    /// Reads one frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Io`] on I/O failure or EOF inside a frame
    /// - [`FrameError::UnknownKind`] for an unknown kind byte
    /// - [`FrameError::TooLarge`] if the payload exceeds `max_payload`
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(
        reader: &mut R,
        max_payload: usize,
    ) -> Result<Option<Self>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut filled = 0;
        while filled < FRAME_HEADER_LEN {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FrameError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }

        let kind = FrameKind::try_from(header[0])?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&header[1..9]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&header[9..13]);
        let len = u32::from_be_bytes(len) as usize;
        if len > max_payload {
            return Err(FrameError::TooLarge {
                len,
                max: max_payload,
            });
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Some(Self::new(kind, u64::from_be_bytes(id), payload)))
    }
}

// =============================================================================
// Control Messages
// =============================================================================

/// Session control request from host to mediator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Create a session and assign stream ids for `containers`.
    Register {
        pod: PodId,
        namespace: String,
        name: String,
        containers: Vec<String>,
    },
    /// Attach to an existing session.
    Connect { pod: PodId },
    /// Destroy a session.
    Unregister { pod: PodId },
}

/// Mediator reply to a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok(SessionPayload),
    Error(ErrorPayload),
}

impl ControlResponse {
    /// Success with no stream data (unregister).
    #[must_use]
    pub fn ok() -> Self {
        Self::Ok(SessionPayload::default())
    }

    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }
}

/// Stream assignments for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    /// One triple per registered container, in request order.
    #[serde(default)]
    pub streams: Vec<StreamIds>,
    /// The pod's primary (sandbox) stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<StreamIds>,
}

/// Error reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Control error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionExists,
    SessionNotFound,
    InvalidRequest,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_FRAME_PAYLOAD;

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new(FrameKind::Command, 0x0102, b"hi".to_vec());
        let bytes = frame.encode();
        assert_eq!(bytes.len(), FRAME_HEADER_LEN + 2);
        assert_eq!(bytes[0], 0x03);
        assert_eq!(&bytes[1..9], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        assert_eq!(&bytes[9..13], &[0, 0, 0, 2]);
        assert_eq!(&bytes[13..], b"hi");
    }

    #[tokio::test]
    async fn test_read_sequence_then_eof() {
        let mut wire = Frame::stream_data(7, b"abc".to_vec()).encode();
        wire.extend(Frame::stream_close(7).encode());
        let mut reader = wire.as_slice();

        let first = Frame::read_from(&mut reader, MAX_FRAME_PAYLOAD).await.unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::StreamData);
        assert_eq!(first.payload, b"abc");
        let second = Frame::read_from(&mut reader, MAX_FRAME_PAYLOAD).await.unwrap().unwrap();
        assert_eq!(second, Frame::stream_close(7));
        assert!(Frame::read_from(&mut reader, MAX_FRAME_PAYLOAD).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_rejects_bad_frames() {
        let mut unknown = Frame::stream_close(1).encode();
        unknown[0] = 0x7f;
        let err = Frame::read_from(&mut unknown.as_slice(), MAX_FRAME_PAYLOAD).await.unwrap_err();
        assert!(matches!(err, FrameError::UnknownKind(0x7f)));

        let big = Frame::stream_data(1, vec![0; 32]).encode();
        let err = Frame::read_from(&mut big.as_slice(), 16).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 32, max: 16 }));

        let truncated = &Frame::stream_data(1, vec![0; 8]).encode()[..5];
        let err = Frame::read_from(&mut &truncated[..], MAX_FRAME_PAYLOAD).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_control_json_shape() {
        let req = ControlRequest::Connect { pod: PodId::new("web") };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"action\":\"connect\""));

        let resp = ControlResponse::error(ErrorCode::SessionNotFound, "no such pod");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"status\":\"error\""));
        assert!(json.contains("\"code\":\"session_not_found\""));

        let parsed: ControlResponse =
            serde_json::from_str(r#"{"status":"ok","streams":[{"stdin":1,"stdout":2,"stderr":3}]}"#)
                .unwrap();
        match parsed {
            ControlResponse::Ok(payload) => {
                assert_eq!(payload.streams.len(), 1);
                assert!(payload.primary.is_none());
            }
            ControlResponse::Error(_) => panic!("expected ok"),
        }
    }
}
