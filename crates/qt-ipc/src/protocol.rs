//! Wire format: a 4-byte big-endian length prefix followed by one UTF-8
//! JSON object. Frames beyond the configured maximum are rejected without
//! reading the body.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Default ceiling on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors raised by the framing and protocol layer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Top-level message discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Push,
    Heartbeat,
}

/// Response status carried on `type: response` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// One wire message. Requests and pushes nest an envelope in `data`:
/// `{type: <op or push kind>, data: <payload>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<ResponseStatus>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Inner envelope of a request or push `data` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    /// Build a request, returning the correlation id alongside.
    pub fn request(op: &str, payload: Value) -> (Self, Uuid) {
        let request_id = Uuid::new_v4();
        let msg = Self {
            msg_type: MessageType::Request,
            request_id: Some(request_id),
            data: Some(
                serde_json::to_value(Envelope {
                    kind: op.to_string(),
                    data: payload,
                })
                .expect("envelope serializes"),
            ),
            status: None,
            error: None,
        };
        (msg, request_id)
    }

    pub fn response_ok(request_id: Uuid, data: Value) -> Self {
        Self {
            msg_type: MessageType::Response,
            request_id: Some(request_id),
            data: Some(data),
            status: Some(ResponseStatus::Success),
            error: None,
        }
    }

    pub fn response_err(request_id: Uuid, error: &str) -> Self {
        Self {
            msg_type: MessageType::Response,
            request_id: Some(request_id),
            data: None,
            status: Some(ResponseStatus::Error),
            error: Some(error.to_string()),
        }
    }

    pub fn push(kind: &str, payload: Value) -> Self {
        Self {
            msg_type: MessageType::Push,
            request_id: None,
            data: Some(
                serde_json::to_value(Envelope {
                    kind: kind.to_string(),
                    data: payload,
                })
                .expect("envelope serializes"),
            ),
            status: None,
            error: None,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            msg_type: MessageType::Heartbeat,
            request_id: None,
            data: None,
            status: None,
            error: None,
        }
    }

    /// Decode the request/push envelope from `data`.
    pub fn envelope(&self) -> Option<Envelope> {
        self.data
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

/// Write one framed message.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message, tolerating arbitrary boundaries across reads.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame: usize,
) -> Result<Message, ProtocolError> {
    let mut len_bytes = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_bytes).await {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Err(ProtocolError::Closed),
            _ => Err(ProtocolError::Io(e)),
        };
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_frame {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: max_frame,
        });
    }
    let mut body = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut body).await {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Err(ProtocolError::Closed),
            _ => Err(ProtocolError::Io(e)),
        };
    }
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frame_round_trip() {
        let (msg, request_id) = Message::request("get_account", json!({"account_id": "ACC"}));

        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let back = read_frame(&mut cursor, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(back.msg_type, MessageType::Request);
        assert_eq!(back.request_id, Some(request_id));
        let envelope = back.envelope().unwrap();
        assert_eq!(envelope.kind, "get_account");
        assert_eq!(envelope.data["account_id"], "ACC");
    }

    #[tokio::test]
    async fn split_reads_reassemble() {
        let msg = Message::push("tick", json!({"last_price": 3500.0}));
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).await.unwrap();

        // Feed the frame one byte at a time through a duplex pipe.
        let (mut client, server) = tokio::io::duplex(8);
        let write_task = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for byte in buf {
                client.write_all(&[byte]).await.unwrap();
            }
        });
        let mut server = server;
        let back = read_frame(&mut server, MAX_FRAME_LEN).await.unwrap();
        write_task.await.unwrap();

        assert_eq!(back.msg_type, MessageType::Push);
        assert_eq!(back.envelope().unwrap().kind, "tick");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(64u32).to_be_bytes());
        buf.extend_from_slice(&[b'x'; 64]);
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { len: 64, max: 16 }));
    }

    #[tokio::test]
    async fn eof_maps_to_closed() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let err = read_frame(&mut cursor, MAX_FRAME_LEN).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Closed));
    }
}
