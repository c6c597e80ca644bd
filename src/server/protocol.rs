//! Protocol messages for client-server communication
//!
//! Uses a simple length-prefixed JSON protocol:
//! - 4 bytes (little-endian u32): message length
//! - N bytes: JSON-encoded message
//!
//! A request carries either a query, answered with exactly one [`Response`],
//! or feedback, which is one-way. Fields are only ever added; unknown fields
//! are ignored on decode.

use crate::index::types::FaceDescriptor;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire protocol version; any other value closes the connection
pub const PROTOCOL_VERSION: u32 = 1;

/// Default cap on a single message body
pub const DEFAULT_MAX_MESSAGE_LEN: u32 = 4 * 1024 * 1024;

/// Framing and decoding failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too large: {len} > {max}")]
    TooLarge { len: u32, max: u32 },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fire-and-forget list of font paths the client just loaded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackData {
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Request from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackData>,
}

impl Request {
    pub fn query(name: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            query: Some(name.into()),
            feedback: None,
        }
    }

    pub fn feedback(paths: Vec<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            query: None,
            feedback: Some(FeedbackData { paths }),
        }
    }
}

/// Response to a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub version: u32,
    #[serde(default)]
    pub faces: Vec<FaceDescriptor>,
}

impl Response {
    pub fn new(faces: Vec<FaceDescriptor>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            faces,
        }
    }
}

/// Serialize a message body (without the length prefix)
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode a request body and check its version
pub fn decode_request(body: &[u8]) -> Result<Request, ProtocolError> {
    let request: Request = serde_json::from_slice(body)?;
    if request.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(request.version));
    }
    Ok(request)
}

/// Decode a response body and check its version
pub fn decode_response(body: &[u8]) -> Result<Response, ProtocolError> {
    let response: Response = serde_json::from_slice(body)?;
    if response.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(response.version));
    }
    Ok(response)
}

fn check_len(len: usize, max: u32) -> Result<u32, ProtocolError> {
    match u32::try_from(len) {
        Ok(len) if len <= max => Ok(len),
        _ => Err(ProtocolError::TooLarge {
            len: u32::try_from(len).unwrap_or(u32::MAX),
            max,
        }),
    }
}

/// Write a message to a stream with length prefix
pub fn write_message<W: Write>(
    writer: &mut W,
    msg: &impl Serialize,
    max_len: u32,
) -> Result<(), ProtocolError> {
    let body = encode(msg)?;
    let len = check_len(body.len(), max_len)?;

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed body from a stream
///
/// The length is checked against `max_len` before anything is allocated.
pub fn read_frame<R: Read>(reader: &mut R, max_len: u32) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > max_len {
        return Err(ProtocolError::TooLarge { len, max: max_len });
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read a response from a stream with length prefix
pub fn read_response<R: Read>(reader: &mut R, max_len: u32) -> Result<Response, ProtocolError> {
    let body = read_frame(reader, max_len)?;
    decode_response(&body)
}

/// Async counterpart of [`write_message`] for already-encoded bodies
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
    max_len: u32,
) -> Result<(), ProtocolError> {
    let len = check_len(body.len(), max_len)?;
    writer.write_u32_le(len).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Async counterpart of [`read_frame`]
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: u32,
) -> Result<Vec<u8>, ProtocolError> {
    let len = reader.read_u32_le().await?;
    if len > max_len {
        return Err(ProtocolError::TooLarge { len, max: max_len });
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn arial() -> FaceDescriptor {
        FaceDescriptor {
            path: "C:\\F\\a.ttf".to_string(),
            face_index: 0,
            weight: 400,
            oblique: false,
            ps_outline: false,
            family_names: vec!["Arial".to_string()],
            full_names: vec!["Arial Regular".to_string()],
            postscript_names: Vec::new(),
        }
    }

    #[test]
    fn test_query_request_over_stream() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::query("Arial"), DEFAULT_MAX_MESSAGE_LEN).unwrap();
        assert_eq!(
            u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize,
            buf.len() - 4
        );

        let body = read_frame(&mut Cursor::new(buf), DEFAULT_MAX_MESSAGE_LEN).unwrap();
        let request = decode_request(&body).unwrap();
        assert_eq!(request.query.as_deref(), Some("Arial"));
        assert!(request.feedback.is_none());
    }

    #[test]
    fn test_response_over_stream() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Response::new(vec![arial()]), DEFAULT_MAX_MESSAGE_LEN).unwrap();

        let response = read_response(&mut Cursor::new(buf), DEFAULT_MAX_MESSAGE_LEN).unwrap();
        assert_eq!(response.version, PROTOCOL_VERSION);
        assert_eq!(response.faces, vec![arial()]);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let request = decode_request(
            br#"{"version": 1, "query": "Arial", "locale": "ja-JP", "pid": 42}"#,
        )
        .unwrap();
        assert_eq!(request.query.as_deref(), Some("Arial"));

        let response = decode_response(br#"{"version": 1, "faces": [], "elapsed_us": 12}"#).unwrap();
        assert!(response.faces.is_empty());
    }

    #[test]
    fn test_version_mismatch() {
        let err = decode_request(br#"{"version": 2, "query": "Arial"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion(2)));

        let err = decode_response(br#"{"version": 0, "faces": []}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion(0)));
    }

    #[test]
    fn test_malformed_body() {
        assert!(matches!(
            decode_request(b"not json").unwrap_err(),
            ProtocolError::Malformed(_)
        ));
        // Version is mandatory
        assert!(matches!(
            decode_request(br#"{"query": "Arial"}"#).unwrap_err(),
            ProtocolError::Malformed(_)
        ));
    }

    #[test]
    fn test_oversized_prefix_rejected_before_body() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(DEFAULT_MAX_MESSAGE_LEN + 1).to_le_bytes());
        // No body follows; the length check must fire first
        let err = read_frame(&mut Cursor::new(buf), DEFAULT_MAX_MESSAGE_LEN).unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge { .. }));
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut buf = Vec::new();
        let err = write_message(&mut buf, &Request::query("x".repeat(64)), 16).unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge { max: 16, .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_stream() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::query("Arial"), DEFAULT_MAX_MESSAGE_LEN).unwrap();
        buf.truncate(buf.len() - 2);
        let err = read_frame(&mut Cursor::new(buf), DEFAULT_MAX_MESSAGE_LEN).unwrap_err();
        assert!(
            matches!(err, ProtocolError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
        );
    }

    #[tokio::test]
    async fn test_async_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let body = encode(&Request::feedback(vec!["a.ttf".to_string()])).unwrap();

        let writer = tokio::spawn(async move {
            write_frame_async(&mut client, &body, DEFAULT_MAX_MESSAGE_LEN)
                .await
                .unwrap();
        });

        let body = read_frame_async(&mut server, DEFAULT_MAX_MESSAGE_LEN).await.unwrap();
        writer.await.unwrap();

        let request = decode_request(&body).unwrap();
        assert_eq!(request.feedback.unwrap().paths, vec!["a.ttf"]);
    }
}
