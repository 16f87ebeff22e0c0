//! DAP wire protocol codec
//!
//! The DAP protocol uses HTTP-style headers followed by JSON body:
//! ```text
//! Content-Length: <byte-length>\r\n
//! \r\n
//! <JSON body>
//! ```

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Error, Result};

use super::types::ProtocolMessage;

/// Upper bound on a single message body
const MAX_CONTENT_LENGTH: usize = 100 * 1024 * 1024;

fn map_eof(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::AdapterCrashed
    } else {
        Error::from(e)
    }
}

/// Read one framed JSON body from the stream
///
/// End of stream before or inside a frame is reported as [`Error::AdapterCrashed`].
/// An oversized body is consumed and reported as [`Error::DapProtocol`], so
/// the stream stays usable; an unparsable `Content-Length` leaves no way to
/// find the next frame and is reported as [`Error::DapFraming`].
pub async fn read_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    read_body_limited(reader, MAX_CONTENT_LENGTH).await
}

async fn read_body_limited<R: AsyncBufRead + Unpin>(reader: &mut R, limit: usize) -> Result<String> {
    let mut content_length: Option<usize> = None;
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await.map_err(map_eof)?;
        if bytes_read == 0 {
            return Err(Error::AdapterCrashed);
        }

        // Empty line (just \r\n) signals end of headers
        let header = line.trim();
        if header.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }

        // Other headers (like Content-Type) are ignored
        if let Some(value) = header.strip_prefix("Content-Length:") {
            content_length = Some(value.trim().parse().map_err(|_| {
                Error::DapFraming(format!("Invalid Content-Length: {}", value.trim()))
            })?);
        }
    }

    let len = content_length
        .ok_or_else(|| Error::DapProtocol("Missing Content-Length header".to_string()))?;
    if len > limit {
        let discarded = tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink())
            .await
            .map_err(map_eof)?;
        if discarded < len as u64 {
            return Err(Error::AdapterCrashed);
        }
        return Err(Error::DapProtocol(format!(
            "Content-Length too large: {} bytes",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(map_eof)?;

    String::from_utf8(body).map_err(|e| Error::DapProtocol(format!("Invalid UTF-8: {}", e)))
}

/// Read and decode the next protocol message
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ProtocolMessage> {
    let json = read_body(reader).await?;
    tracing::trace!(target: "dap_session::wire", "<<< {}", json);
    serde_json::from_str(&json).map_err(|e| Error::DapProtocol(format!("Invalid message: {}", e)))
}

/// Encode and write a protocol message, flushing the stream
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ProtocolMessage,
) -> Result<()> {
    let json = serde_json::to_string(message)?;
    tracing::trace!(target: "dap_session::wire", ">>> {}", json);

    let header = format!("Content-Length: {}\r\n\r\n", json.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::types::RequestMessage;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_body_with_extra_headers() {
        let data = b"Content-Length: 13\r\nContent-Type: application/json\r\n\r\n{\"test\":true}";
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));

        let result = read_body(&mut reader).await.unwrap();
        assert_eq!(result, "{\"test\":true}");
    }

    fn frame(json: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", json.len(), json)
    }

    #[tokio::test]
    async fn test_read_back_to_back_messages() {
        let data = frame(r#"{"seq":1,"type":"event","event":"initialized"}"#)
            + &frame(r#"{"seq":2,"type":"event","event":"exited"}"#);
        let mut reader = BufReader::new(Cursor::new(data.into_bytes()));

        let first = read_message(&mut reader).await.unwrap();
        let second = read_message(&mut reader).await.unwrap();
        assert!(matches!(first, ProtocolMessage::Event(ref e) if e.event == "initialized"));
        assert!(matches!(second, ProtocolMessage::Event(ref e) if e.event == "exited"));
        assert!(matches!(read_message(&mut reader).await, Err(Error::AdapterCrashed)));
    }

    #[tokio::test]
    async fn test_truncated_body_is_crash() {
        let data = b"Content-Length: 50\r\n\r\n{\"seq\":1";
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));
        assert!(matches!(read_body(&mut reader).await, Err(Error::AdapterCrashed)));
    }

    #[tokio::test]
    async fn test_bad_content_length_is_fatal() {
        let data = b"Content-Length: lots\r\n\r\n{}";
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));
        assert!(matches!(read_body(&mut reader).await, Err(Error::DapFraming(_))));
    }

    #[tokio::test]
    async fn test_oversized_body_is_skipped_whole() {
        let data = frame(r#"{"seq":1,"type":"event","event":"output","body":{"output":"a long line"}}"#)
            + &frame(r#"{"seq":2,"type":"event","event":"exited"}"#);
        let mut reader = BufReader::new(Cursor::new(data.into_bytes()));

        let oversized = read_body_limited(&mut reader, 16).await;
        assert!(matches!(oversized, Err(Error::DapProtocol(ref msg)) if msg.contains("too large")));
        let next = read_message(&mut reader).await.unwrap();
        assert!(matches!(next, ProtocolMessage::Event(ref e) if e.event == "exited"));
    }

    #[tokio::test]
    async fn test_write_message_frames_json() {
        let mut output = Vec::new();
        let message = ProtocolMessage::Request(RequestMessage {
            seq: 1,
            command: "threads".to_string(),
            arguments: None,
        });
        write_message(&mut output, &message).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));
        assert!(body.contains("\"command\":\"threads\""));

        let mut reader = BufReader::new(Cursor::new(text.into_bytes()));
        let parsed = read_message(&mut reader).await.unwrap();
        assert!(matches!(parsed, ProtocolMessage::Request(ref r) if r.seq == 1));
    }
}
