//! Message serialization and deserialization using serde_json
//!
//! Both channels carry newline-delimited JSON:
//! ```text
//! {"command":"usb_attach","device_node":"/dev/bus/usb/001/002","vm":"gui-vm"}\n
//! {"result":"ok","event":"usb_attached"}\n
//! ```
//!
//! Maximum line size is 1 MiB to prevent memory exhaustion from a peer that
//! never sends a newline.

use crate::error::{ProtocolError, Result};
use crate::messages::{Command, PushMessage, Reply};
use serde::Serialize;
use serde::de::DeserializeOwned;

#[cfg(feature = "async")]
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed line size (1 MiB) - device lists are small
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    if line.len() > MAX_LINE_SIZE {
        return Err(ProtocolError::LineTooLarge {
            size: line.len(),
            max: MAX_LINE_SIZE,
        });
    }
    line.push(b'\n');
    Ok(line)
}

fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(serde_json::from_str(text.trim())?)
}

/// Encode a command as a newline-terminated JSON line
///
/// # Example
/// ```
/// use protocol::{Command, encode_command};
///
/// let line = encode_command(&Command::List).unwrap();
/// assert_eq!(line, b"{\"command\":\"usb_list\"}\n");
/// ```
pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    encode_line(command)
}

/// Encode a reply as a newline-terminated JSON line
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>> {
    encode_line(reply)
}

/// Encode a push message as a newline-terminated JSON line
pub fn encode_push(message: &PushMessage) -> Result<Vec<u8>> {
    encode_line(message)
}

/// Decode a reply from a single line (trailing newline optional)
///
/// # Example
/// ```
/// use protocol::decode_reply;
///
/// let reply = decode_reply(br#"{"result":"error","error":"busy"}"#).unwrap();
/// assert_eq!(reply.error.as_deref(), Some("busy"));
/// ```
pub fn decode_reply(line: &[u8]) -> Result<Reply> {
    decode_line(line)
}

/// Decode a push message from a single line
pub fn decode_push(line: &[u8]) -> Result<PushMessage> {
    decode_line(line)
}

/// Async: Write an encoded line and flush it
#[cfg(feature = "async")]
pub async fn write_line_async<W>(writer: &mut W, line: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line).await?;
    writer.flush().await?;
    Ok(())
}

/// Async: Read one line from a buffered reader
///
/// Returns the line without its terminator. A clean EOF, or EOF in the middle
/// of a line, yields [`ProtocolError::ConnectionClosed`]. An oversized line is
/// discarded up to its newline so the stream stays aligned on message
/// boundaries, then reported as [`ProtocolError::LineTooLarge`].
#[cfg(feature = "async")]
pub async fn read_line_async<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = (MAX_LINE_SIZE + 1) as u64;
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }

    if line.last() != Some(&b'\n') {
        if line.len() <= MAX_LINE_SIZE {
            return Err(ProtocolError::ConnectionClosed);
        }
        let size = line.len() + skip_to_newline(reader).await?;
        return Err(ProtocolError::LineTooLarge {
            size,
            max: MAX_LINE_SIZE,
        });
    }

    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

#[cfg(feature = "async")]
async fn skip_to_newline<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Err(ProtocolError::ConnectionClosed);
        }
        if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            reader.consume(pos + 1);
            return Ok(skipped + pos);
        }
        let len = buf.len();
        reader.consume(len);
        skipped += len;
    }
}
