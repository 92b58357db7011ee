//! Minimal memcached-ASCII / Redis-inline line framer (spec §1, §2: the
//! proxy's "easy pieces", explicitly out of the routing core's scope).
//!
//! Both protocols are, for the one-line commands this proxy forwards,
//! whitespace-delimited ASCII terminated by `\n` (memcached requires
//! `\r\n`, Redis inline accepts either): `<verb> <key> [args...]\r\n`. The
//! proxy only needs the key to route; everything else is forwarded
//! verbatim and the backend's response line is relayed back untouched.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Reads one `\n`-terminated line from `stream` into `buf`, growing `buf`
/// as needed, and returns the line without its trailing `\r\n`/`\n`.
/// Returns `Ok(None)` on clean EOF with no partial line pending.
pub async fn read_line(
    stream: &mut (impl tokio::io::AsyncRead + Unpin),
    buf: &mut BytesMut,
) -> std::io::Result<Option<BytesMut>> {
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let mut line = buf.split_to(pos + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            return Ok(Some(line));
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                let line = buf.split();
                Ok(Some(line))
            };
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub async fn write_line(
    stream: &mut (impl tokio::io::AsyncWrite + Unpin),
    line: &[u8],
) -> std::io::Result<()> {
    stream.write_all(line).await?;
    stream.write_all(b"\r\n").await
}

/// The routing key for a request line: the second whitespace-delimited
/// token (the first is the command verb — `get`/`set`/`GET`/`SET`/...).
/// Returns `None` for a line with no key token (e.g. `quit`, `stats`).
pub fn extract_key(line: &[u8]) -> Option<&[u8]> {
    let mut tokens = line.split(|&b| b == b' ').filter(|t| !t.is_empty());
    tokens.next()?;
    tokens.next()
}
