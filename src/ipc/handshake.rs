//! Connection handshake
//!
//! A client proves it speaks this transport by sending a fixed token once,
//! right after the channel opens:
//! ```text
//! Hello
//! ```
//! No length prefix, no version, no negotiation. Only an exact match counts.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Error, Result};

/// The handshake token
pub const TOKEN: &[u8; 5] = b"Hello";

/// Send the token in a single write
///
/// The write must report the full token length. A short write is a failed
/// handshake and is not retried.
pub async fn send<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    let n = writer.write(TOKEN).await?;
    if n != TOKEN.len() {
        return Err(Error::bad_handshake(format!(
            "short write: {} of {} bytes",
            n,
            TOKEN.len()
        )));
    }
    writer.flush().await?;
    Ok(())
}

/// Read the token from a freshly accepted, private stream
///
/// Consumes exactly `TOKEN.len()` bytes; anything else from the peer is left
/// in the stream.
pub async fn expect<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut buf = [0u8; TOKEN.len()];
    match reader.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(Error::bad_handshake("peer closed before sending the token"));
        }
        Err(e) => return Err(Error::Io(e)),
    }

    if &buf != TOKEN {
        return Err(Error::bad_handshake(format!(
            "unexpected token {:?}",
            String::from_utf8_lossy(&buf)
        )));
    }
    Ok(())
}

/// Scan a shared channel until the token shows up
///
/// Bytes that do not end a complete token are noise and get dropped. The
/// channel is read one byte at a time so nothing past the token is consumed.
/// Returns the number of discarded bytes. End of stream is a hard error.
pub async fn scan<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize> {
    let mut window = [0u8; TOKEN.len()];
    let mut byte = [0u8; 1];
    let mut seen = 0usize;

    loop {
        if reader.read(&mut byte).await? == 0 {
            return Err(Error::EndOfStream);
        }
        window.rotate_left(1);
        window[TOKEN.len() - 1] = byte[0];
        seen += 1;

        if seen >= TOKEN.len() && &window == TOKEN {
            let discarded = seen - TOKEN.len();
            if discarded > 0 {
                tracing::debug!(discarded, "Discarded handshake noise");
            }
            return Ok(discarded);
        }
    }
}
