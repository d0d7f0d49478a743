use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Most HTTP CONNECT responses are well under 512 bytes.
pub const MAX_HEADER_BLOCK_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("connection closed before the end of the response headers")]
    Closed,
    #[error("response headers exceed {MAX_HEADER_BLOCK_SIZE} bytes")]
    TooLarge,
    #[error("failed during I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads a header block up to the first blank line, one byte at a time so
/// that nothing past the terminator is consumed. The terminator is not part
/// of the returned text.
pub async fn read_header_block<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ReadError> {
    let mut buf = Vec::with_capacity(512);
    let mut one = [0u8; 1];

    loop {
        let n = reader.read(&mut one).await?;
        if n == 0 {
            return Err(ReadError::Closed);
        }
        buf.push(one[0]);

        if buf.ends_with(HEADER_TERMINATOR) {
            buf.truncate(buf.len() - HEADER_TERMINATOR.len());
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
        if buf.len() >= MAX_HEADER_BLOCK_SIZE {
            return Err(ReadError::TooLarge);
        }
    }
}
