//! Bounded NDJSON line framing for the proxy pumps.
//!
//! A plain `read_line` would buffer without limit if a peer streams bytes
//! with no newline; [`read_line_bounded`] caps the accumulation and fails
//! the pump instead — an oversized frame is unrecoverable by design.

use tokio::io::AsyncBufRead;

/// Default maximum NDJSON message size (10 MiB).
///
/// Checked while reading, before any JSON parsing, so crafted input cannot
/// force allocation of oversized value trees.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Errors from reading framed lines off a stream.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// A single line exceeded the configured maximum size.
    #[error("message exceeds maximum size of {max_bytes} bytes")]
    MessageTooLarge {
        /// The configured maximum message size in bytes.
        max_bytes: usize,
    },

    /// An underlying IO error on the stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one line (including its newline) into `buf`, enforcing a byte cap.
///
/// Accumulates raw bytes so multi-byte UTF-8 sequences straddling internal
/// buffer boundaries are never split; callers validate UTF-8 on the
/// assembled line.
///
/// Returns the number of bytes read; `Ok(0)` means EOF. Exceeding
/// `max_bytes` before a newline returns [`FramingError::MessageTooLarge`].
pub async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<usize, FramingError> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            // EOF — return whatever was accumulated (a final unterminated
            // line, or 0 for a clean end of stream).
            return Ok(total);
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let take = pos + 1;
                if total + take > max_bytes {
                    reader.consume(take);
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }
                buf.extend_from_slice(&available[..take]);
                total += take;
                reader.consume(take);
                return Ok(total);
            }
            None => {
                let len = available.len();
                if total + len > max_bytes {
                    reader.consume(len);
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }
                buf.extend_from_slice(available);
                total += len;
                reader.consume(len);
            }
        }
    }
}
