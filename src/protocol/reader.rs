//! Byte-accurate line reading from a connection with an adjustable ceiling.
//!
//! Distinguishes "ceiling hit" from a clean end-of-stream so the caller can
//! reply with the right SMTP error instead of treating a runaway client the
//! same as a disconnect.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Error returned by [`BoundedReader::read_line`].
#[derive(Debug)]
pub enum ReadLineError {
    /// The underlying connection returned an IO error.
    Io(io::Error),
    /// The line exceeded the current ceiling before a terminator was found.
    LimitExceeded,
}

impl std::fmt::Display for ReadLineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadLineError::Io(e) => write!(f, "io error: {e}"),
            ReadLineError::LimitExceeded => write!(f, "input limit exceeded"),
        }
    }
}

impl std::error::Error for ReadLineError {}

impl From<io::Error> for ReadLineError {
    fn from(e: io::Error) -> Self {
        ReadLineError::Io(e)
    }
}

/// Wraps a buffered reader with a mutable byte ceiling.
///
/// The owner adjusts the ceiling before each phase: 1024 for command lines,
/// `max_size + 1 MiB` for the DATA body. Single-reader; not `Sync`.
pub struct BoundedReader<R> {
    inner: R,
    limit: usize,
}

impl<R: AsyncBufRead + Unpin> BoundedReader<R> {
    pub fn new(inner: R, limit: usize) -> Self {
        BoundedReader { inner, limit }
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads up to and including the next `\n`, or until the ceiling is hit.
    ///
    /// Returns the line with trailing `\r\n`/`\n` stripped. An empty
    /// `Ok(vec![])` means a clean end-of-stream (0 bytes read at all); a
    /// line that hits the ceiling without finding `\n` is reported as
    /// [`ReadLineError::LimitExceeded`], never silently truncated.
    pub async fn read_line(&mut self) -> Result<Vec<u8>, ReadLineError> {
        let mut buf = Vec::new();
        loop {
            let available = match self.inner.fill_buf().await {
                Ok(buf) => buf,
                Err(e) => return Err(ReadLineError::Io(e)),
            };

            if available.is_empty() {
                // Clean EOF: only acceptable if nothing has been buffered yet.
                return Ok(buf);
            }

            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                if buf.len() + pos + 1 > self.limit {
                    // Consume what pushed us over so the stream stays aligned.
                    let consumed = pos + 1;
                    self.inner.consume(consumed);
                    return Err(ReadLineError::LimitExceeded);
                }
                buf.extend_from_slice(&available[..=pos]);
                self.inner.consume(pos + 1);
                strip_crlf(&mut buf);
                return Ok(buf);
            }

            if buf.len() + available.len() > self.limit {
                let consumed = available.len();
                self.inner.consume(consumed);
                return Err(ReadLineError::LimitExceeded);
            }

            buf.extend_from_slice(available);
            let consumed = available.len();
            self.inner.consume(consumed);
        }
    }
}

fn strip_crlf(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
}
