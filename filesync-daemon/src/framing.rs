//! Newline-delimited frames over an async byte stream.
//!
//! The JSON encoder never emits a raw newline, so `\n` is the only frame
//! boundary. A frame longer than the configured limit is reported and
//! skipped up to its terminating newline; the stream stays usable.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::DaemonError;

const DELIMITER: u8 = b'\n';

pub struct FrameReader<R> {
    inner: BufReader<R>,
    limit: usize,
    buf: Vec<u8>,
    /// Inside an oversized frame that has already been reported.
    skipping: bool,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, limit: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            limit,
            buf: Vec::new(),
            skipping: false,
            bytes_read: 0,
        }
    }

    /// Total bytes consumed from the stream, delimiters included.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Next non-empty frame, or `None` once the stream ends cleanly between
    /// frames.
    ///
    /// # Cancel safety
    ///
    /// Bytes are moved out of the buffered reader into `self.buf` before
    /// any await point, so dropping this future loses nothing.
    pub async fn next_frame(&mut self) -> Result<Option<String>, DaemonError> {
        loop {
            let available = self
                .inner
                .fill_buf()
                .await
                .map_err(DaemonError::Transport)?;

            if available.is_empty() {
                if self.buf.is_empty() || self.skipping {
                    return Ok(None);
                }
                let bytes = self.buf.len();
                self.buf.clear();
                return Err(DaemonError::PartialFrame { bytes });
            }

            let (chunk_len, complete) = match available.iter().position(|b| *b == DELIMITER) {
                Some(at) => (at, true),
                None => (available.len(), false),
            };
            let mut oversized = false;
            if !self.skipping {
                if self.buf.len() + chunk_len > self.limit {
                    oversized = true;
                    self.buf.clear();
                } else {
                    self.buf.extend_from_slice(&available[..chunk_len]);
                }
            }

            let consumed = chunk_len + usize::from(complete);
            self.inner.consume(consumed);
            self.bytes_read += consumed as u64;

            if oversized {
                self.skipping = !complete;
                return Err(DaemonError::FrameTooLarge { limit: self.limit });
            }
            if !complete {
                continue;
            }
            if self.skipping {
                self.skipping = false;
                continue;
            }

            let frame = std::mem::take(&mut self.buf);
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return String::from_utf8(frame)
                .map(Some)
                .map_err(|_| DaemonError::FrameNotUtf8);
        }
    }
}

/// Drain encoded frames onto the stream until every sender is gone.
pub async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::Receiver<String>,
) -> Result<(), DaemonError> {
    while let Some(frame) = frames.recv().await {
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(DaemonError::Transport)?;
        writer
            .write_all(&[DELIMITER])
            .await
            .map_err(DaemonError::Transport)?;
        writer
            .flush()
            .await
            .map_err(DaemonError::Transport)?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}
