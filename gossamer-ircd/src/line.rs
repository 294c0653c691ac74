//! Bounded line reading.
//!
//! [`LineReader`] never buffers more than `max_len` bytes per connection.
//! A line longer than that is cut at the buffer size: the first segment is
//! returned as the logical line and every continuation byte up to the next
//! line terminator is discarded.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// One read from the underlying stream, as a line-reading primitive sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub data: Vec<u8>,
    /// More bytes belong to this line than fit in the buffer.
    pub is_prefix: bool,
}

pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_len: usize,
    on_suffix: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        let max_len = max_len.max(16);
        Self {
            inner,
            buf: Vec::with_capacity(max_len),
            max_len,
            on_suffix: false,
            eof: false,
        }
    }

    /// Read the next segment: a full line without its terminator, or a
    /// buffer-sized piece of a longer one.
    ///
    /// At end of stream any unterminated tail is returned once, after which
    /// every call fails with [`io::ErrorKind::UnexpectedEof`].
    pub async fn read_segment(&mut self) -> io::Result<Segment> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut data: Vec<u8> = self.buf.drain(..=pos).collect();
                data.pop();
                if data.last() == Some(&b'\r') {
                    data.pop();
                }
                return Ok(Segment {
                    data,
                    is_prefix: false,
                });
            }
            if self.buf.len() >= self.max_len {
                let data: Vec<u8> = self.buf.drain(..self.max_len).collect();
                return Ok(Segment {
                    data,
                    is_prefix: true,
                });
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ));
                }
                return Ok(Segment {
                    data: std::mem::take(&mut self.buf),
                    is_prefix: false,
                });
            }

            let mut chunk = vec![0u8; self.max_len - self.buf.len()];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    /// Read the next logical line.
    ///
    /// Overlong lines come back truncated to their first segment; the
    /// remainder is skipped so the following line starts clean.
    pub async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            let segment = self.read_segment().await?;
            if self.on_suffix {
                if !segment.is_prefix {
                    self.on_suffix = false;
                }
                continue;
            }
            self.on_suffix = segment.is_prefix;
            return Ok(segment.data);
        }
    }
}
