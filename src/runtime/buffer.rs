//! Per-connection byte buffers.
//!
//! Each connection owns one `ConnectionBuffer` with two halves:
//! - an incoming accumulator holding bytes not yet resolved into a line
//! - an outgoing FIFO of byte chunks waiting for the socket to accept them
//!
//! Neither half is bounded by default. `max_line_length` caps the
//! accumulator only; the outgoing queue of a slow reader grows without limit.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};

/// Error produced while extracting lines from the accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A complete line was not valid UTF-8.
    InvalidUtf8,
    /// The unterminated remainder grew past the configured cap.
    LineTooLong { len: usize, max: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::InvalidUtf8 => write!(f, "line is not valid UTF-8"),
            FrameError::LineTooLong { len, max } => {
                write!(f, "line too long: {len} bytes buffered, limit is {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl From<FrameError> for io::Error {
    fn from(e: FrameError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Lines taken from the accumulator in one pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Segments {
    /// Complete, trimmed, non-blank lines in stream order.
    pub lines: Vec<String>,
    /// Set when a line could not be framed; `lines` holds everything before it.
    pub error: Option<FrameError>,
}

/// Outcome of draining the outgoing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every queued byte reached the transport.
    Drained,
    /// The transport stopped accepting bytes; the rest stays queued.
    Pending,
}

/// Incoming accumulator plus outgoing queue for one connection.
#[derive(Debug, Default)]
pub struct ConnectionBuffer {
    incoming: BytesMut,
    outgoing: VecDeque<Bytes>,
    max_line_length: Option<usize>,
}

impl ConnectionBuffer {
    /// Create an empty, unbounded buffer.
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer whose lines may not exceed `max` bytes.
    pub fn with_max_line_length(max: Option<usize>) -> Self {
        Self {
            max_line_length: max,
            ..Self::default()
        }
    }

    /// Append raw input to the accumulator.
    pub fn append(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    /// Bytes held in the accumulator.
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.incoming.len()
    }

    /// Remove every complete segment terminated by `separator`.
    ///
    /// Segments come back in stream order with the separator and surrounding
    /// whitespace removed. Blank segments are dropped. Whatever follows the
    /// last separator stays in the accumulator for the next read.
    ///
    /// On a bad line the segments before it are still returned, alongside
    /// the error; nothing after it is examined. A line counts against
    /// `max_line_length` whether or not its terminator has arrived, so the
    /// outcome does not depend on how the stream was split into reads.
    pub fn take_ready(&mut self, separator: u8) -> Segments {
        let mut segments = Segments::default();

        while let Some(pos) = self.incoming.iter().position(|&b| b == separator) {
            let segment = self.incoming.split_to(pos + 1);
            if let Err(e) = self.check_line_length(pos) {
                segments.error = Some(e);
                return segments;
            }
            let Ok(text) = std::str::from_utf8(&segment[..pos]) else {
                segments.error = Some(FrameError::InvalidUtf8);
                return segments;
            };
            let text = text.trim();
            if !text.is_empty() {
                segments.lines.push(text.to_owned());
            }
        }

        if let Err(e) = self.check_line_length(self.incoming.len()) {
            segments.error = Some(e);
        }

        segments
    }

    fn check_line_length(&self, len: usize) -> Result<(), FrameError> {
        match self.max_line_length {
            Some(max) if len > max => Err(FrameError::LineTooLong { len, max }),
            _ => Ok(()),
        }
    }

    /// Queue a chunk behind everything already waiting to be written.
    pub fn enqueue(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.outgoing.push_back(chunk);
        }
    }

    /// True when nothing is waiting to be written.
    pub fn is_drained(&self) -> bool {
        self.outgoing.is_empty()
    }

    /// Bytes still waiting to be written, across all queued chunks.
    pub fn pending_bytes(&self) -> usize {
        self.outgoing.iter().map(Bytes::len).sum()
    }

    /// Number of queued chunks, including a partially written head.
    #[cfg(test)]
    pub fn pending_chunks(&self) -> usize {
        self.outgoing.len()
    }

    /// Write queued chunks to `writer` in FIFO order.
    ///
    /// A short write leaves the unwritten tail at the front of the queue and
    /// returns `Pending`, as does `WouldBlock`. The next call resumes exactly
    /// where this one stopped.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<WriteStatus> {
        while let Some(head) = self.outgoing.front_mut() {
            match writer.write(&head[..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    head.advance(n);
                    if !head.is_empty() {
                        return Ok(WriteStatus::Pending);
                    }
                    self.outgoing.pop_front();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteStatus::Pending);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(WriteStatus::Drained)
    }
}
