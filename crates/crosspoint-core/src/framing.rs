//! Delimiter based stream framing
//!
//! Stream transports deliver arbitrary chunks. [`DelimiterFramer`]
//! accumulates them and yields one complete frame per delimiter.

use bytes::{Buf, Bytes, BytesMut};

use crate::{Error, Result, DEFAULT_DELIMITER, MAX_FRAME_SIZE};

/// Reassembles delimiter-terminated frames from a byte stream
#[derive(Debug)]
pub struct DelimiterFramer {
    delimiter: u8,
    max_frame_size: usize,
    buf: BytesMut,
}

impl DelimiterFramer {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            max_frame_size: MAX_FRAME_SIZE,
            buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Append raw bytes from the transport
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, without its delimiter.
    ///
    /// Empty frames are skipped. A frame exceeding the maximum size is
    /// discarded and reported once as [`Error::FrameTooLarge`]; framing
    /// resumes after it.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.buf.iter().position(|b| *b == self.delimiter) {
                Some(pos) => {
                    let frame = self.buf.split_to(pos).freeze();
                    self.buf.advance(1);

                    if frame.is_empty() {
                        continue;
                    }
                    if frame.len() > self.max_frame_size {
                        return Err(Error::FrameTooLarge {
                            size: frame.len(),
                            max: self.max_frame_size,
                        });
                    }
                    return Ok(Some(frame));
                }
                None => {
                    if self.buf.len() > self.max_frame_size {
                        let size = self.buf.len();
                        self.buf.clear();
                        return Err(Error::FrameTooLarge {
                            size,
                            max: self.max_frame_size,
                        });
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Bytes waiting for a delimiter
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial frame (used when a connection restarts)
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

impl Default for DelimiterFramer {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}
