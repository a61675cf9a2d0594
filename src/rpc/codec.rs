//! Newline-delimited JSON framing.

use std::io::{BufRead, BufReader, Read, Write};

use super::message::Message;
use super::RpcError;

/// Largest accepted frame, excluding the trailing newline.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub struct FrameWriter<W: Write> {
    out: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Writes one frame and flushes it.
    pub fn send(&mut self, message: &Message) -> Result<(), RpcError> {
        let mut line = serde_json::to_vec(message)?;
        if line.len() > MAX_FRAME_BYTES {
            return Err(RpcError::FrameTooLarge {
                limit: MAX_FRAME_BYTES,
            });
        }
        line.push(b'\n');
        self.out.write_all(&line)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

pub struct FrameReader<R: Read> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            inner: BufReader::new(input),
            line: Vec::new(),
        }
    }

    /// Next frame, or `None` once the stream is closed. Blank lines are
    /// skipped.
    pub fn next_frame(&mut self) -> Result<Option<Message>, RpcError> {
        loop {
            self.line.clear();
            let limit = (MAX_FRAME_BYTES + 1) as u64;
            let read = self
                .inner
                .by_ref()
                .take(limit)
                .read_until(b'\n', &mut self.line)?;
            if read == 0 {
                return Ok(None);
            }

            if self.line.last() == Some(&b'\n') {
                self.line.pop();
            } else if self.line.len() > MAX_FRAME_BYTES {
                return Err(RpcError::FrameTooLarge {
                    limit: MAX_FRAME_BYTES,
                });
            }
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return serde_json::from_slice(&self.line)
                .map(Some)
                .map_err(|e| RpcError::Malformed(e.to_string()));
        }
    }
}
