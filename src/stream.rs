//! Line framing over engine byte streams.
//!
//! Engine subprocesses emit line-oriented output. `LineBuffer` does the
//! incremental splitting: bytes are accumulated as they arrive, complete
//! lines are handed out, and the trailing fragment waits for more input.
//! UTF-8 decoding happens per complete line, so a chunk boundary inside a
//! multi-byte character never corrupts text. `LineStream` drives a
//! `LineBuffer` over any `AsyncRead` and is what the execution layer
//! consumes.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8192;

/// Incremental newline splitter with a held-back trailing fragment.
#[derive(Debug, Default)]
pub struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete line it closed, without
    /// the terminating newline. Blank lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.bytes.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.bytes.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let text = String::from_utf8_lossy(&line).into_owned();
            if !text.trim().is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    /// Consume the buffer, yielding the trailing fragment if it is
    /// non-blank. Called exactly once when the stream ends.
    pub fn finish(self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.bytes).into_owned();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Pull-based line reader over a byte stream.
pub struct LineStream<R> {
    reader: R,
    buffer: Option<LineBuffer>,
    ready: std::collections::VecDeque<String>,
}

impl<R: AsyncRead + Unpin> LineStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Some(LineBuffer::new()),
            ready: std::collections::VecDeque::new(),
        }
    }

    /// Next complete non-blank line, or `None` once the stream is
    /// exhausted. The trailing unterminated fragment is yielded once at
    /// end of stream.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            let buffer = match self.buffer.as_mut() {
                Some(buffer) => buffer,
                None => return Ok(None),
            };
            let mut chunk = [0u8; READ_CHUNK];
            let n = self
                .reader
                .read(&mut chunk)
                .await
                .context("Failed to read engine output stream")?;
            if n == 0 {
                let buffer = self.buffer.take().expect("buffer present until EOF");
                if let Some(tail) = buffer.finish() {
                    return Ok(Some(tail));
                }
                return Ok(None);
            }
            self.ready.extend(buffer.push(&chunk[..n]));
        }
    }
}
