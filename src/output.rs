//! Captured process output.
//!
//! Chunks are kept exactly as read from the pipes; `ChunkBuffer` keeps the
//! most recent ones per process for `get_logs`.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

/// Default number of chunks retained per process.
pub const DEFAULT_CHUNK_CAPACITY: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A raw piece of output, delivered verbatim (including its trailing newline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Process id (module name) that produced the chunk.
    pub id: String,
    pub text: String,
    pub stream: StreamKind,
}

/// Oldest-first ring of chunks; pushing past capacity evicts from the front.
#[derive(Debug, Clone)]
pub struct ChunkBuffer {
    capacity: usize,
    chunks: VecDeque<OutputChunk>,
}

impl ChunkBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            chunks: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Returns `true` when the push evicted older output.
    pub fn push(&mut self, chunk: OutputChunk) -> bool {
        self.chunks.push_back(chunk);
        let excess = self.chunks.len().saturating_sub(self.capacity);
        self.chunks.drain(..excess);
        excess > 0
    }

    /// Copies the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<OutputChunk> {
        self.chunks.iter().cloned().collect()
    }
}

/// Text for the terminal printer, with ANSI escapes removed when `strip_ansi`.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if strip_ansi {
        String::from_utf8_lossy(&strip(text.as_bytes())).into_owned()
    } else {
        text.to_string()
    }
}
