//! Offset-tracking output buffer.
//!
//! Non-blocking writers rarely push a whole buffer in one call.
//! [`WriteCursor`] keeps the pending bytes plus a read offset so partial
//! writes only move the offset instead of reallocating the tail.

/// Pending output with a consumed-prefix offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteCursor {
    buf: Vec<u8>,
    pos: usize,
}

impl WriteCursor {
    /// Creates an empty cursor.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Creates a cursor over `data`.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { buf: data, pos: 0 }
    }

    /// Bytes not yet written.
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Marks the first `n` remaining bytes as written.
    ///
    /// `n` larger than [`len`](Self::len) is clamped.
    pub fn advance(&mut self, n: usize) {
        self.pos = self.pos.saturating_add(n).min(self.buf.len());
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    /// Appends `data` after the pending bytes.
    pub fn extend(&mut self, data: &[u8]) {
        if self.pos > 0 && self.pos * 2 >= self.buf.len() {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Number of pending bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes consumed since the last compaction.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }
}
