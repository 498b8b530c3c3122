//! The reception buffer (`# 3`, "Reception buffer semantics").
//!
//! The C implementation NUL-terminates a heap region so a POSIX regex
//! engine can run directly against it. This port uses a length-terminated
//! `Vec<u8>`, the escape hatch `# 4.2` explicitly grants a high-level
//! implementation ("a high-level implementation may use length-terminated
//! buffers and drop this requirement").

use crate::config::MIN_BUF_INCREMENT;

/// Bytes read from the PTY but not yet handed back to the caller.
///
/// Persists across `recv` calls so a partial read that didn't complete a
/// regex match isn't lost (`# GLOSSARY`, "Outstanding buffer").
#[derive(Debug, Default, Clone)]
pub struct OutstandingBuffer {
    data: Vec<u8>,
    increment: usize,
}

impl OutstandingBuffer {
    pub fn new(increment: usize) -> Self {
        Self {
            data: Vec::new(),
            increment: increment.max(MIN_BUF_INCREMENT),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends freshly read bytes, growing in increments of the configured
    /// size the way the C buffer is `realloc`'d in steps (`# 4.2`,
    /// "growing by the configured increment"). `Vec::extend_from_slice`
    /// already amortizes growth; the increment only documents the
    /// historical contract, it doesn't change `Vec`'s actual growth curve.
    pub fn append(&mut self, bytes: &[u8]) {
        if self.data.capacity() < self.data.len() + bytes.len() {
            let needed = self.data.len() + bytes.len() - self.data.capacity();
            let grow = needed.div_ceil(self.increment).max(1) * self.increment;
            self.data.reserve(grow);
        }
        self.data.extend_from_slice(bytes);
    }

    /// Splits off everything after byte `at`, keeping `self` as the prefix
    /// (the caller's display buffer) and returning the new outstanding
    /// tail — "the suffix replaces the outstanding buffer as a fresh heap
    /// allocation" (`# 3`).
    pub fn split_off_as_new_tail(&mut self, at: usize) -> Self {
        let tail = self.data.split_off(at);
        Self {
            data: tail,
            increment: self.increment,
        }
    }

    /// Takes ownership of the current contents, leaving the buffer empty.
    /// Used by both `recv`'s match path (the prefix becomes the caller's
    /// display buffer) and by `flush` (`# 4.2`).
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    /// Index just past the last complete line (terminated by `\n`), if any
    /// — used by the `RECV_ON_THE_FLOW` path (`# 4.2` step 4).
    pub fn last_complete_line_end(&self) -> Option<usize> {
        self.data.iter().rposition(|&b| b == b'\n').map(|i| i + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_accumulates_bytes() {
        let mut buf = OutstandingBuffer::new(8);
        buf.append(b"abc");
        buf.append(b"def");
        assert_eq!(buf.as_slice(), b"abcdef");
    }

    #[test]
    fn split_off_leaves_prefix_and_returns_tail() {
        let mut buf = OutstandingBuffer::new(8);
        buf.append(b"PRompt> rest");
        let tail = buf.split_off_as_new_tail(8);
        assert_eq!(buf.as_slice(), b"PRompt> ");
        assert_eq!(tail.as_slice(), b"rest");
    }

    #[test]
    fn flush_is_idempotent() {
        let mut buf = OutstandingBuffer::new(8);
        buf.append(b"abc");
        let first = buf.take();
        assert_eq!(first, b"abc");
        let second = buf.take();
        assert!(second.is_empty());
    }

    #[test]
    fn last_complete_line_end_ignores_trailing_partial_line() {
        let mut buf = OutstandingBuffer::new(8);
        buf.append(b"banner\nprt");
        assert_eq!(buf.last_complete_line_end(), Some(7));
    }

    #[test]
    fn last_complete_line_end_is_none_without_newline() {
        let mut buf = OutstandingBuffer::new(8);
        buf.append(b"no newline here");
        assert_eq!(buf.last_complete_line_end(), None);
    }
}
