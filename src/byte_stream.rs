//! A bounded FIFO byte buffer: the point of contact between the
//! application and the TCP engine, in both directions.

use std::collections::VecDeque;

/// Ordered byte buffer of capacity `C`, with EOF and error flags.
///
/// Writing past `remaining_capacity` silently truncates instead of
/// failing — the writer is expected to check capacity first. Reading
/// past `size` is a programming error and is recorded as a sticky
/// `error` flag rather than propagated, matching the caller contract in
/// spec.md §4.2.
#[derive(Debug)]
pub struct ByteStream {
    capacity: usize,
    buffer: VecDeque<u8>,
    bytes_written: u64,
    bytes_read: u64,
    input_ended: bool,
    error: bool,
}

impl ByteStream {
    pub fn new(capacity: usize) -> Self {
        ByteStream {
            capacity,
            buffer: VecDeque::with_capacity(capacity.min(4096)),
            bytes_written: 0,
            bytes_read: 0,
            input_ended: false,
            error: false,
        }
    }

    /// Append as much of `data` as fits in the remaining capacity.
    /// Returns the number of bytes actually written (never a partial
    /// failure — short writes are silent by design).
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining_capacity());
        self.buffer.extend(&data[..n]);
        self.bytes_written += n as u64;
        n
    }

    /// Consume and return up to `n` bytes. Sets `error` and returns an
    /// empty vector if `n` exceeds `size`.
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        if n > self.size() {
            self.error = true;
            return Vec::new();
        }
        let out: Vec<u8> = self.buffer.drain(..n).collect();
        self.bytes_read += n as u64;
        out
    }

    /// Look at, without consuming, up to `min(n, size)` bytes.
    pub fn peek_output(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.size());
        self.buffer.iter().take(n).copied().collect()
    }

    /// Discard up to `n` bytes from the front without returning them.
    /// Sets `error` if `n` exceeds `size`.
    pub fn pop_output(&mut self, n: usize) {
        if n > self.size() {
            self.error = true;
            return;
        }
        self.buffer.drain(..n);
        self.bytes_read += n as u64;
    }

    /// Mark the write side as finished; no more bytes will ever be
    /// written.
    pub fn end_input(&mut self) {
        self.input_ended = true;
    }

    pub fn error(&self) -> bool {
        self.error
    }

    pub fn set_error(&mut self, val: bool) {
        self.error = val;
    }

    pub fn input_ended(&self) -> bool {
        self.input_ended
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.size()
    }

    /// EOF once the writer has closed and every written byte has been
    /// read out.
    pub fn eof(&self) -> bool {
        self.empty() && self.input_ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let mut s = ByteStream::new(10);
        assert_eq!(s.write(b"hello"), 5);
        assert_eq!(s.size(), 5);
        assert_eq!(s.read(5), b"hello");
        assert_eq!(s.size(), 0);
    }

    #[test]
    fn write_truncates_silently_at_capacity() {
        let mut s = ByteStream::new(3);
        assert_eq!(s.write(b"abcdef"), 3);
        assert_eq!(s.remaining_capacity(), 0);
        assert_eq!(s.peek_output(10), b"abc");
    }

    #[test]
    fn overread_sets_error_and_is_a_noop() {
        let mut s = ByteStream::new(10);
        s.write(b"ab");
        assert!(s.read(5).is_empty());
        assert!(s.error());
        // the buffer itself is untouched
        assert_eq!(s.size(), 2);
    }

    #[test]
    fn pop_output_overread_sets_error() {
        let mut s = ByteStream::new(10);
        s.write(b"ab");
        s.pop_output(5);
        assert!(s.error());
        assert_eq!(s.size(), 2);
    }

    #[test]
    fn eof_requires_drained_and_closed() {
        let mut s = ByteStream::new(10);
        s.write(b"x");
        s.end_input();
        assert!(!s.eof());
        s.read(1);
        assert!(s.eof());
    }
}
