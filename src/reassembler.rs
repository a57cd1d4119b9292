//! Reorders and coalesces out-of-order TCP payload bytes, forwarding the
//! contiguous prefix into a [`ByteStream`] as soon as it becomes
//! available.
//!
//! The pending set stays small — bounded by `capacity / MAX_PAYLOAD_SIZE`
//! substrings at any one time — so a sorted `VecDeque` is adequate; an
//! interval tree would be solving a problem this crate doesn't have.

use std::collections::VecDeque;

use crate::byte_stream::ByteStream;

#[derive(Debug)]
pub struct Reassembler {
    capacity: usize,
    unassembled_base: u64,
    pending: VecDeque<(u64, Vec<u8>)>,
    eof_seen: bool,
    out: ByteStream,
}

impl Reassembler {
    pub fn new(capacity: usize) -> Self {
        Reassembler {
            capacity,
            unassembled_base: 0,
            pending: VecDeque::new(),
            eof_seen: false,
            out: ByteStream::new(capacity),
        }
    }

    /// Offer a substring of the stream at absolute offset `index`. `eof`
    /// marks that this substring's last byte is the final byte of the
    /// stream.
    pub fn data_received(&mut self, index: u64, data: &[u8], eof: bool) {
        if eof {
            self.eof_seen = true;
        }

        let first = index;
        let last = first + data.len() as u64;

        let window_begin = self.unassembled_base - self.out.size() as u64;
        let window_end = window_begin + self.capacity as u64;

        if last <= self.unassembled_base || first >= window_end {
            return;
        }

        let left = first.max(self.unassembled_base);
        let right = last.min(window_end);
        let clipped = &data[(left - first) as usize..(right - first) as usize];

        self.insert(left, clipped.to_vec());
        self.merge();

        if let Some((off, _)) = self.pending.front() {
            if *off == self.unassembled_base {
                let (_, bytes) = self.pending.pop_front().unwrap();
                self.unassembled_base += bytes.len() as u64;
                self.out.write(&bytes);
            }
        }

        if self.finished() {
            self.out.end_input();
        }
    }

    fn insert(&mut self, offset: u64, data: Vec<u8>) {
        let place = self
            .pending
            .iter()
            .position(|(off, _)| offset <= *off)
            .unwrap_or(self.pending.len());
        self.pending.insert(place, (offset, data));
    }

    /// Coalesce adjacent/overlapping pending runs. Two runs touch or
    /// overlap iff `a + len(d1) >= c`; the merged run keeps the earlier
    /// bytes and appends only what the later run adds beyond that.
    fn merge(&mut self) {
        let mut i = 0;
        while i + 1 < self.pending.len() {
            let (a, d1_len) = (self.pending[i].0, self.pending[i].1.len() as u64);
            let b = a + d1_len;
            let (c, d2_len) = (self.pending[i + 1].0, self.pending[i + 1].1.len() as u64);
            let d = c + d2_len;
            debug_assert!(a <= c);

            if c > b {
                i += 1;
            } else if b >= d {
                self.pending.remove(i + 1);
            } else {
                let (_, d2) = self.pending.remove(i + 1).unwrap();
                self.pending[i].1.extend_from_slice(&d2[(b - c) as usize..]);
            }
        }
    }

    /// `true` once EOF has been seen and every byte up to it has been
    /// delivered to `out` (no gaps remain pending).
    pub fn finished(&self) -> bool {
        self.eof_seen && self.unassembled_bytes() == 0
    }

    /// Next absolute offset the reassembler expects; also the receiver's
    /// "ack index".
    pub fn ack_index(&self) -> u64 {
        self.unassembled_base
    }

    pub fn output(&self) -> &ByteStream {
        &self.out
    }

    pub fn output_mut(&mut self) -> &mut ByteStream {
        &mut self.out
    }

    pub fn unassembled_bytes(&self) -> usize {
        self.pending.iter().map(|(_, d)| d.len()).sum()
    }

    pub fn assembled_bytes(&self) -> u64 {
        self.out.bytes_written()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_delivery() {
        let mut r = Reassembler::new(10);
        r.data_received(0, b"abcd", false);
        assert_eq!(r.output().peek_output(10), b"abcd");
        assert_eq!(r.ack_index(), 4);
    }

    #[test]
    fn out_of_order_then_fill_gap() {
        let mut r = Reassembler::new(4000);
        r.data_received(4, b"efgh", false);
        assert_eq!(r.output().peek_output(10), b"");
        r.data_received(0, b"abcd", false);
        assert_eq!(r.output().peek_output(10), b"abcdefgh");
        assert_eq!(r.ack_index(), 8);
    }

    #[test]
    fn overlapping_substrings_merge() {
        let mut r = Reassembler::new(100);
        r.data_received(0, b"aaa", false);
        r.data_received(2, b"aabb", false);
        assert_eq!(r.output().peek_output(10), b"aaaabb");
    }

    #[test]
    fn capacity_clips_oversize_writes() {
        let mut r = Reassembler::new(4);
        r.data_received(2, b"cdef", false);
        // window is [0, 4) until bytes are read out; clip to [2, 4)
        assert_eq!(r.unassembled_bytes(), 2);
        r.data_received(0, b"ab", false);
        assert_eq!(r.output().peek_output(10), b"abcd");
    }

    #[test]
    fn eof_with_no_gaps_finishes_stream() {
        let mut r = Reassembler::new(100);
        r.data_received(0, b"done", true);
        assert!(r.finished());
        assert!(!r.output().eof());
        r.output_mut().read(4);
        assert!(r.output().eof());
    }

    #[test]
    fn completeness_under_reordering() {
        let n = 64usize;
        let full: Vec<u8> = (0..n as u8).collect();
        let mut r = Reassembler::new(1000);

        // offer chunks of 5 bytes each, last chunk first
        let chunks: Vec<(usize, &[u8])> = full.chunks(5).enumerate().map(|(i, c)| (i * 5, c)).collect();
        for (i, (off, chunk)) in chunks.iter().enumerate().rev() {
            let is_last = i == chunks.len() - 1;
            r.data_received(*off as u64, chunk, is_last);
        }

        assert_eq!(r.output().peek_output(n), full);
        assert!(r.finished());
    }

    #[test]
    fn capacity_invariant_holds() {
        let mut r = Reassembler::new(8);
        r.data_received(4, b"efgh", false);
        r.data_received(20, b"zzzz", false); // way outside window, dropped
        assert!(r.unassembled_bytes() + r.output().size() <= 8);
    }
}
