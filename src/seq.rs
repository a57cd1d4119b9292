//! Conversion between absolute 64-bit stream offsets and the 32-bit,
//! wraparound sequence numbers carried on the wire.
//!
//! `abs_seqno` never wraps within a connection's lifetime; `seqno` wraps
//! modulo 2^32 the instant a connection has sent more than 4 GiB.

/// An absolute, monotonically increasing stream offset.
pub type AbsSeqno = u64;

/// Convert an absolute offset to its on-the-wire, 32-bit representation.
pub fn wrap(abs: AbsSeqno, isn: u32) -> u32 {
    (abs as u32).wrapping_add(isn)
}

/// Convert a wire sequence number back to the absolute offset closest to
/// `checkpoint`, biased to the non-negative candidate on ties.
///
/// `seq`, once unwrapped relative to `isn`, has infinitely many absolute
/// preimages spaced 2^32 apart; `checkpoint` (usually the receiver's or
/// sender's last-known absolute position) picks out the right one.
pub fn unwrap(seq: u32, isn: u32, checkpoint: AbsSeqno) -> AbsSeqno {
    const SPAN: i128 = 1 << 32;

    let c = wrap(checkpoint, isn);
    let checkpoint = checkpoint as i128;

    let (candidate_hi, candidate_lo) = if seq >= c {
        let d = (seq - c) as i128;
        (checkpoint + d, checkpoint - (SPAN - d))
    } else {
        let d = (c - seq) as i128;
        (checkpoint + (SPAN - d), checkpoint - d)
    };

    let chosen = if candidate_lo < 0 {
        candidate_hi
    } else if (candidate_hi - checkpoint).abs() < (candidate_lo - checkpoint).abs() {
        candidate_hi
    } else {
        candidate_lo
    };

    chosen as u64
}

/// `(n + x) mod 2^32`.
pub fn uint32_plus(n: u32, x: u32) -> u32 {
    n.wrapping_add(x)
}

/// True iff `lhs` precedes `rhs` in the wraparound sense of RFC 1323 §4.2:
/// within 2^31 sequence numbers of each other, sign of the difference
/// decides order.
pub fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    lhs.wrapping_sub(rhs) > (1 << 31)
}

/// True iff `x` lies strictly between `start` and `end` in wraparound order.
pub fn is_between_wrapped(start: u32, x: u32, end: u32) -> bool {
    wrapping_lt(start, x) && wrapping_lt(x, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_roundtrip_no_offset() {
        assert_eq!(unwrap(wrap(1000, 500), 500, 1000), 1000);
    }

    #[test]
    fn wrap_roundtrip_across_representative_offsets() {
        let isns = [0u32, 1, 12345, u32::MAX / 2, u32::MAX];
        let checkpoints: [u64; 5] = [0, 1, 1 << 20, 1 << 40, (1u64 << 62) + 7];
        let offsets: [i64; 7] = [
            0,
            1,
            -1,
            (1 << 31) - 1,
            -((1 << 31) - 1),
            1 << 16,
            -(1 << 16),
        ];

        for &isn in &isns {
            for &ckpt in &checkpoints {
                for &offset in &offsets {
                    let target = match ckpt.checked_add_signed(offset) {
                        Some(v) => v,
                        None => continue,
                    };
                    let seq = wrap(target, isn);
                    assert_eq!(
                        unwrap(seq, isn, ckpt),
                        target,
                        "isn={isn} ckpt={ckpt} offset={offset}"
                    );
                }
            }
        }
    }

    #[test]
    fn unwrap_never_negative() {
        // checkpoint is small, seq wraps far behind it: unwrap must still
        // pick the non-negative candidate rather than going negative.
        let isn = 0;
        let checkpoint = 0u64;
        let seq = wrap(u32::MAX as u64, isn);
        let abs = unwrap(seq, isn, checkpoint);
        assert_eq!(abs, u32::MAX as u64);
    }

    #[test]
    fn uint32_plus_wraps() {
        assert_eq!(uint32_plus(u32::MAX, 1), 0);
        assert_eq!(uint32_plus(5, 3), 8);
    }

    #[test]
    fn wrapping_order() {
        assert!(wrapping_lt(10, 20));
        assert!(wrapping_lt(u32::MAX, 0));
        assert!(!wrapping_lt(20, 10));
        assert!(is_between_wrapped(10, 15, 20));
        assert!(!is_between_wrapped(10, 25, 20));
    }
}
