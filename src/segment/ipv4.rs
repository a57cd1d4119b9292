//! RFC 791 IPv4 header, fixed 20 bytes, no options — built on `etherparse`
//! the way the teacher's `tcp/ioutil.rs` builds outgoing headers
//! (`Ipv4Header::new` + `.write(...)`) and `lib.rs` decodes inbound ones
//! (`Ipv4HeaderSlice::from_slice`).
//!
//! Fragmentation and PMTU discovery are explicit Non-goals: `df` is
//! always set, `mf` and the fragment offset are always zero.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use etherparse::{Ipv4Header as EtherIpv4Header, Ipv4HeaderSlice};

pub const HEADER_LEN: usize = 20;
pub const DEFAULT_TTL: u8 = 64;
pub const PROTO_TCP: u8 = 6;

/// Process-wide monotonic IPv4 identification counter, wrapping modulo
/// 2^16. Shared explicitly between connections rather than kept as a
/// global — callers clone the handle wherever a segment is encoded.
#[derive(Debug, Clone, Default)]
pub struct IpIdGenerator(Arc<AtomicU16>);

impl IpIdGenerator {
    pub fn new() -> Self {
        IpIdGenerator(Arc::new(AtomicU16::new(0)))
    }

    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub fn new(id: u16, total_len: u16, protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Ipv4Header {
            tos: 0,
            total_len,
            id,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src,
            dst,
        }
    }

    fn to_etherparse(&self) -> EtherIpv4Header {
        let mut h = EtherIpv4Header::new(
            self.total_len - HEADER_LEN as u16,
            self.ttl,
            self.protocol,
            self.src.octets(),
            self.dst.octets(),
        );
        h.identification = self.id;
        h.dont_fragment = true;
        h.more_fragments = false;
        h.fragments_offset = 0;
        h
    }

    /// Serialize the header, computing its checksum the way
    /// `etherparse`'s `Ipv4Header::write` does (same as `ioutil.rs`'s
    /// `ip4h.write(&mut cursor)`).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        self.to_etherparse()
            .write(&mut out)
            .expect("writing a fixed 20-byte ipv4 header to a Vec never fails");
        out
    }

    /// Decode and verify the header checksum. Returns `None` on a
    /// truncated or corrupted header — malformed segments are silently
    /// dropped by the codec (spec.md §7).
    ///
    /// `etherparse` parses the structure (`Ipv4HeaderSlice::from_slice`,
    /// as `lib.rs` does) but exposes no public checksum verification for
    /// IPv4 the way `TcpHeaderSlice::calc_checksum_ipv4_raw` does for
    /// TCP, so the checksum itself is recomputed directly over the wire
    /// bytes per RFC 791 §3.1.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let slice = Ipv4HeaderSlice::from_slice(data).ok()?;
        if !header_checksum_valid(&data[..HEADER_LEN]) {
            return None;
        }

        Some(Ipv4Header {
            tos: 0,
            total_len: slice.total_len(),
            id: slice.identification(),
            ttl: slice.ttl(),
            protocol: slice.protocol(),
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src: slice.source_addr(),
            dst: slice.destination_addr(),
        })
    }
}

fn header_checksum_valid(header: &[u8]) -> bool {
    let mut sum: u32 = 0;
    for (i, word) in header.chunks_exact(2).enumerate() {
        if i == 5 {
            continue; // checksum field itself, treated as zero per RFC 791
        }
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16) == u16::from_be_bytes([header[10], header[11]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let hdr = Ipv4Header::new(
            7,
            HEADER_LEN as u16 + 4,
            PROTO_TCP,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        );
        let bytes = hdr.encode();
        let decoded = Ipv4Header::decode(&bytes).expect("valid header");
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.src, hdr.src);
        assert_eq!(decoded.dst, hdr.dst);
        assert_eq!(decoded.protocol, PROTO_TCP);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let hdr = Ipv4Header::new(1, 20, PROTO_TCP, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED);
        let mut bytes = hdr.encode();
        bytes[1] ^= 0xff; // flip a byte outside the checksum field
        assert!(Ipv4Header::decode(&bytes).is_none());
    }

    #[test]
    fn id_generator_is_monotonic_and_wraps() {
        let gen = IpIdGenerator::new();
        assert_eq!(gen.next(), 0);
        assert_eq!(gen.next(), 1);

        let gen2 = IpIdGenerator(Arc::new(AtomicU16::new(u16::MAX)));
        assert_eq!(gen2.next(), u16::MAX);
        assert_eq!(gen2.next(), 0);
    }
}
