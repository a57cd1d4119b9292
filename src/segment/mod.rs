//! TCP header + IPv4 header encode/decode with checksums — the wire
//! boundary the core emits and consumes directly (spec.md §1, §4.4),
//! built on `etherparse` the way the teacher's `tcp/ioutil.rs` and
//! `lib.rs` do.

pub mod ipv4;

use std::net::Ipv4Addr;

use etherparse::{TcpHeader as EtherTcpHeader, TcpHeaderSlice};

pub use ipv4::{IpIdGenerator, Ipv4Header};

pub const TCP_HEADER_LEN: usize = 20;

/// RFC 793 TCP header, 20 bytes, no options (data offset fixed to 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seqno: u32,
    pub ackno: u32,
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
    pub window: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    fn to_etherparse(&self) -> EtherTcpHeader {
        let mut h = EtherTcpHeader::new(self.src_port, self.dst_port, self.seqno, self.window);
        h.acknowledgment_number = self.ackno;
        h.urg = self.urg;
        h.ack = self.ack;
        h.psh = self.psh;
        h.rst = self.rst;
        h.syn = self.syn;
        h.fin = self.fin;
        h.urgent_pointer = self.urgent_ptr;
        h
    }

    /// Serialize the header and compute its checksum over the pseudo
    /// header `(src_ip, dst_ip, 0, 6, tcp_len)` + header + payload, the
    /// way `ioutil.rs` does with `tcph.calc_checksum_ipv4(...)` before
    /// `tcph.write(...)`.
    pub fn encode(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let mut h = self.to_etherparse();
        h.checksum = h
            .calc_checksum_ipv4_raw(src_ip.octets(), dst_ip.octets(), payload)
            .expect("payload fits in a u16 tcp length");

        let mut out = Vec::with_capacity(TCP_HEADER_LEN + payload.len());
        h.write(&mut out).expect("writing a fixed tcp header never fails");
        out.extend_from_slice(payload);
        out
    }

    /// Decode a header from `data[..20]`, verifying the checksum against
    /// `payload = data[20..]`. Returns `None` on checksum mismatch, a
    /// truncated buffer, or a non-5 data offset (options unsupported).
    pub fn decode(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, data: &[u8]) -> Option<(Self, Vec<u8>)> {
        let slice = TcpHeaderSlice::from_slice(data).ok()?;
        if slice.data_offset() != 5 {
            return None;
        }
        let payload = data[TCP_HEADER_LEN..].to_vec();

        let expected = slice
            .calc_checksum_ipv4_raw(src_ip.octets(), dst_ip.octets(), &payload)
            .ok()?;
        if slice.checksum() != expected {
            return None;
        }

        let header = TcpHeader {
            src_port: slice.source_port(),
            dst_port: slice.destination_port(),
            seqno: slice.sequence_number(),
            ackno: slice.acknowledgment_number(),
            urg: slice.urg(),
            ack: slice.ack(),
            psh: slice.psh(),
            rst: slice.rst(),
            syn: slice.syn(),
            fin: slice.fin(),
            window: slice.window_size(),
            urgent_ptr: slice.urgent_pointer(),
        };

        Some((header, payload))
    }
}

/// A decoded TCP segment: header, payload, and the IPv4 endpoints used
/// only to recompute the pseudo-header checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
}

impl TcpSegment {
    pub fn new(header: TcpHeader, payload: Vec<u8>, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Self {
        TcpSegment {
            header,
            payload,
            src_ip,
            dst_ip,
        }
    }

    /// `len(payload) + SYN + FIN`, each flag counting one unit of
    /// sequence space.
    pub fn length_in_sequence_space(&self) -> u32 {
        self.payload.len() as u32 + self.header.syn as u32 + self.header.fin as u32
    }

    pub fn encode_tcp(&self) -> Vec<u8> {
        self.header.encode(self.src_ip, self.dst_ip, &self.payload)
    }

    /// Wrap this segment in an IPv4 datagram, assigning the next
    /// identification number from `ids`.
    pub fn encode_ipv4(&self, ids: &IpIdGenerator) -> Vec<u8> {
        let tcp_bytes = self.encode_tcp();
        let ip_header = Ipv4Header::new(
            ids.next(),
            (ipv4::HEADER_LEN + tcp_bytes.len()) as u16,
            ipv4::PROTO_TCP,
            self.src_ip,
            self.dst_ip,
        );
        let mut out = ip_header.encode();
        out.extend_from_slice(&tcp_bytes);
        out
    }

    /// Decode a full IPv4 datagram carrying a TCP segment.
    pub fn decode_ipv4(data: &[u8]) -> Option<Self> {
        let ip_header = Ipv4Header::decode(data)?;
        if ip_header.protocol != ipv4::PROTO_TCP {
            return None;
        }
        let (header, payload) =
            TcpHeader::decode(ip_header.src, ip_header.dst, &data[ipv4::HEADER_LEN..])?;
        Some(TcpSegment::new(header, payload, ip_header.src, ip_header.dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (Ipv4Addr, Ipv4Addr) {
        (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
    }

    #[test]
    fn tcp_header_roundtrip() {
        let (src, dst) = addrs();
        let hdr = TcpHeader {
            src_port: 1234,
            dst_port: 80,
            seqno: 1000,
            ackno: 2000,
            ack: true,
            psh: true,
            window: 8192,
            ..Default::default()
        };
        let payload = b"hello";
        let bytes = hdr.encode(src, dst, payload);
        let (decoded, decoded_payload) = TcpHeader::decode(src, dst, &bytes).expect("valid");
        assert_eq!(decoded, hdr);
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let (src, dst) = addrs();
        let hdr = TcpHeader {
            syn: true,
            ..Default::default()
        };
        let mut bytes = hdr.encode(src, dst, &[]);
        bytes[0] ^= 0xff;
        assert!(TcpHeader::decode(src, dst, &bytes).is_none());
    }

    #[test]
    fn length_in_sequence_space_counts_syn_and_fin() {
        let (src, dst) = addrs();
        let mut header = TcpHeader::default();
        header.syn = true;
        header.fin = true;
        let seg = TcpSegment::new(header, b"abcd".to_vec(), src, dst);
        assert_eq!(seg.length_in_sequence_space(), 6);
    }

    #[test]
    fn ipv4_wrapped_segment_roundtrips() {
        let (src, dst) = addrs();
        let header = TcpHeader {
            src_port: 9,
            dst_port: 10,
            syn: true,
            ..Default::default()
        };
        let seg = TcpSegment::new(header, Vec::new(), src, dst);
        let ids = IpIdGenerator::new();
        let datagram = seg.encode_ipv4(&ids);
        let decoded = TcpSegment::decode_ipv4(&datagram).expect("valid datagram");
        assert_eq!(decoded.header.src_port, 9);
        assert_eq!(decoded.header.syn, true);
    }
}
