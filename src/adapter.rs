//! The AdapterContract: abstract read/write of [`TcpSegment`]s over
//! whatever link actually carries them. The core only ever talks to
//! these two traits; it never touches a file descriptor directly.
//!
//! `TunAdapter` is the one adapter this crate ships, wrapping IPv4
//! encode/decode around the inner TCP segment the way
//! `TcpOverIpv4OverTunAdapter` does in the source this crate is
//! distilled from. A UDP-as-datagram adapter would implement the same
//! two traits without the IPv4 framing step; it is left unimplemented
//! here, same as the source leaves it a stub.

use std::io::{self, Read, Write};

use tidy_tuntap::Tun;

use crate::segment::{IpIdGenerator, TcpSegment};

/// Anything the core can pull a decoded, checksum-verified segment from.
pub trait SegmentSource {
    /// Returns `Ok(None)` when a datagram was read but failed to decode
    /// as a valid TCP-over-IPv4 segment (malformed segments are dropped
    /// by the codec, not surfaced as an error).
    fn recv(&mut self) -> io::Result<Option<TcpSegment>>;
}

/// Anything the core can hand an encoded segment to for transmission.
pub trait SegmentSink {
    fn send(&mut self, seg: &TcpSegment) -> io::Result<()>;
}

/// Carries TCP segments as the payload of IPv4 datagrams read from and
/// written to a TUN device.
#[derive(Debug)]
pub struct TunAdapter {
    tun: Tun,
    ids: IpIdGenerator,
}

impl TunAdapter {
    pub fn new(tun: Tun) -> Self {
        TunAdapter {
            tun,
            ids: IpIdGenerator::new(),
        }
    }

    pub fn tun(&self) -> &Tun {
        &self.tun
    }

    pub fn tun_mut(&mut self) -> &mut Tun {
        &mut self.tun
    }
}

impl SegmentSource for TunAdapter {
    fn recv(&mut self) -> io::Result<Option<TcpSegment>> {
        let mut buf = [0u8; 1500];
        let n = self.tun.read(&mut buf)?;
        Ok(TcpSegment::decode_ipv4(&buf[..n]))
    }
}

impl SegmentSink for TunAdapter {
    fn send(&mut self, seg: &TcpSegment) -> io::Result<()> {
        let datagram = seg.encode_ipv4(&self.ids);
        self.tun.write_all(&datagram)
    }
}
