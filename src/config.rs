//! The only configuration parameters the engine recognizes.

use std::net::Ipv4Addr;

/// Tunable limits for a single [`crate::tcp::Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConfig {
    pub send_capacity: usize,
    pub recv_capacity: usize,
    pub max_payload_size: usize,
    pub rt_timeout: u64,
    pub max_retx_attempts: u32,
    pub msl: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            send_capacity: 64_000,
            recv_capacity: 64_000,
            max_payload_size: 1_000,
            rt_timeout: 1_000,
            max_retx_attempts: 8,
            msl: 120_000,
        }
    }
}

/// IPv4 endpoints an adapter binds a connection to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdAdapterConfig {
    pub saddr: Ipv4Addr,
    pub sport: u16,
    pub daddr: Ipv4Addr,
    pub dport: u16,
}
