//! A user-space TCP stack: one background thread multiplexes a TUN
//! device across many per-quad [`Connection`]s, driving each one's
//! `tick`/`segment_received` and waking whatever [`TcpStream`]/
//! [`TcpListener`] handle is blocked on it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;
use tracing::{debug, trace, warn};

mod adapter;
mod byte_stream;
mod config;
mod err;
mod reassembler;
mod segment;
mod seq;
mod tcp;

pub use adapter::{SegmentSink, SegmentSource, TunAdapter};
pub use byte_stream::ByteStream;
pub use config::{FdAdapterConfig, TcpConfig};
pub use err::Error;
pub use segment::{TcpHeader, TcpSegment};
pub use tcp::{Connection, Dual, Quad, State, TcpListener, TcpStream};

/// How long the event loop's `poll` blocks between iterations; bounds
/// the latency between a tick becoming due and it actually firing.
const POLL_TIMEOUT_MS: i32 = 10;
const EPHEMERAL_PORT_BASE: u16 = 40_000;
const EPHEMERAL_PORT_TOP: u16 = 60_000;

/// How a connection's quad came to exist, so the event loop knows
/// whether reaching ESTABLISHED should wake a listener's `accept` queue
/// or a blocked `connect` call.
#[derive(Debug, Clone, Copy)]
enum Origin {
    Listener(u16),
    Active,
}

#[derive(Debug)]
pub(crate) struct ConnEntry {
    pub(crate) conn: Connection,
    origin: Origin,
    pub(crate) rvar: Arc<Condvar>,
    pub(crate) wvar: Arc<Condvar>,
    pub(crate) svar: Arc<Condvar>,
    evar: Arc<Condvar>,
}

impl ConnEntry {
    fn new(conn: Connection, origin: Origin) -> Self {
        ConnEntry {
            conn,
            origin,
            rvar: Arc::new(Condvar::new()),
            wvar: Arc::new(Condvar::new()),
            svar: Arc::new(Condvar::new()),
            evar: Arc::new(Condvar::new()),
        }
    }

    fn wake(&self) {
        self.rvar.notify_all();
        self.wvar.notify_all();
        self.svar.notify_all();
        self.evar.notify_all();
    }
}

#[derive(Debug)]
pub(crate) struct EstabEntry {
    pub(crate) cvar: Arc<Condvar>,
    pub(crate) queue: VecDeque<Quad>,
}

/// All per-quad state shared between the event loop thread and the
/// `TcpListener`/`TcpStream` handles the application holds.
#[derive(Debug)]
pub struct Manager {
    config: TcpConfig,
    local_addr: Ipv4Addr,
    next_ephemeral: u16,
    pub(crate) bounded: HashSet<u16>,
    pub(crate) established: HashMap<u16, EstabEntry>,
    pub(crate) connections: HashMap<Quad, ConnEntry>,
}

impl Manager {
    fn next_ephemeral_port(&mut self) -> u16 {
        loop {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port + 1 >= EPHEMERAL_PORT_TOP {
                EPHEMERAL_PORT_BASE
            } else {
                port + 1
            };
            if !self.connections.keys().any(|q| q.dst.port == port) {
                return port;
            }
        }
    }
}

/// Owns the TUN device and the event loop thread driving every
/// connection multiplexed over it.
#[derive(Debug)]
pub struct NetStack {
    manager: Arc<Mutex<Manager>>,
    jh: thread::JoinHandle<()>,
}

impl NetStack {
    /// Bring up `name` with the given address/netmask and spawn the
    /// event loop, using the default [`TcpConfig`].
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, Error> {
        Self::with_config(name, addr, mask, TcpConfig::default())
    }

    pub fn with_config(name: &str, addr: Ipv4Addr, mask: Ipv4Addr, config: TcpConfig) -> Result<Self, Error> {
        let tun = Tun::new(name, false)?;
        tun.set_addr(addr)?;
        tun.set_netmask(mask)?;
        tun.bring_up()?;

        let manager = Arc::new(Mutex::new(Manager {
            config,
            local_addr: addr,
            next_ephemeral: EPHEMERAL_PORT_BASE,
            bounded: HashSet::new(),
            established: HashMap::new(),
            connections: HashMap::new(),
        }));

        let adapter = TunAdapter::new(tun);

        let jh = {
            let manager = manager.clone();
            thread::spawn(move || segment_loop(adapter, manager))
        };

        Ok(NetStack { manager, jh })
    }

    /// Reserve `port` for incoming connections.
    pub fn bind(&self, port: u16) -> Result<TcpListener, Error> {
        let mut manager = self.manager.lock().unwrap();
        if !manager.bounded.insert(port) {
            return Err(Error::PortInUse(port));
        }
        let cvar = Arc::new(Condvar::new());
        manager.established.insert(
            port,
            EstabEntry {
                cvar: cvar.clone(),
                queue: VecDeque::new(),
            },
        );
        Ok(TcpListener {
            port,
            manager: self.manager.clone(),
            cvar,
        })
    }

    /// Active-open a connection to `(daddr, dport)` from a freshly
    /// assigned ephemeral local port, blocking until the handshake
    /// completes.
    pub fn connect(&self, daddr: Ipv4Addr, dport: u16) -> Result<TcpStream, Error> {
        let mut manager = self.manager.lock().unwrap();

        let sport = manager.next_ephemeral_port();
        let quad = Quad {
            src: Dual { ipv4: daddr, port: dport },
            dst: Dual {
                ipv4: manager.local_addr,
                port: sport,
            },
        };

        let mut conn = Connection::with_random_isn(manager.config);
        conn.connect();

        let entry = ConnEntry::new(conn, Origin::Active);
        let (rvar, wvar, svar, evar) = (
            entry.rvar.clone(),
            entry.wvar.clone(),
            entry.svar.clone(),
            entry.evar.clone(),
        );
        manager.connections.insert(quad, entry);

        manager = evar
            .wait_while(manager, |manager| {
                manager
                    .connections
                    .get(&quad)
                    .map(|entry| entry.conn.state() == State::SynSent)
                    .unwrap_or(false)
            })
            .unwrap();

        let established = manager
            .connections
            .get(&quad)
            .map(|entry| entry.conn.state() == State::Established)
            .unwrap_or(false);
        drop(manager);

        if !established {
            return Err(Error::ConnectionRefused(quad.src));
        }

        Ok(TcpStream {
            manager: self.manager.clone(),
            quad,
            rvar,
            wvar,
            svar,
            closed: false,
        })
    }

    /// Block until the event loop thread exits (it never does on its
    /// own; this is for harnesses that join after a panic/abort).
    pub fn join(self) {
        self.jh.join().unwrap();
    }
}

fn segment_loop(mut adapter: TunAdapter, manager: Arc<Mutex<Manager>>) -> ! {
    let mut last_tick = Instant::now();
    loop {
        let ms = last_tick.elapsed().as_millis() as u64;
        last_tick = Instant::now();

        {
            let mut manager = manager.lock().unwrap();
            tick_all(&mut manager, &mut adapter, ms);
        }

        let fd = adapter.tun().as_raw_fd();
        let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
        let ready = poll(&mut pfd[..], POLL_TIMEOUT_MS).unwrap_or(0);
        if ready == 0 {
            continue;
        }

        let seg = match adapter.recv() {
            Ok(Some(seg)) => seg,
            Ok(None) | Err(_) => continue,
        };

        let mut manager = manager.lock().unwrap();
        dispatch(&mut manager, &mut adapter, seg);
    }
}

/// Advance every connection's retransmission timer, flush whatever it
/// queued, and reap anything that has fully torn down.
fn tick_all(manager: &mut Manager, adapter: &mut TunAdapter, ms: u64) {
    if ms == 0 {
        return;
    }

    let mut dead = Vec::new();
    for (quad, entry) in manager.connections.iter_mut() {
        entry.conn.tick(ms);
        flush(adapter, quad, &mut entry.conn);
        entry.wake();
        if entry.conn.state() == State::Closed || !entry.conn.active() {
            dead.push(*quad);
        }
    }
    for quad in dead {
        remove_connection(manager, quad);
    }
}

/// Route one inbound segment to its connection, spin up a new
/// SYN_RECEIVED connection for a bound listening port, or reset an
/// unrecognized one.
fn dispatch(manager: &mut Manager, adapter: &mut TunAdapter, seg: TcpSegment) {
    let quad = Quad {
        src: Dual {
            ipv4: seg.src_ip,
            port: seg.header.src_port,
        },
        dst: Dual {
            ipv4: seg.dst_ip,
            port: seg.header.dst_port,
        },
    };

    if manager.connections.contains_key(&quad) {
        let (became_established, origin, torn_down) = {
            let entry = manager.connections.get_mut(&quad).unwrap();
            let was_syn_rcvd = entry.conn.state() == State::SynRcvd;
            trace!(?quad, state = %entry.conn.state(), "segment_received");
            entry.conn.segment_received(seg);
            flush(adapter, &quad, &mut entry.conn);
            entry.wake();
            let became_established = was_syn_rcvd && entry.conn.state() == State::Established;
            let torn_down = entry.conn.state() == State::Closed || !entry.conn.active();
            (became_established, entry.origin, torn_down)
        };

        if became_established {
            if let Origin::Listener(port) = origin {
                if let Some(estab) = manager.established.get_mut(&port) {
                    estab.queue.push_back(quad);
                    estab.cvar.notify_one();
                }
            }
        }
        if torn_down {
            remove_connection(manager, quad);
        }
        return;
    }

    if seg.header.syn && !seg.header.ack && manager.bounded.contains(&quad.dst.port) {
        debug!(?quad, "accepting new connection");
        let mut conn = Connection::with_random_isn(manager.config);
        conn.set_listening();
        conn.segment_received(seg);
        flush(adapter, &quad, &mut conn);
        manager
            .connections
            .insert(quad, ConnEntry::new(conn, Origin::Listener(quad.dst.port)));
        return;
    }

    if seg.header.rst {
        return;
    }

    let rst = reset_for_unknown(&seg);
    if let Err(err) = adapter.send(&rst) {
        warn!(?err, ?quad, "failed to send reset for unrecognized segment");
    }
}

fn flush(adapter: &mut TunAdapter, quad: &Quad, conn: &mut Connection) {
    while let Some(mut seg) = conn.pop_segment_out() {
        seg.header.src_port = quad.dst.port;
        seg.header.dst_port = quad.src.port;
        seg.src_ip = quad.dst.ipv4;
        seg.dst_ip = quad.src.ipv4;
        if let Err(err) = adapter.send(&seg) {
            warn!(?err, ?quad, "failed to send segment");
        }
    }
}

fn remove_connection(manager: &mut Manager, quad: Quad) {
    if let Some(entry) = manager.connections.remove(&quad) {
        entry.wake();
    }
}

/// Build an RFC 793 §3.4 reset for a segment that matches no known
/// connection and no bound listening port.
fn reset_for_unknown(seg: &TcpSegment) -> TcpSegment {
    let header = if seg.header.ack {
        TcpHeader {
            src_port: seg.header.dst_port,
            dst_port: seg.header.src_port,
            seqno: seg.header.ackno,
            rst: true,
            ..Default::default()
        }
    } else {
        let ackno = seg
            .header
            .seqno
            .wrapping_add(seg.payload.len() as u32)
            .wrapping_add(seg.header.syn as u32)
            .wrapping_add(seg.header.fin as u32);
        TcpHeader {
            src_port: seg.header.dst_port,
            dst_port: seg.header.src_port,
            seqno: 0,
            ackno,
            ack: true,
            rst: true,
            ..Default::default()
        }
    };
    TcpSegment::new(header, Vec::new(), seg.dst_ip, seg.src_ip)
}
