//! The per-connection TCP engine: FSM, sender, receiver, retransmission.
//!
//! Ported from `TcpConnection` (the source this crate's core is distilled
//! from) with the FIN_WAIT_1/FIN_WAIT_2/CLOSING/TIME_WAIT handlers — left
//! as stubs there — fully implemented per the FSM transition table, and
//! the sender window/ACK bookkeeping corrected where the source used the
//! wrong field (`next_expected_ackno` keyed off our own ack field instead
//! of the first unacked segment's sequence number).

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use tracing::{debug, trace, warn};

use crate::byte_stream::ByteStream;
use crate::config::TcpConfig;
use crate::reassembler::Reassembler;
use crate::seq;
use crate::segment::{TcpHeader, TcpSegment};

use super::state::State;

#[derive(Debug)]
pub struct Connection {
    config: TcpConfig,
    state: State,
    active: bool,

    sender_isn: u32,
    next_seqno_abs: u64,
    receiver_window_size: u16,
    timer_enabled: bool,
    time_elapsed: u64,
    rto: u64,
    consecutive_retx: u32,
    fin_sent: bool,

    /// Bytes handed to [`Connection::write`], waiting to go out on the wire.
    inbound: ByteStream,
    /// Sent segments carrying sequence space, awaiting cumulative ACK.
    outgoing: VecDeque<TcpSegment>,
    /// Segments ready for the adapter to drain.
    segments_out: VecDeque<TcpSegment>,

    receiver_isn: Option<u32>,
    reassembler: Reassembler,
    fin_received: bool,

    time_wait_elapsed: u64,
}

impl Connection {
    pub fn new(config: TcpConfig, sender_isn: u32) -> Self {
        let send_capacity = config.send_capacity;
        let recv_capacity = config.recv_capacity;
        let rt_timeout = config.rt_timeout;
        Connection {
            config,
            state: State::Closed,
            active: true,
            sender_isn,
            next_seqno_abs: 0,
            receiver_window_size: 0,
            timer_enabled: false,
            time_elapsed: 0,
            rto: rt_timeout,
            consecutive_retx: 0,
            fin_sent: false,
            inbound: ByteStream::new(send_capacity),
            outgoing: VecDeque::new(),
            segments_out: VecDeque::new(),
            receiver_isn: None,
            reassembler: Reassembler::new(recv_capacity),
            fin_received: false,
            time_wait_elapsed: 0,
        }
    }

    pub fn with_random_isn(config: TcpConfig) -> Self {
        Connection::new(config, rand::random())
    }

    // ---- external triggers -------------------------------------------

    pub fn connect(&mut self) {
        assert_eq!(
            self.state,
            State::Closed,
            "connect() called from a non-CLOSED state"
        );
        let header = TcpHeader {
            syn: true,
            ..Default::default()
        };
        self.send_segment(blank_segment(header));
        self.state = State::SynSent;
        debug!(isn = self.sender_isn, "connect: sent SYN");
    }

    pub fn set_listening(&mut self) {
        assert_eq!(
            self.state,
            State::Closed,
            "set_listening() called from a non-CLOSED state"
        );
        self.state = State::Listen;
    }

    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let n = self.inbound.write(data);
        self.fill_window();
        n
    }

    pub fn shutdown_write(&mut self) {
        self.inbound.end_input();
        self.fill_window();
    }

    pub fn segment_received(&mut self, seg: TcpSegment) {
        trace!(state = %self.state, flags = ?seg.header, "segment_received");
        match self.state {
            State::Closed => {}
            State::Listen => self.fsm_listen(seg),
            State::SynSent => self.fsm_syn_sent(seg),
            State::SynRcvd => self.fsm_syn_received(seg),
            State::Established | State::CloseWait => self.fsm_established_or_close_wait(seg),
            State::LastAck => self.fsm_last_ack(seg),
            State::FinWait1 => self.fsm_fin_wait_1(seg),
            State::FinWait2 => self.fsm_fin_wait_2(seg),
            State::Closing => self.fsm_closing(seg),
            State::TimeWait => self.fsm_time_wait(seg),
        }
    }

    pub fn tick(&mut self, ms: u64) {
        if self.state == State::TimeWait {
            self.time_wait_elapsed += ms;
            if self.time_wait_elapsed >= 2 * self.config.msl {
                debug!("TIME_WAIT expired, closing");
                self.state = State::Closed;
            }
            return;
        }

        if !self.timer_enabled {
            return;
        }
        self.time_elapsed += ms;
        if self.time_elapsed < self.rto {
            return;
        }

        if self.consecutive_retx >= self.config.max_retx_attempts {
            warn!(
                attempts = self.consecutive_retx,
                "retransmission exhausted, resetting connection"
            );
            self.active = false;
            self.inbound.set_error(true);
            self.reassembler.output_mut().set_error(true);
            self.timer_enabled = false;

            let header = TcpHeader {
                seqno: seq::wrap(self.next_seqno_abs, self.sender_isn),
                rst: true,
                ack: self.ackno().is_some(),
                ackno: self.ackno().unwrap_or(0),
                window: self.window_size().min(u16::MAX as usize) as u16,
                ..Default::default()
            };
            self.segments_out.push_back(blank_segment(header));
            return;
        }

        if let Some(seg) = self.outgoing.front().cloned() {
            debug!(seqno = seg.header.seqno, "retransmitting");
            self.segments_out.push_back(seg);
        }
        if self.receiver_window_size > 0 {
            self.rto = self.rto.saturating_mul(2);
        }
        self.consecutive_retx += 1;
        self.time_elapsed = 0;
    }

    // ---- getters -------------------------------------------------------

    pub fn state(&self) -> State {
        self.state
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn syn_received(&self) -> bool {
        self.receiver_isn.is_some()
    }

    pub fn inbound_stream(&self) -> &ByteStream {
        &self.inbound
    }

    pub fn inbound_stream_mut(&mut self) -> &mut ByteStream {
        &mut self.inbound
    }

    pub fn outbound_stream(&self) -> &ByteStream {
        self.reassembler.output()
    }

    pub fn outbound_stream_mut(&mut self) -> &mut ByteStream {
        self.reassembler.output_mut()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.outgoing
            .iter()
            .map(|s| s.length_in_sequence_space() as u64)
            .sum()
    }

    pub fn window_size(&self) -> usize {
        self.config
            .recv_capacity
            .saturating_sub(self.reassembler.output().size())
    }

    pub fn ackno(&self) -> Option<u32> {
        let isn = self.receiver_isn?;
        let extra = if self.fin_received { 1 } else { 0 };
        Some(seq::wrap(1 + self.reassembler.ack_index() + extra, isn))
    }

    pub fn next_seqno(&self) -> u32 {
        seq::wrap(self.next_seqno_abs, self.sender_isn)
    }

    pub fn pop_segment_out(&mut self) -> Option<TcpSegment> {
        self.segments_out.pop_front()
    }

    pub fn has_segments_out(&self) -> bool {
        !self.segments_out.is_empty()
    }

    // ---- FSM handlers ----------------------------------------------------

    fn fsm_listen(&mut self, seg: TcpSegment) {
        if !seg.header.syn {
            return;
        }
        self.receiver_isn = Some(seg.header.seqno);
        let header = TcpHeader {
            syn: true,
            ..Default::default()
        };
        self.send_segment(blank_segment(header));
        self.state = State::SynRcvd;
    }

    fn fsm_syn_sent(&mut self, seg: TcpSegment) {
        let expected_ackno = seq::uint32_plus(self.sender_isn, 1);
        if !(seg.header.syn && seg.header.ack && seg.header.ackno == expected_ackno) {
            return;
        }
        self.receiver_isn = Some(seg.header.seqno);
        self.receiver_window_size = seg.header.window;
        self.ack_received(seg.header.ackno);
        self.send_empty_segment();
        self.state = State::Established;
    }

    fn fsm_syn_received(&mut self, seg: TcpSegment) {
        let receiver_isn = self.receiver_isn.expect("receiver ISN set in LISTEN");
        let expected_seqno = seq::uint32_plus(receiver_isn, 1);
        let expected_ackno = seq::uint32_plus(self.sender_isn, 1);
        if !(seg.header.ack && seg.header.seqno == expected_seqno && seg.header.ackno == expected_ackno)
        {
            return;
        }
        self.receiver_window_size = seg.header.window;
        self.ack_received(seg.header.ackno);
        self.state = State::Established;
    }

    fn fsm_established_or_close_wait(&mut self, seg: TcpSegment) {
        let was_established = self.state == State::Established;
        let saw_fin = self.process_incoming(&seg);
        if saw_fin && was_established {
            self.state = State::CloseWait;
        }

        if self.state == State::CloseWait
            && self.inbound.eof()
            && self.bytes_in_flight() == 0
            && self.reassembler.finished()
        {
            self.fill_window();
        }
    }

    fn fsm_last_ack(&mut self, seg: TcpSegment) {
        let expected_ackno = seq::wrap(self.next_seqno_abs, self.sender_isn);
        if !(seg.header.ack && seg.header.ackno == expected_ackno) {
            return;
        }
        self.state = State::Closed;
    }

    fn fsm_fin_wait_1(&mut self, seg: TcpSegment) {
        let had_unacked_fin = self.outgoing.iter().any(|s| s.header.fin);
        let saw_fin = self.process_incoming(&seg);
        let fin_now_acked = had_unacked_fin && !self.outgoing.iter().any(|s| s.header.fin);

        match (fin_now_acked, saw_fin) {
            (true, true) => {
                self.state = State::TimeWait;
                self.time_wait_elapsed = 0;
            }
            (true, false) => self.state = State::FinWait2,
            (false, true) => self.state = State::Closing,
            (false, false) => {}
        }
    }

    fn fsm_fin_wait_2(&mut self, seg: TcpSegment) {
        let saw_fin = self.process_incoming(&seg);
        if saw_fin {
            self.state = State::TimeWait;
            self.time_wait_elapsed = 0;
        }
    }

    fn fsm_closing(&mut self, seg: TcpSegment) {
        let had_unacked_fin = self.outgoing.iter().any(|s| s.header.fin);
        self.process_incoming(&seg);
        let fin_now_acked = had_unacked_fin && !self.outgoing.iter().any(|s| s.header.fin);
        if fin_now_acked {
            self.state = State::TimeWait;
            self.time_wait_elapsed = 0;
        }
    }

    fn fsm_time_wait(&mut self, seg: TcpSegment) {
        // Open question resolved: a repeated peer FIN re-ACKs and restarts
        // the 2*MSL timer instead of being ignored.
        if seg.header.fin {
            self.send_empty_segment();
            self.time_wait_elapsed = 0;
        }
    }

    /// Shared receiver-side processing for any state past SYN exchange:
    /// feed payload/FIN into the reassembler, apply ACKs, ACK bare data.
    /// Returns whether this segment carried a not-previously-seen FIN.
    fn process_incoming(&mut self, seg: &TcpSegment) -> bool {
        let mut saw_fin = false;
        let mut has_payload = false;
        if let Some(isn) = self.receiver_isn {
            let checkpoint = self.reassembler.ack_index();
            let seqno_abs = seq::unwrap(seg.header.seqno, isn, checkpoint);
            let stream_index = seqno_abs.saturating_sub(1);
            if seg.header.fin && !self.fin_received {
                saw_fin = true;
                self.fin_received = true;
            }
            if !seg.payload.is_empty() || seg.header.fin {
                self.reassembler
                    .data_received(stream_index, &seg.payload, seg.header.fin);
            }
            has_payload = !seg.payload.is_empty();
        }

        if seg.header.ack {
            self.receiver_window_size = seg.header.window;
            self.ack_received(seg.header.ackno);
        }
        if has_payload || saw_fin {
            self.send_empty_segment();
        }

        saw_fin
    }

    // ---- sender internals ------------------------------------------------

    fn first_unacked_abs(&self) -> u64 {
        match self.outgoing.front() {
            None => self.next_seqno_abs,
            Some(seg) => seq::unwrap(seg.header.seqno, self.sender_isn, self.next_seqno_abs),
        }
    }

    fn ack_valid(&self, ackno_abs: u64) -> bool {
        if ackno_abs > self.next_seqno_abs {
            return false;
        }
        self.first_unacked_abs() <= ackno_abs
    }

    fn ack_received(&mut self, ackno: u32) {
        let ackno_abs = seq::unwrap(ackno, self.sender_isn, self.next_seqno_abs);
        if !self.ack_valid(ackno_abs) {
            return;
        }

        let mut acked_any = false;
        while let Some(seg) = self.outgoing.front() {
            let seg_seqno_abs = seq::unwrap(seg.header.seqno, self.sender_isn, self.next_seqno_abs);
            let seg_end_abs = seg_seqno_abs + seg.length_in_sequence_space() as u64;
            if ackno_abs >= seg_end_abs {
                self.outgoing.pop_front();
                acked_any = true;
            } else {
                break;
            }
        }

        if acked_any {
            self.rto = self.config.rt_timeout;
            self.consecutive_retx = 0;
            self.time_elapsed = 0;
        }
        if self.outgoing.is_empty() {
            self.timer_enabled = false;
        }
        self.fill_window();
    }

    /// Slice the inbound stream into at most `MAX_PAYLOAD_SIZE` segments
    /// until the receiver's window is exhausted, emitting a trailing FIN
    /// once the stream is drained and ended. Zero-window is treated as a
    /// window of 1 to allow a probe segment through.
    fn fill_window(&mut self) {
        if self.fin_sent {
            return;
        }
        let window = self.receiver_window_size.max(1) as u64;
        let window_right = self.first_unacked_abs() + window;

        loop {
            let free = window_right.saturating_sub(self.next_seqno_abs);
            if free == 0 {
                break;
            }

            let available = self.inbound.size() as u64;
            let stream_ended = self.inbound.input_ended();
            if available == 0 && !stream_ended {
                break;
            }

            let take = free.min(self.config.max_payload_size as u64).min(available) as usize;
            let payload = if take > 0 {
                self.inbound.read(take)
            } else {
                Vec::new()
            };

            let will_fin = stream_ended && self.inbound.empty();
            if payload.is_empty() && !will_fin {
                break;
            }

            let header = TcpHeader {
                fin: will_fin,
                ..Default::default()
            };
            self.send_segment(TcpSegment::new(
                header,
                payload,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
            ));

            if will_fin {
                self.fin_sent = true;
                match self.state {
                    State::Established => self.state = State::FinWait1,
                    State::CloseWait => self.state = State::LastAck,
                    _ => {}
                }
                break;
            }
        }
    }

    fn send_empty_segment(&mut self) {
        self.send_segment(blank_segment(TcpHeader::default()));
    }

    fn send_segment(&mut self, mut seg: TcpSegment) {
        seg.header.seqno = seq::wrap(self.next_seqno_abs, self.sender_isn);
        self.next_seqno_abs += seg.length_in_sequence_space() as u64;

        if let Some(ackno) = self.ackno() {
            seg.header.ack = true;
            seg.header.ackno = ackno;
        }
        seg.header.window = self.window_size().min(u16::MAX as usize) as u16;

        let carries_seq = seg.length_in_sequence_space() > 0;
        self.segments_out.push_back(seg.clone());
        if carries_seq {
            self.outgoing.push_back(seg);
            if !self.timer_enabled {
                self.timer_enabled = true;
                self.time_elapsed = 0;
            }
        }
    }
}

fn blank_segment(header: TcpHeader) -> TcpSegment {
    TcpSegment::new(header, Vec::new(), Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TcpConfig {
        TcpConfig::default()
    }

    fn data_segment(payload: &[u8], seqno: u32, ackno: u32, window: u16, ack: bool) -> TcpSegment {
        let header = TcpHeader {
            seqno,
            ackno,
            ack,
            window,
            ..Default::default()
        };
        TcpSegment::new(header, payload.to_vec(), Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
    }

    fn drain(conn: &mut Connection) -> Vec<TcpSegment> {
        let mut out = Vec::new();
        while let Some(seg) = conn.pop_segment_out() {
            out.push(seg);
        }
        out
    }

    #[test]
    fn three_way_handshake_active_open() {
        let mut conn = Connection::new(cfg(), 10000);
        conn.connect();
        let out = drain(&mut conn);
        assert_eq!(out.len(), 1);
        assert!(out[0].header.syn);
        assert_eq!(out[0].header.seqno, 10000);
        assert_eq!(conn.state(), State::SynSent);

        let mut synack = data_segment(&[], 20000, seq::uint32_plus(10000, 1), 4000, true);
        synack.header.syn = true;
        conn.segment_received(synack);

        let out = drain(&mut conn);
        assert_eq!(out.len(), 1);
        assert!(out[0].header.ack);
        assert_eq!(out[0].header.ackno, seq::uint32_plus(20000, 1));
        assert_eq!(conn.state(), State::Established);
    }

    #[test]
    fn three_way_handshake_passive_open() {
        let mut conn = Connection::new(cfg(), 10000);
        conn.set_listening();
        assert_eq!(conn.state(), State::Listen);

        let mut syn = data_segment(&[], 20000, 0, 4000, false);
        syn.header.syn = true;
        conn.segment_received(syn);

        let out = drain(&mut conn);
        assert_eq!(out.len(), 1);
        assert!(out[0].header.syn && out[0].header.ack);
        assert_eq!(out[0].header.seqno, 10000);
        assert_eq!(out[0].header.ackno, seq::uint32_plus(20000, 1));
        assert_eq!(conn.state(), State::SynRcvd);

        let ack = data_segment(
            &[],
            seq::uint32_plus(20000, 1),
            seq::uint32_plus(10000, 1),
            4000,
            true,
        );
        conn.segment_received(ack);
        assert_eq!(conn.state(), State::Established);
    }

    fn established_passive(isn_self: u32, isn_peer: u32, window: u16) -> Connection {
        let mut conn = Connection::new(cfg(), isn_self);
        conn.set_listening();
        let mut syn = data_segment(&[], isn_peer, 0, window, false);
        syn.header.syn = true;
        conn.segment_received(syn);
        drain(&mut conn);
        let ack = data_segment(
            &[],
            seq::uint32_plus(isn_peer, 1),
            seq::uint32_plus(isn_self, 1),
            window,
            true,
        );
        conn.segment_received(ack);
        conn
    }

    #[test]
    fn out_of_order_reassembly() {
        let mut conn = established_passive(5000, 1000, 4000);

        let seg1 = data_segment(b"efgh", 1005, seq::uint32_plus(5000, 1), 4000, true);
        conn.segment_received(seg1);
        assert_eq!(conn.outbound_stream().peek_output(10), b"");

        let seg2 = data_segment(b"abcd", 1001, seq::uint32_plus(5000, 1), 4000, true);
        conn.segment_received(seg2);
        assert_eq!(conn.outbound_stream().peek_output(10), b"abcdefgh");
        assert_eq!(conn.ackno(), Some(1009));
    }

    #[test]
    fn flow_control_respects_advertised_window() {
        let mut conn = established_passive(5000, 1000, 3);
        conn.write(b"01234567");

        let out = drain(&mut conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, b"012");
        assert_eq!(conn.bytes_in_flight(), 3);

        let ack = data_segment(&[], 1001, seq::uint32_plus(5000, 4), 5, true);
        conn.segment_received(ack);

        let out = drain(&mut conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, b"34567");
        assert!(conn.bytes_in_flight() <= 5);
    }

    #[test]
    fn zero_window_is_treated_as_one_for_probing() {
        let mut conn = established_passive(5000, 1000, 0);
        conn.write(b"abc");

        let out = drain(&mut conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, b"a");
        assert_eq!(conn.bytes_in_flight(), 1);

        let ack = data_segment(&[], 1001, seq::uint32_plus(5000, 2), 4000, true);
        conn.segment_received(ack);

        let out = drain(&mut conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, b"bc");
    }

    #[test]
    fn retransmission_backs_off_then_resets() {
        let mut conn = established_passive(5000, 1000, 4000);
        conn.write(b"asdf");
        drain(&mut conn);

        for _ in 0..8 {
            let due = conn.rto;
            conn.tick(due.saturating_sub(1));
            assert!(!conn.has_segments_out());
            conn.tick(1);
            let out = drain(&mut conn);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].payload, b"asdf");
        }

        // the 9th attempt: RST instead of another retransmit
        let due = conn.rto.max(1);
        conn.tick(due);
        let out = drain(&mut conn);
        assert_eq!(out.len(), 1);
        assert!(out[0].header.rst);
        assert!(!conn.active());
    }

    #[test]
    fn active_close_four_way() {
        let mut conn = established_passive(10000, 20000, 4000);
        conn.shutdown_write();

        let out = drain(&mut conn);
        assert_eq!(out.len(), 1);
        assert!(out[0].header.fin);
        assert_eq!(out[0].header.seqno, seq::uint32_plus(10000, 1));
        assert_eq!(conn.state(), State::FinWait1);

        let ack = data_segment(&[], seq::uint32_plus(20000, 1), seq::uint32_plus(10000, 2), 4000, true);
        conn.segment_received(ack);
        assert_eq!(conn.state(), State::FinWait2);

        let mut fin = data_segment(&[], seq::uint32_plus(20000, 1), seq::uint32_plus(10000, 2), 4000, true);
        fin.header.fin = true;
        conn.segment_received(fin);

        let out = drain(&mut conn);
        assert_eq!(out.len(), 1);
        assert!(out[0].header.ack);
        assert_eq!(conn.state(), State::TimeWait);

        conn.tick(2 * conn.config.msl);
        assert_eq!(conn.state(), State::Closed);
    }
}
