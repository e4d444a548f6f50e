use std::net::{IpAddr, Ipv4Addr};

use log::{debug, trace};

use crate::app;
use crate::cookie::syn_cookie;
use crate::segment::{AckOutcome, Ownership, SendData};
use crate::table::{DestroyReason, Table};
use crate::tcb::{TcbKey, TcpPhase};
use crate::timer::Tick;
use crate::wire::tcp::Flags;
use crate::xmit::Transmit;

/// Retransmit interval armed by `SegmentQueue::send` (`SPEC_FULL.md` §4.E).
pub const RETRANSMIT_SECS: u64 = 1;
/// Re-arm interval after a `resend` (`SPEC_FULL.md` §4.E).
pub const RESEND_SECS: u64 = 2;
/// The post-dispatch safety net interval (`SPEC_FULL.md` §4.F "Safety net").
pub const SAFETY_NET_SECS: u64 = 2;
/// SYN retry interval grows with `syn_retries`, one second per attempt
/// (`SPEC_FULL.md` §4.F `SYN_SENT`/`TIMEOUT`: "schedule `now + syns_sent` s").
pub const SYN_RETRY_BASE_SECS: u64 = 1;

/// What the RX decode step classified an incoming TCP header as, before it
/// is turned into an `Event` (`DESIGN.md` Open Question 3): a segment is
/// `Ack` only when it carries no payload and no `FIN`; anything else is
/// `Data` or `Fin`. `RST` and `SYN|ACK` are recognized ahead of this
/// classification since they take priority over the payload/FIN shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Ack,
    Data,
    Fin,
}

pub fn classify_segment(flags: Flags, payload_len: usize) -> SegmentKind {
    if flags.contains(Flags::FIN) {
        SegmentKind::Fin
    } else if payload_len == 0 {
        SegmentKind::Ack
    } else {
        SegmentKind::Data
    }
}

/// The event alphabet driving the state machine (`SPEC_FULL.md` §4.F).
#[derive(Debug)]
pub enum Event {
    SynAck { seq_remote_first: u32, ack: u32 },
    Ack { ack: u32 },
    Data { seq: u32, ack: u32, payload: Vec<u8> },
    Fin { seq: u32, ack: u32 },
    Rst,
    Timeout,
}

/// Recompute the stateless SYN cookie for a SYN/ACK's 4-tuple and accept it
/// only if the packet's ack field equals `cookie + 1` (`SPEC_FULL.md` §4.C,
/// scenario 2: "stateless rejection"). `ip_local`/`port_local` are ours.
pub fn accept_synack(
    ip_local: Ipv4Addr,
    port_local: u16,
    ip_remote: Ipv4Addr,
    port_remote: u16,
    ack: u32,
    entropy: u64,
) -> bool {
    let cookie = syn_cookie(ip_local, port_local, ip_remote, port_remote, entropy);
    ack == cookie.wrapping_add(1)
}

/// Entry point for a SYN/ACK that has already passed `accept_synack`:
/// creates the TCB (idempotent — a retransmitted SYN/ACK for an
/// already-established connection just returns the existing key), seeds its
/// sequence numbers from the packet, sends the final ACK of the handshake,
/// and notifies the application bridge of `CONNECTED`
/// (`SPEC_FULL.md` §4.F `SYN_SENT -> SYNACK`, §4.G `CONNECTED`).
#[allow(clippy::too_many_arguments)]
pub fn create_from_synack(
    table: &mut Table,
    ip_local: Ipv4Addr,
    ip_remote: Ipv4Addr,
    port_local: u16,
    port_remote: u16,
    cookie: u32,
    seq_remote_first: u32,
    ttl: u8,
    stream: usize,
    now: Tick,
    transmit: &mut dyn Transmit,
) -> TcbKey {
    let key = table.create(
        IpAddr::V4(ip_local),
        IpAddr::V4(ip_remote),
        port_local,
        port_remote,
        cookie.wrapping_add(1),
        seq_remote_first,
        ttl,
        stream,
        now,
    );
    complete_handshake(table, key, seq_remote_first, now, transmit);
    key
}

/// Seed sequence numbers from a just-accepted `SYN|ACK`, send the final ACK
/// of the handshake, transition to `ESTABLISHED_RECV`, and notify the
/// application bridge of `CONNECTED` (`SPEC_FULL.md` §4.F `SYN_SENT ->
/// SYNACK`, §4.G `CONNECTED`). Shared by the stateless-creation path
/// (`create_from_synack`) and a reconnect-created TCB's own `SYN_SENT ->
/// SYNACK` transition in `dispatch`.
fn complete_handshake(table: &mut Table, key: TcbKey, seq_remote_first: u32, now: Tick, transmit: &mut dyn Transmit) {
    if let Some(tcb) = table.get_mut(key) {
        tcb.ack_remote = seq_remote_first.wrapping_add(1);
        tcb.seq_remote = tcb.ack_remote;
        tcb.seq_remote_first = seq_remote_first;
        tcb.tcp_phase = TcpPhase::EstablishedRecv;
        debug!("tcb: {key:?} SYN_SENT -> ESTABLISHED_RECV (synack accepted)");
        transmit.send_ack(tcb);
    }
    app::on_connected(table, key, now, transmit);
    ensure_timer(table, key, now);
}

/// Dispatch one event against the TCB identified by `key`
/// (`SPEC_FULL.md` §4.F transition table). Handles the universal `RST` and
/// connection-deadline cases first, then the phase-specific rows, then
/// re-arms the safety-net timer if nothing else did
/// (`SPEC_FULL.md` §4.F "Safety net", `DESIGN.md` Open Question 1).
pub fn dispatch(table: &mut Table, key: TcbKey, event: Event, now: Tick, transmit: &mut dyn Transmit) {
    let Some(tcb_phase) = table.get(key).map(|t| t.tcp_phase) else {
        return;
    };

    if matches!(event, Event::Rst) {
        debug!("tcb: {key:?} RST received, destroying");
        table.destroy(key, DestroyReason::Reset, now);
        return;
    }

    if let Event::Timeout = event {
        let age_exceeded = table
            .get(key)
            .is_some_and(|t| t.connection_age(now).as_secs() > table.conn_timeout_secs);
        if age_exceeded {
            debug!("tcb: {key:?} connection deadline exceeded, sending RST");
            if let Some(tcb) = table.get(key) {
                transmit.send_rst(tcb);
            }
            table.destroy(key, DestroyReason::Timeout, now);
            return;
        }
    }

    match (tcb_phase, event) {
        (TcpPhase::SynSent, Event::SynAck { seq_remote_first, .. }) => {
            complete_handshake(table, key, seq_remote_first, now, transmit);
            return;
        }

        (TcpPhase::SynSent, Event::Timeout) => {
            if let Some(tcb) = table.get_mut(key) {
                tcb.syn_retries += 1;
                transmit.send_syn(tcb);
            }
            let retries = table.get(key).map(|t| t.syn_retries).unwrap_or(1);
            table.arm_timer(key, now + SYN_RETRY_BASE_SECS * retries as u64);
        }

        (TcpPhase::EstablishedSend | TcpPhase::EstablishedRecv | TcpPhase::CloseWait, Event::Ack { ack }) => {
            retire_and_maybe_send_sent(table, key, ack, now, transmit);
        }

        (TcpPhase::EstablishedRecv, Event::Data { seq, ack, payload }) => {
            receive_segment(table, key, seq, payload, false, ack, now, transmit);
        }
        (TcpPhase::EstablishedSend, Event::Data { seq, ack, payload }) => {
            // payload may arrive while we are still sending; accept it the
            // same way (`SPEC_FULL.md` §4.F).
            receive_segment(table, key, seq, payload, false, ack, now, transmit);
        }

        (TcpPhase::EstablishedRecv, Event::Fin { seq, ack }) => {
            receive_segment(table, key, seq, Vec::new(), true, ack, now, transmit);
            if let Some(tcb) = table.get_mut(key) {
                tcb.tcp_phase = TcpPhase::CloseWait;
                debug!("tcb: {key:?} ESTABLISHED_RECV -> CLOSE_WAIT");
            }
        }

        (TcpPhase::EstablishedRecv, Event::Timeout) => {
            app::on_recv_timeout(table, key, now, transmit);
        }
        (TcpPhase::EstablishedSend, Event::Timeout) => {
            if let Some(tcb) = table.get_mut(key) {
                if let Some(head) = tcb.segments.resend_head() {
                    let payload = tcb.segments.head().map(|s| s.payload().to_vec()).unwrap_or_default();
                    transmit.send_segment(tcb, head, &payload);
                }
            }
            table.arm_timer(key, now + RESEND_SECS);
        }

        (TcpPhase::FinWait1, Event::Ack { ack }) => {
            let outcome = table.get_mut(key).map(|tcb| tcb.queue_acknowledge(ack));
            if matches!(outcome, Some(AckOutcome::Advanced)) {
                if let Some(tcb) = table.get_mut(key) {
                    if tcb.segments.is_empty() {
                        tcb.tcp_phase = TcpPhase::FinWait2;
                        debug!("tcb: {key:?} FIN_WAIT1 -> FIN_WAIT2");
                    }
                }
            }
        }
        (TcpPhase::FinWait2, Event::Fin { seq, ack }) => {
            receive_segment(table, key, seq, Vec::new(), true, ack, now, transmit);
            if let Some(tcb) = table.get_mut(key) {
                tcb.tcp_phase = TcpPhase::TimeWait;
                debug!("tcb: {key:?} FIN_WAIT2 -> TIME_WAIT");
            }
        }
        (TcpPhase::TimeWait, Event::Timeout) => {
            table.destroy(key, DestroyReason::GracefulClose, now);
            return;
        }

        (TcpPhase::Closing, Event::Ack { ack }) => {
            let outcome = table.get_mut(key).map(|tcb| tcb.queue_acknowledge(ack));
            if matches!(outcome, Some(AckOutcome::Advanced)) {
                if let Some(tcb) = table.get_mut(key) {
                    tcb.tcp_phase = TcpPhase::TimeWait;
                    debug!("tcb: {key:?} CLOSING -> TIME_WAIT");
                }
            }
        }
        (TcpPhase::LastAck, Event::Ack { ack }) => {
            let outcome = table.get_mut(key).map(|tcb| tcb.queue_acknowledge(ack));
            if matches!(outcome, Some(AckOutcome::Advanced)) {
                let drained = table.get(key).is_some_and(|t| t.segments.is_empty());
                if drained {
                    debug!("tcb: {key:?} LAST_ACK -> destroyed (graceful)");
                    table.destroy(key, DestroyReason::GracefulClose, now);
                    return;
                }
            }
        }

        (_, Event::Timeout) => {
            // No phase-specific handler; the safety net below re-arms.
        }
        (phase, other) => {
            trace!("tcb: {key:?} no transition for {phase:?} / {other:?}");
        }
    }

    ensure_timer(table, key, now);
}

/// Retire segments acknowledged by `ack`; if the queue drains, notify the
/// application bridge of `SEND_SENT` and fall back to `ESTABLISHED_RECV`
/// (`SPEC_FULL.md` §4.F `ESTABLISHED_* / ACK`). Also promotes to
/// `FIN_WAIT1` if the queue's new tail is a `FIN` the application queued
/// itself, and to `LAST_ACK` from `CLOSE_WAIT` under the same condition.
fn retire_and_maybe_send_sent(table: &mut Table, key: TcbKey, ack: u32, now: Tick, _transmit: &mut dyn Transmit) {
    let Some(tcb) = table.get_mut(key) else { return };
    let outcome = tcb.queue_acknowledge(ack);
    if outcome != AckOutcome::Advanced {
        return;
    }
    let drained = tcb.segments.is_empty();
    let tail_is_fin = tcb.segments.tail_is_fin();
    let was_close_wait = tcb.tcp_phase == TcpPhase::CloseWait;
    drop(tcb);

    if drained {
        app::on_send_sent(table, key, now);
    } else if tail_is_fin {
        if let Some(tcb) = table.get_mut(key) {
            tcb.tcp_phase = if was_close_wait { TcpPhase::LastAck } else { TcpPhase::FinWait1 };
            debug!("tcb: {key:?} queue tail is FIN, -> {:?}", tcb.tcp_phase);
        }
    }
}

/// The segment-receive algorithm (`SPEC_FULL.md` §4.F "Segment receive
/// algorithm"): drop pure duplicates, trim overlap, deliver the remainder to
/// the application bridge, advance `seq_remote`/`ack_remote`, and ACK.
#[allow(clippy::too_many_arguments)]
fn receive_segment(
    table: &mut Table,
    key: TcbKey,
    seq: u32,
    mut payload: Vec<u8>,
    fin: bool,
    _ack: u32,
    now: Tick,
    transmit: &mut dyn Transmit,
) {
    let Some(tcb) = table.get_mut(key) else { return };

    let diff = tcb.seq_remote.wrapping_sub(seq);
    if diff > payload.len() as u32 {
        trace!("tcb: {key:?} pure duplicate segment seq={seq}, ignoring");
        transmit.send_ack(tcb);
        return;
    }
    if diff > 0 {
        let trim = diff as usize;
        payload.drain(..trim.min(payload.len()));
    }

    if payload.is_empty() && !fin {
        transmit.send_ack(tcb);
        return;
    }

    let advance = payload.len() as u32 + u32::from(fin);
    tcb.seq_remote = tcb.seq_remote.wrapping_add(advance);
    tcb.ack_remote = tcb.seq_remote;
    transmit.send_ack(tcb);
    drop(tcb);

    if !payload.is_empty() {
        app::on_recv_payload(table, key, &payload, now, transmit);
    }
}

/// Handed by `crate::app` to queue outbound data from inside a phase
/// notification; kept here (rather than on `Tcb` directly) because sending
/// the head segment immediately is the transmit bridge's job, which
/// `crate::app` otherwise has no reason to depend on.
pub fn queue_and_send(tcb: &mut crate::tcb::Tcb, transmit: &mut dyn Transmit, data: Vec<u8>, ownership: Ownership, is_fin: bool) {
    let payload_for_send = data.clone();
    if let Some(head) = tcb.queue_send(SendData::Copy(data), ownership, is_fin) {
        let slice = &payload_for_send[..head.len as usize];
        transmit.send_segment(tcb, head, slice);
    }
}

/// The safety net (`SPEC_FULL.md` §4.F, `DESIGN.md` Open Question 1): if a
/// TCB is still active after dispatch but has no timer linked, arm one
/// `SAFETY_NET_SECS` out rather than leaving it to leak.
fn ensure_timer(table: &mut Table, key: TcbKey, now: Tick) {
    let needs_arming = table.get(key).is_some_and(|t| t.is_active && t.timer_tick.is_none());
    if needs_arming {
        table.arm_timer(key, now + SAFETY_NET_SECS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rangeaddr::{Ipv4Range, Ipv6Range, PortRange, ReconnectRanges};
    use crate::report::BufferReporter;
    use crate::segment::TransmitHead;
    use std::net::Ipv6Addr;

    struct NullTransmit {
        acks: u32,
        rsts: u32,
        segments: u32,
    }

    impl Transmit for NullTransmit {
        fn send_ack(&mut self, _tcb: &crate::tcb::Tcb) {
            self.acks += 1;
        }
        fn send_rst(&mut self, _tcb: &crate::tcb::Tcb) {
            self.rsts += 1;
        }
        fn send_segment(&mut self, _tcb: &crate::tcb::Tcb, _seg: TransmitHead, _payload: &[u8]) {
            self.segments += 1;
        }
        fn send_syn(&mut self, _tcb: &crate::tcb::Tcb) {}
    }

    fn ranges() -> ReconnectRanges {
        ReconnectRanges {
            ipv4: Ipv4Range::single(Ipv4Addr::new(10, 0, 0, 1)),
            ipv6: Ipv6Range::single(Ipv6Addr::UNSPECIFIED),
            ports: PortRange::single(40000),
        }
    }

    fn new_table() -> Table {
        Table::new(1 << 10, 0xCAFE, 30, 2, ranges(), Box::new(BufferReporter::default()))
    }

    #[test]
    fn rejects_forged_synack_cookie() {
        let accepted = accept_synack(
            Ipv4Addr::new(10, 0, 0, 1),
            40000,
            Ipv4Addr::new(10, 0, 0, 2),
            80,
            0xdead_beef,
            0xCAFE,
        );
        assert!(!accepted);
    }

    #[test]
    fn accepts_matching_synack_cookie() {
        let cookie = syn_cookie(Ipv4Addr::new(10, 0, 0, 1), 40000, Ipv4Addr::new(10, 0, 0, 2), 80, 0xCAFE);
        let accepted = accept_synack(
            Ipv4Addr::new(10, 0, 0, 1),
            40000,
            Ipv4Addr::new(10, 0, 0, 2),
            80,
            cookie.wrapping_add(1),
            0xCAFE,
        );
        assert!(accepted);
    }

    #[test]
    fn rst_destroys_tcb() {
        let mut table = new_table();
        let mut tx = NullTransmit { acks: 0, rsts: 0, segments: 0 };
        let key = table.create(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            40000,
            80,
            1000,
            5000,
            64,
            0,
            0,
        );
        dispatch(&mut table, key, Event::Rst, 0, &mut tx);
        assert!(table.get(key).is_none());
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn connection_deadline_sends_rst_and_destroys() {
        let mut table = new_table();
        let mut tx = NullTransmit { acks: 0, rsts: 0, segments: 0 };
        let key = table.create(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            40000,
            80,
            1000,
            5000,
            64,
            0,
            0,
        );
        dispatch(&mut table, key, Event::Timeout, 31, &mut tx);
        assert_eq!(tx.rsts, 1);
        assert!(table.get(key).is_none());
    }

    #[test]
    fn data_segment_advances_seq_remote_and_acks() {
        let mut table = new_table();
        let mut tx = NullTransmit { acks: 0, rsts: 0, segments: 0 };
        let key = table.create(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            40000,
            80,
            1000,
            5000,
            64,
            0,
            0,
        );
        if let Some(tcb) = table.get_mut(key) {
            tcb.tcp_phase = TcpPhase::EstablishedRecv;
        }
        dispatch(
            &mut table,
            key,
            Event::Data { seq: 5000, ack: 1000, payload: b"hi".to_vec() },
            1,
            &mut tx,
        );
        assert_eq!(table.get(key).unwrap().seq_remote, 5002);
        assert_eq!(tx.acks, 1);
    }

    #[test]
    fn duplicate_segment_is_ignored() {
        let mut table = new_table();
        let mut tx = NullTransmit { acks: 0, rsts: 0, segments: 0 };
        let key = table.create(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            40000,
            80,
            1000,
            5000,
            64,
            0,
            0,
        );
        if let Some(tcb) = table.get_mut(key) {
            tcb.tcp_phase = TcpPhase::EstablishedRecv;
            tcb.seq_remote = 5010;
        }
        dispatch(
            &mut table,
            key,
            Event::Data { seq: 5000, ack: 1000, payload: b"hi".to_vec() },
            1,
            &mut tx,
        );
        assert_eq!(table.get(key).unwrap().seq_remote, 5010);
        assert_eq!(tx.acks, 1);
    }

    #[test]
    fn safety_net_arms_timer_after_dispatch() {
        let mut table = new_table();
        let mut tx = NullTransmit { acks: 0, rsts: 0, segments: 0 };
        let key = table.create(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            40000,
            80,
            1000,
            5000,
            64,
            0,
            0,
        );
        dispatch(
            &mut table,
            key,
            Event::Data { seq: 5000, ack: 1000, payload: b"hi".to_vec() },
            1,
            &mut tx,
        );
        assert!(table.get(key).unwrap().timer_tick.is_some());
    }
}
