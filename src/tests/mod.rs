//! Scenario-level tests exercising the full RX decode -> state machine ->
//! application bridge -> transmit bridge chain together, rather than one
//! module in isolation (`SPEC_FULL.md` §8 "concrete scenarios"). Each file
//! covers one scenario; shared test scaffolding lives here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::cookie::syn_cookie;
use crate::rangeaddr::{Ipv4Range, Ipv6Range, PortRange, ReconnectRanges};
use crate::report::BufferReporter;
use crate::segment::TransmitHead;
use crate::table::Table;
use crate::tcb::Tcb;
use crate::xmit::Transmit;

mod deadline;
mod handshake;
mod state_machine;

pub(crate) const LOCAL: fn() -> Ipv4Addr = || Ipv4Addr::new(10, 0, 0, 1);
pub(crate) const REMOTE: fn() -> Ipv4Addr = || Ipv4Addr::new(10, 0, 0, 2);
pub(crate) const LOCAL_PORT: u16 = 40000;
pub(crate) const REMOTE_PORT: u16 = 80;
pub(crate) const ENTROPY: u64 = 0xCAFE_BABE;

pub(crate) fn ranges() -> ReconnectRanges {
    ReconnectRanges {
        ipv4: Ipv4Range { first: LOCAL(), last: Ipv4Addr::new(10, 0, 0, 3) },
        ipv6: Ipv6Range::single(Ipv6Addr::UNSPECIFIED),
        ports: PortRange { first: LOCAL_PORT, last: LOCAL_PORT + 2 },
    }
}

pub(crate) fn new_table() -> Table {
    Table::new(1 << 10, ENTROPY, 30, 2, ranges(), Box::new(BufferReporter::default()))
}

/// What each `Transmit` call actually sent, so scenario tests can assert on
/// wire-visible behavior (identical retransmitted `seq`, a sent `RST`, etc.)
/// rather than only on internal TCB state.
#[derive(Debug, Clone)]
pub(crate) enum Sent {
    Ack { seq: u32, ack: u32 },
    Rst { seq: u32 },
    Segment { seq: u32, fin: bool, payload: Vec<u8> },
    Syn { seq: u32 },
}

#[derive(Default)]
pub(crate) struct RecordingTransmit {
    pub sent: Vec<Sent>,
}

impl Transmit for RecordingTransmit {
    fn send_ack(&mut self, tcb: &Tcb) {
        self.sent.push(Sent::Ack { seq: tcb.seq_local, ack: tcb.ack_remote });
    }

    fn send_rst(&mut self, tcb: &Tcb) {
        self.sent.push(Sent::Rst { seq: tcb.seq_local });
    }

    fn send_segment(&mut self, _tcb: &Tcb, seg: TransmitHead, payload: &[u8]) {
        self.sent.push(Sent::Segment { seq: seg.seq, fin: seg.fin, payload: payload.to_vec() });
    }

    fn send_syn(&mut self, tcb: &Tcb) {
        self.sent.push(Sent::Syn { seq: tcb.seq_local_first });
    }
}

pub(crate) fn local_ip() -> IpAddr {
    IpAddr::V4(LOCAL())
}

pub(crate) fn remote_ip() -> IpAddr {
    IpAddr::V4(REMOTE())
}

pub(crate) fn handshake_cookie() -> u32 {
    syn_cookie(LOCAL(), LOCAL_PORT, REMOTE(), REMOTE_PORT, ENTROPY)
}
