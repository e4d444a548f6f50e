use std::net::IpAddr;
use std::time::Duration;

use crate::segment::{AckOutcome, Ownership, SegmentQueue, SendData, TransmitHead};
use crate::timer::Tick;

/// A generational handle into `crate::table::Table`'s TCB arena.
///
/// Using a generational index instead of a raw pointer is what lets the
/// timer wheel (`crate::timer`) and the TCB refer to each other without
/// forming an ownership cycle (`SPEC_FULL.md` §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcbKey {
    index: u32,
    generation: u32,
}

impl TcbKey {
    pub const fn new(index: u32, generation: u32) -> TcbKey {
        TcbKey { index, generation }
    }

    pub const fn index(&self) -> usize {
        self.index as usize
    }

    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

/// The reduced TCP state set (`SPEC_FULL.md` §4.F).
///
/// `Listen`, `SynReceived`, and `Closed` are intentionally absent: this
/// engine never accepts an inbound connection, so those states from RFC 793
/// have no role here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpPhase {
    SynSent,
    EstablishedSend,
    EstablishedRecv,
    CloseWait,
    /// Reachable only via `CloseWait -> LastAck` when the application bridge
    /// queues its own `FIN`; the shipped application bridge never does this
    /// (see `DESIGN.md` Open Question 2), so this state is exercised only by
    /// `src/tests/state_machine.rs`, mirroring the original engine.
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

/// Application-level phase layered over the TCP phase (`SPEC_FULL.md` §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    Connect,
    ReceiveHello,
    ReceiveNext,
    SendNext,
}

/// Per-connection control block (`SPEC_FULL.md` §3).
#[derive(Debug)]
pub struct Tcb {
    pub ip_local: IpAddr,
    pub ip_remote: IpAddr,
    pub port_local: u16,
    pub port_remote: u16,

    pub seq_local: u32,
    pub seq_local_first: u32,
    pub seq_remote: u32,
    pub seq_remote_first: u32,
    pub ack_remote: u32,

    pub mss: usize,
    pub ttl: u8,
    pub small_window: bool,

    pub is_active: bool,
    pub tcp_phase: TcpPhase,
    pub app_phase: AppPhase,
    pub syn_retries: u32,
    pub is_ipv6: bool,

    pub segments: SegmentQueue,
    pub banner: Vec<u8>,

    /// Index of the parser stream assigned at creation (`crate::parser`).
    pub stream: usize,
    /// Parser-private scratch state, opaque to the engine.
    pub parser_state: u32,

    /// Tick this TCB's single live timer is armed for, or `None` if
    /// currently unlinked. The timer wheel validates its popped hints
    /// against this field (`crate::timer`).
    pub timer_tick: Option<Tick>,
    pub created_tick: Tick,
}

impl Tcb {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ip_local: IpAddr,
        ip_remote: IpAddr,
        port_local: u16,
        port_remote: u16,
        seq_local: u32,
        seq_remote: u32,
        ttl: u8,
        small_window: bool,
        stream: usize,
        now: Tick,
    ) -> Tcb {
        let is_ipv6 = ip_remote.is_ipv6();
        Tcb {
            ip_local,
            ip_remote,
            port_local,
            port_remote,
            seq_local,
            seq_local_first: seq_local,
            seq_remote,
            seq_remote_first: seq_remote,
            ack_remote: seq_remote,
            mss: crate::wire::tcp::DEFAULT_MSS,
            ttl,
            small_window,
            is_active: true,
            tcp_phase: TcpPhase::SynSent,
            app_phase: AppPhase::Connect,
            syn_retries: 0,
            is_ipv6,
            segments: SegmentQueue::new(),
            banner: Vec::new(),
            stream,
            parser_state: 0,
            timer_tick: None,
            created_tick: now,
        }
    }

    /// Matches the 4-tuple identity of this TCB (`SPEC_FULL.md` §3 invariant 1).
    pub fn matches(&self, ip_local: IpAddr, ip_remote: IpAddr, port_local: u16, port_remote: u16) -> bool {
        self.ip_local == ip_local
            && self.ip_remote == ip_remote
            && self.port_local == port_local
            && self.port_remote == port_remote
    }

    pub fn connection_age(&self, now: Tick) -> Duration {
        Duration::from_secs(now.saturating_sub(self.created_tick))
    }

    pub fn reset(&mut self) {
        self.is_active = false;
        self.timer_tick = None;
        self.segments.clear();
        self.banner.clear();
    }

    /// Queue `data` for transmission (`crate::segment::SegmentQueue::send`).
    ///
    /// `SegmentQueue::send` takes `&mut Tcb` so it can advance `tcp_phase`
    /// and read `mss`, which means it can't be called as `self.segments.send(self, ..)`
    /// directly — this helper temporarily takes ownership of `self.segments`
    /// out of `self` to break the aliasing, the same trick the timer wheel
    /// sidesteps with generational keys instead of raw self-references.
    pub fn queue_send(&mut self, data: SendData, ownership: Ownership, is_fin: bool) -> Option<TransmitHead> {
        let mut segments = std::mem::take(&mut self.segments);
        let result = segments.send(self, data, ownership, is_fin);
        self.segments = segments;
        result
    }

    /// Retire segments covered by `ack` (`crate::segment::SegmentQueue::acknowledge`).
    pub fn queue_acknowledge(&mut self, ack: u32) -> AckOutcome {
        let mut segments = std::mem::take(&mut self.segments);
        let result = segments.acknowledge(self, ack);
        self.segments = segments;
        result
    }
}
