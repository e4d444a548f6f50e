use log::debug;

use crate::parser::{NetApi, ParseOutcome};
use crate::segment::Ownership;
use crate::state;
use crate::table::Table;
use crate::tcb::{AppPhase, Tcb, TcbKey, TcpPhase};
use crate::timer::Tick;
use crate::xmit::Transmit;

/// How long to wait, after `CONNECTED`, for the peer to speak first before
/// the engine tries its own hello (`SPEC_FULL.md` §4.G `RECV_TIMEOUT`).
pub const DEFAULT_HELLO_TIMEOUT_SECS: u64 = 2;
/// Re-arm interval after `SEND_SENT` settles the TCB back into receiving
/// (`SPEC_FULL.md` §4.G `SEND_SENT`).
pub const SEND_SENT_REARM_SECS: u64 = 10;

/// Glues a parser's `NetApi::send` calls back into the real segment queue
/// and transmit bridge for one TCB (`SPEC_FULL.md` §6 "Interfaces exposed").
struct EngineNetApi<'a> {
    transmit: &'a mut dyn Transmit,
}

impl<'a> NetApi for EngineNetApi<'a> {
    fn send(&mut self, tcb: &mut Tcb, buf: &[u8], is_fin: bool) {
        state::queue_and_send(tcb, self.transmit, buf.to_vec(), Ownership::Copied, is_fin);
    }
}

/// `CONNECTED` (`SPEC_FULL.md` §4.G): arm the hello timeout and, if the
/// assigned parser stream is chained (more than one stream registered past
/// this one for the port), kick off a reconnect to cover the alternate
/// stream (scenario 6).
pub fn on_connected(table: &mut Table, key: TcbKey, now: Tick, transmit: &mut dyn Transmit) {
    let hello_timeout = table.hello_timeout_secs;
    if let Some(tcb) = table.get_mut(key) {
        tcb.app_phase = AppPhase::ReceiveHello;
    }
    table.arm_timer(key, now + hello_timeout.max(1));

    let is_chained = table.get(key).is_some_and(|t| t.stream + 1 < table.parsers.len());
    if is_chained {
        reconnect(table, key, now, transmit);
    }
}

/// `RECV_TIMEOUT` while `ReceiveHello` (`SPEC_FULL.md` §4.G): give the
/// parser stream's own `transmit_hello` callback first refusal, then fall
/// back to its static `hello` buffer, if any.
pub fn on_recv_timeout(table: &mut Table, key: TcbKey, now: Tick, transmit: &mut dyn Transmit) {
    let in_receive_hello = table.get(key).is_some_and(|t| t.app_phase == AppPhase::ReceiveHello);
    if !in_receive_hello {
        return;
    }

    let port = table.get(key).map(|t| t.port_remote);
    if let Some(hello) = port.and_then(|p| table_hello_override(table, p)) {
        if let Some(tcb) = table.get_mut(key) {
            state::queue_and_send(tcb, transmit, hello, Ownership::Copied, false);
        }
        return;
    }

    let Some((tcb, parser)) = table.tcb_and_parser(key) else { return };
    let mut net = EngineNetApi { transmit: &mut *transmit };
    if parser.transmit_hello(&mut *tcb, &mut net) {
        return;
    }
    if let Some(hello) = parser.hello() {
        let hello = hello.to_vec();
        state::queue_and_send(tcb, transmit, hello, Ownership::Static, true);
        debug!("tcb: {key:?} sent static hello at {now}");
    }
}

/// Per-port `hello-string` override (`SPEC_FULL.md` §6 `hello-string[<port>]`),
/// resolved once from `crate::config::Config::hello_strings` into
/// `table.hello_overrides` at `Engine::new` time.
fn table_hello_override(table: &Table, port: u16) -> Option<Vec<u8>> {
    table.hello_overrides.get(&port).cloned()
}

/// `RECV_PAYLOAD` (`SPEC_FULL.md` §4.G): hand the buffer to the assigned
/// parser — which appends recognized fields to `tcb.banner` itself — and
/// advance to `ReceiveNext`. A parser signaling `done` is noted for now;
/// closing the connection outright is left to the connection-wide deadline
/// (`DESIGN.md` Open Question 2), same as the shipped app phases never
/// driving `LAST_ACK`.
pub fn on_recv_payload(table: &mut Table, key: TcbKey, payload: &[u8], _now: Tick, _transmit: &mut dyn Transmit) {
    let Some((tcb, parser)) = table.tcb_and_parser_mut(key) else { return };
    let outcome: ParseOutcome = parser.parse(tcb, payload);
    if outcome.done {
        debug!("tcb: {key:?} parser signaled done");
    }
    tcb.app_phase = AppPhase::ReceiveNext;
}

/// `SEND_SENT` (`SPEC_FULL.md` §4.G): the outbound queue drained, fall back
/// to `ESTABLISHED_RECV` and re-arm a long timeout.
pub fn on_send_sent(table: &mut Table, key: TcbKey, now: Tick) {
    if let Some(tcb) = table.get_mut(key) {
        tcb.tcp_phase = TcpPhase::EstablishedRecv;
        tcb.app_phase = AppPhase::ReceiveNext;
    }
    table.arm_timer(key, now + SEND_SENT_REARM_SECS);
}

/// Reconnect to the same remote port with the next source IP/port and the
/// next parser stream (`SPEC_FULL.md` §4.G "Reconnect", scenario 6).
fn reconnect(table: &mut Table, key: TcbKey, now: Tick, transmit: &mut dyn Transmit) {
    let Some((ip_remote, port_remote, ttl, next_stream)) =
        table.get(key).map(|t| (t.ip_remote, t.port_remote, t.ttl, t.stream + 1))
    else {
        return;
    };

    let entropy = table.entropy;
    let (next_ip, next_port) = match ip_remote {
        std::net::IpAddr::V4(_) => {
            let (ip, port) = table
                .reconnect
                .advance_v4(table.reconnect.ipv4.first, table.reconnect.ports.first);
            (std::net::IpAddr::V4(ip), port)
        }
        std::net::IpAddr::V6(_) => {
            let (ip, port) = table
                .reconnect
                .advance_v6(table.reconnect.ipv6.first, table.reconnect.ports.first);
            (std::net::IpAddr::V6(ip), port)
        }
    };

    let cookie = match (next_ip, ip_remote) {
        (std::net::IpAddr::V4(local), std::net::IpAddr::V4(remote)) => {
            crate::cookie::syn_cookie(local, next_port, remote, port_remote, entropy)
        }
        _ => {
            debug!("tcb: {key:?} reconnect skipped, no IPv6 cookie support");
            return;
        }
    };

    let new_key = table.create(
        next_ip,
        ip_remote,
        next_port,
        port_remote,
        cookie,
        0,
        ttl,
        next_stream,
        now,
    );
    debug!("tcb: {key:?} reconnect -> {new_key:?} stream={next_stream}");
    if let Some(tcb) = table.get(new_key) {
        transmit.send_syn(tcb);
    }
    table.arm_timer(new_key, now + state::SYN_RETRY_BASE_SECS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::RawBannerParser;
    use crate::rangeaddr::{Ipv4Range, Ipv6Range, PortRange, ReconnectRanges};
    use crate::report::BufferReporter;
    use crate::segment::TransmitHead;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    struct NullTransmit;
    impl Transmit for NullTransmit {
        fn send_ack(&mut self, _tcb: &Tcb) {}
        fn send_rst(&mut self, _tcb: &Tcb) {}
        fn send_segment(&mut self, _tcb: &Tcb, _seg: TransmitHead, _payload: &[u8]) {}
        fn send_syn(&mut self, _tcb: &Tcb) {}
    }

    fn ranges() -> ReconnectRanges {
        ReconnectRanges {
            ipv4: Ipv4Range {
                first: Ipv4Addr::new(10, 0, 0, 1),
                last: Ipv4Addr::new(10, 0, 0, 1),
            },
            ipv6: Ipv6Range::single(Ipv6Addr::UNSPECIFIED),
            ports: PortRange::single(40000),
        }
    }

    fn new_table() -> Table {
        let mut t = Table::new(1 << 10, 0xCAFE, 30, 2, ranges(), Box::new(BufferReporter::default()));
        t.parsers.push(Box::new(RawBannerParser::default()));
        t.parsers.push(Box::new(RawBannerParser::default()));
        t
    }

    #[test]
    fn connected_arms_hello_timeout() {
        let mut table = new_table();
        let mut tx = NullTransmit;
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
        on_connected(&mut table, key, 0, &mut tx);
        assert!(table.get(key).unwrap().timer_tick.is_some());
        assert_eq!(table.get(key).unwrap().app_phase, AppPhase::ReceiveHello);
    }

    #[test]
    fn chained_stream_triggers_reconnect() {
        let mut table = new_table();
        let mut tx = NullTransmit;
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
        assert_eq!(table.active_count(), 1);
        on_connected(&mut table, key, 0, &mut tx);
        assert_eq!(table.active_count(), 2);
    }

    #[test]
    fn recv_payload_appends_banner_and_advances_phase() {
        let mut table = new_table();
        let mut tx = NullTransmit;
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
        on_recv_payload(&mut table, key, b"hello", 0, &mut tx);
        assert_eq!(table.get(key).unwrap().banner, b"hello");
        assert_eq!(table.get(key).unwrap().app_phase, AppPhase::ReceiveNext);
    }
}
