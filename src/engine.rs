//! The top-level orchestrator (`SPEC_FULL.md` §2 control flow, §5 threading
//! model): wires the connection table, timer wheel, ARP helper, packet
//! template, and TX rings into a running RX/TX thread pair.
//!
//! Grounded on the poll-loop shape of the teacher's `iface::Interface`
//! (`check!`-style "log and drop" decode, dispatch to the state machine,
//! drain expired timers once per pass) collapsed to this engine's much
//! narrower job: there is no socket set to poll, only one TCP event
//! alphabet to decode into.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use crate::adapter::{Adapter, TxRings};
use crate::arp;
use crate::config::Config;
use crate::cookie::syn_cookie;
use crate::error::Result;
use crate::parser::{self, ParserStream};
use crate::rangeaddr::ReconnectRanges;
use crate::report::Reporter;
use crate::state::{self, Event, SegmentKind};
use crate::table::Table;
use crate::template::{EthernetTemplate, PacketFields, PacketTemplate};
use crate::timer::Tick;
use crate::wire::tcp::{Flags, Repr as TcpRepr};
use crate::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet, TcpPacket};
use crate::xmit::FrameTransmit;

/// How long `recv_frame` blocks per RX pass before falling through to the
/// timer sweep (`SPEC_FULL.md` §5 "the hot path is non-blocking").
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const RX_BUFFER_LEN: usize = 2048;
const TX_RING_CAPACITY: usize = 4096;
const TX_BUFFER_LEN: usize = 2048;

/// Owns everything the RX thread touches (`SPEC_FULL.md` §5: table, timer
/// wheel, segment queues, and banners live here with no locking). The TX
/// side is just the `TxRings` handle, cloned into the spawned TX thread.
pub struct Engine {
    table: Table,
    rings: TxRings,
    template: EthernetTemplate,
    warned_once: AtomicBool,
    my_mac: EthernetAddress,
    my_ip: Ipv4Addr,
    start: Instant,
    small_window: bool,
}

impl Engine {
    /// Resolve the gateway MAC synchronously (`crate::arp::resolve_sync`,
    /// the one blocking step startup is allowed, `SPEC_FULL.md` §5) and
    /// build the connection table and packet template around it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: &mut dyn Adapter,
        my_mac: EthernetAddress,
        my_ip: Ipv4Addr,
        gateway_ip: Ipv4Addr,
        config: Config,
        reconnect: ReconnectRanges,
        reporter: Box<dyn Reporter>,
        parsers: Vec<Box<dyn ParserStream>>,
    ) -> Result<Engine> {
        let gateway_mac = arp::resolve_sync(adapter, my_ip, my_mac, gateway_ip)?;
        debug!("engine: gateway {gateway_ip} resolved to {gateway_mac}");

        let mut table = Table::new(
            config.capacity,
            config.entropy,
            config.conn_timeout.as_secs(),
            config.hello_timeout.as_secs(),
            reconnect,
            reporter,
        );
        // `hello=ssl|http|smbv1` and the `heartbleed`/`ticketbleed`/`poodle`
        // probes (`SPEC_FULL.md` §4.I, §6) force a single stream onto every
        // port, overriding whatever per-port streams the caller registered.
        table.parsers = match parser::forced_parser(&config) {
            Some(forced) => vec![forced],
            None => parsers,
        };
        table.hello_overrides = config.hello_strings.clone();
        table.small_window_default = config.small_window;

        let template = EthernetTemplate {
            src_mac: my_mac,
            dst_mac: gateway_mac,
            src_ip: my_ip,
            ttl: 64,
        };

        Ok(Engine {
            table,
            rings: TxRings::new(TX_RING_CAPACITY, TX_BUFFER_LEN),
            template,
            warned_once: AtomicBool::new(false),
            my_mac,
            my_ip,
            start: Instant::now(),
            small_window: config.small_window,
        })
    }

    fn now_tick(&self) -> Tick {
        self.start.elapsed().as_secs()
    }

    fn emit(&self, fields: &PacketFields, payload: &[u8]) {
        let mut frame = self.rings.acquire_free(&self.warned_once);
        let needed = self.template.header_len() + payload.len();
        if frame.data.len() < needed {
            frame.data.resize(needed, 0);
        }
        let written = self.template.create_packet(fields, payload, &mut frame.data);
        frame.len = written;
        self.rings.enqueue_tx(frame);
    }

    /// Send a stand-alone SYN whose initial sequence number is the stateless
    /// cookie for this 4-tuple (`SPEC_FULL.md` §3 "Lifecycle": no TCB exists
    /// until a matching SYN/ACK arrives — scenario 1/2).
    pub fn scan(&mut self, ip_remote: Ipv4Addr, port_local: u16, port_remote: u16, ttl: u8) {
        let cookie = syn_cookie(self.my_ip, port_local, ip_remote, port_remote, self.table.entropy);
        let fields = PacketFields {
            src_port: port_local,
            dst_ip: ip_remote,
            dst_port: port_remote,
            seq: cookie,
            ack: 0,
            flags: Flags::SYN,
            window: if self.small_window { 16 } else { 65535 },
        };
        let _ = ttl; // the template's TTL is fixed for the scan's lifetime (`SPEC_FULL.md` §4.I)
        self.emit(&fields, &[]);
        debug!("engine: scan SYN {}:{port_local} -> {ip_remote}:{port_remote} cookie={cookie:#010x}", self.my_ip);
    }

    /// Run to completion: spawn the TX thread, then drive the RX loop on the
    /// calling thread (`SPEC_FULL.md` §5). `rx_adapter`/`tx_adapter` are the
    /// two handles the caller already split from one opened device — see
    /// `crate::adapter::Adapter`'s doc comment.
    pub fn run(mut self, mut rx_adapter: Box<dyn Adapter>, mut tx_adapter: Box<dyn Adapter>) {
        let tx_rings = self.rings.clone();
        let tx_handle = thread::spawn(move || tx_loop(tx_adapter.as_mut(), tx_rings));

        let mut buf = vec![0u8; RX_BUFFER_LEN];
        loop {
            match rx_adapter.recv_frame(&mut buf, POLL_TIMEOUT) {
                Ok(Some(len)) => self.process_frame(&buf[..len]),
                Ok(None) => {}
                Err(err) => {
                    error!("engine: rx adapter error: {err}");
                    break;
                }
            }
            self.drain_timers();
        }

        let now_secs = self.now_tick();
        self.table.destroy_all(now_secs);
        drop(self.rings);
        let _ = tx_handle.join();
    }

    fn drain_timers(&mut self) {
        let now = self.now_tick();
        loop {
            let Some(key) = self.table.remove_expired_timer(now) else { break };
            let mut transmit = FrameTransmit {
                template: &self.template,
                rings: &self.rings,
                warned_once: &self.warned_once,
            };
            state::dispatch(&mut self.table, key, Event::Timeout, now, &mut transmit);
        }
    }

    fn process_frame(&mut self, frame: &[u8]) {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            trace!("engine: truncated ethernet frame");
            return;
        };
        match eth.ethertype() {
            EthernetProtocol::Arp => arp::respond(self.my_ip, self.my_mac, frame, &self.rings),
            EthernetProtocol::Ipv4 => self.process_ipv4(eth.payload()),
            other => trace!("engine: ignoring ethertype {other}"),
        }
    }

    fn process_ipv4(&mut self, data: &[u8]) {
        let Ok(ip) = Ipv4Packet::new_checked(data) else {
            trace!("engine: malformed ipv4 packet");
            return;
        };
        if ip.protocol() != IpProtocol::Tcp {
            return;
        }
        if !ip.verify_checksum() {
            trace!("engine: ipv4 checksum mismatch");
            return;
        }

        let ip_remote = ip.src_addr();
        let ip_local = ip.dst_addr();
        let ttl = ip.ttl();

        let Ok(tcp_packet) = TcpPacket::new_checked(ip.payload()) else {
            trace!("engine: malformed tcp segment");
            return;
        };
        let Ok(repr) = TcpRepr::parse(&tcp_packet, &ip_remote, &ip_local) else {
            trace!("engine: tcp parse/checksum reject");
            return;
        };
        let payload = tcp_packet.payload().to_vec();

        self.handle_tcp(ip_local, ip_remote, repr, ttl, payload);
    }

    /// Decode-to-event (`SPEC_FULL.md` §2 "synthesizes a TCP event, feeds
    /// (F)"): recognizes `RST` and `SYN|ACK` ahead of the general
    /// classification, since both can apply to a TCB that does not exist
    /// yet (stateless `SYN|ACK` acceptance) or short-circuit state entirely
    /// (`RST`).
    fn handle_tcp(&mut self, ip_local: Ipv4Addr, ip_remote: Ipv4Addr, repr: TcpRepr, ttl: u8, payload: Vec<u8>) {
        let now = self.now_tick();
        let port_local = repr.dst_port;
        let port_remote = repr.src_port;

        if repr.flags.contains(Flags::RST) {
            if let Some(key) = self
                .table
                .lookup(IpAddr::V4(ip_local), IpAddr::V4(ip_remote), port_local, port_remote)
            {
                let mut transmit = FrameTransmit {
                    template: &self.template,
                    rings: &self.rings,
                    warned_once: &self.warned_once,
                };
                state::dispatch(&mut self.table, key, Event::Rst, now, &mut transmit);
            }
            return;
        }

        let existing = self
            .table
            .lookup(IpAddr::V4(ip_local), IpAddr::V4(ip_remote), port_local, port_remote);

        if repr.flags.contains(Flags::SYN) && repr.flags.contains(Flags::ACK) {
            let mut transmit = FrameTransmit {
                template: &self.template,
                rings: &self.rings,
                warned_once: &self.warned_once,
            };
            if let Some(key) = existing {
                state::dispatch(
                    &mut self.table,
                    key,
                    Event::SynAck { seq_remote_first: repr.seq_number, ack: repr.ack_number },
                    now,
                    &mut transmit,
                );
            } else if state::accept_synack(ip_local, port_local, ip_remote, port_remote, repr.ack_number, self.table.entropy)
            {
                let cookie = repr.ack_number.wrapping_sub(1);
                state::create_from_synack(
                    &mut self.table,
                    ip_local,
                    ip_remote,
                    port_local,
                    port_remote,
                    cookie,
                    repr.seq_number,
                    ttl,
                    0,
                    now,
                    &mut transmit,
                );
            } else {
                trace!("engine: rejected SYN/ACK with mismatched cookie from {ip_remote}:{port_remote}");
            }
            return;
        }

        let Some(key) = existing else {
            trace!("engine: no TCB for {ip_remote}:{port_remote}, ignoring segment");
            return;
        };

        let event = match state::classify_segment(repr.flags, payload.len()) {
            SegmentKind::Ack => Event::Ack { ack: repr.ack_number },
            SegmentKind::Data => Event::Data { seq: repr.seq_number, ack: repr.ack_number, payload },
            SegmentKind::Fin => Event::Fin { seq: repr.seq_number, ack: repr.ack_number },
        };
        let mut transmit = FrameTransmit {
            template: &self.template,
            rings: &self.rings,
            warned_once: &self.warned_once,
        };
        state::dispatch(&mut self.table, key, event, now, &mut transmit);
    }
}

/// The TX thread's body (`SPEC_FULL.md` §4.H, §5): drain the TX ring, hand
/// each frame to the adapter, and return the buffer to the free ring.
/// Exits once the RX side has dropped its `TxRings` handle and the ring has
/// nothing left to drain (`Engine::run`'s shutdown path).
fn tx_loop(adapter: &mut dyn Adapter, rings: TxRings) {
    loop {
        match rings.tx_ring.pop() {
            Some(frame) => {
                if let Err(err) = adapter.send_frame(frame.as_slice(), rings.tx_ring.is_empty()) {
                    log::warn!("engine: tx adapter error: {err}");
                }
                rings.release_free(frame);
            }
            None => {
                if Arc::strong_count(&rings.free_ring) <= 1 {
                    return;
                }
                thread::sleep(Duration::from_micros(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::RawBannerParser;
    use crate::rangeaddr::{Ipv4Range, Ipv6Range, PortRange};
    use crate::report::BufferReporter;
    use crate::wire::arp::ETHERNET_IPV4_MIN_FRAME_LEN;
    use crate::wire::{ArpOperation, ArpPacket, ArpRepr, ETHERNET_HEADER_LEN};
    use std::io;
    use std::net::Ipv6Addr;

    struct ScriptedAdapter {
        replies: Vec<Vec<u8>>,
    }

    impl Adapter for ScriptedAdapter {
        fn send_frame(&mut self, _buf: &[u8], _flush: bool) -> io::Result<()> {
            Ok(())
        }

        fn recv_frame(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<Option<usize>> {
            if let Some(reply) = self.replies.pop() {
                buf[..reply.len()].copy_from_slice(&reply);
                Ok(Some(reply.len()))
            } else {
                Ok(None)
            }
        }
    }

    fn ranges() -> ReconnectRanges {
        ReconnectRanges {
            ipv4: Ipv4Range::single(Ipv4Addr::new(10, 0, 0, 1)),
            ipv6: Ipv6Range::single(Ipv6Addr::UNSPECIFIED),
            ports: PortRange { first: 40000, last: 40001 },
        }
    }

    fn build_arp_reply(my_ip: Ipv4Addr, my_mac: EthernetAddress, gw_ip: Ipv4Addr, gw_mac: EthernetAddress) -> Vec<u8> {
        let mut buf = vec![0u8; ETHERNET_IPV4_MIN_FRAME_LEN];
        {
            let mut eth = EthernetFrame::new_unchecked(&mut buf[..ETHERNET_HEADER_LEN]);
            eth.set_dst_addr(my_mac);
            eth.set_src_addr(gw_mac);
            eth.set_ethertype(EthernetProtocol::Arp);
        }
        let repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: gw_mac,
            source_protocol_addr: gw_ip,
            target_hardware_addr: my_mac,
            target_protocol_addr: my_ip,
        };
        let mut arp_packet = ArpPacket::new_unchecked(&mut buf[ETHERNET_HEADER_LEN..ETHERNET_HEADER_LEN + repr.buffer_len()]);
        repr.emit(&mut arp_packet);
        buf
    }

    fn new_engine() -> Engine {
        let my_mac = EthernetAddress::new([0, 1, 2, 3, 4, 5]);
        let my_ip = Ipv4Addr::new(10, 0, 0, 1);
        let gw_ip = Ipv4Addr::new(10, 0, 0, 254);
        let gw_mac = EthernetAddress::new([6, 7, 8, 9, 10, 11]);
        let mut adapter = ScriptedAdapter {
            replies: vec![build_arp_reply(my_ip, my_mac, gw_ip, gw_mac)],
        };
        let config = Config::new(0xCAFE, 1 << 10).unwrap();
        Engine::new(
            &mut adapter,
            my_mac,
            my_ip,
            gw_ip,
            config,
            ranges(),
            Box::new(BufferReporter::default()),
            vec![Box::new(RawBannerParser::new(256))],
        )
        .unwrap()
    }

    #[test]
    fn scan_enqueues_syn_with_cookie_as_isn() {
        let mut engine = new_engine();
        let remote = Ipv4Addr::new(10, 0, 0, 2);
        engine.scan(remote, 40000, 80, 64);

        let frame = engine.rings.tx_ring.pop().expect("syn frame enqueued");
        let eth = EthernetFrame::new_checked(frame.as_slice()).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        let tcp_pkt = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp_pkt.flags().contains(Flags::SYN));

        let cookie = syn_cookie(engine.my_ip, 40000, remote, 80, engine.table.entropy);
        assert_eq!(tcp_pkt.seq_number(), cookie);
    }

    #[test]
    fn matching_synack_creates_tcb() {
        let mut engine = new_engine();
        let remote = Ipv4Addr::new(10, 0, 0, 2);
        let cookie = syn_cookie(engine.my_ip, 40000, remote, 80, engine.table.entropy);
        let repr = TcpRepr {
            src_port: 80,
            dst_port: 40000,
            seq_number: 42,
            ack_number: cookie.wrapping_add(1),
            flags: Flags::SYN | Flags::ACK,
            window_len: 1024,
        };
        engine.handle_tcp(engine.my_ip, remote, repr, 64, Vec::new());
        assert_eq!(engine.table.active_count(), 1);
    }

    #[test]
    fn mismatched_cookie_creates_no_tcb() {
        let mut engine = new_engine();
        let remote = Ipv4Addr::new(10, 0, 0, 2);
        let repr = TcpRepr {
            src_port: 80,
            dst_port: 40000,
            seq_number: 42,
            ack_number: 0xdead_beef,
            flags: Flags::SYN | Flags::ACK,
            window_len: 1024,
        };
        engine.handle_tcp(engine.my_ip, remote, repr, 64, Vec::new());
        assert_eq!(engine.table.active_count(), 0);
    }

    #[test]
    fn rst_destroys_existing_tcb() {
        let mut engine = new_engine();
        let remote = Ipv4Addr::new(10, 0, 0, 2);
        let cookie = syn_cookie(engine.my_ip, 40000, remote, 80, engine.table.entropy);
        let synack = TcpRepr {
            src_port: 80,
            dst_port: 40000,
            seq_number: 42,
            ack_number: cookie.wrapping_add(1),
            flags: Flags::SYN | Flags::ACK,
            window_len: 1024,
        };
        engine.handle_tcp(engine.my_ip, remote, synack, 64, Vec::new());
        assert_eq!(engine.table.active_count(), 1);

        let rst = TcpRepr {
            src_port: 80,
            dst_port: 40000,
            seq_number: 43,
            ack_number: 0,
            flags: Flags::RST,
            window_len: 0,
        };
        engine.handle_tcp(engine.my_ip, remote, rst, 64, Vec::new());
        assert_eq!(engine.table.active_count(), 0);
    }

    #[test]
    fn arp_request_for_our_ip_gets_queued_reply() {
        let mut engine = new_engine();
        let asker_mac = EthernetAddress::new([9, 9, 9, 9, 9, 9]);
        let asker_ip = Ipv4Addr::new(10, 0, 0, 3);

        let mut buf = vec![0u8; ETHERNET_IPV4_MIN_FRAME_LEN];
        {
            let mut eth = EthernetFrame::new_unchecked(&mut buf[..ETHERNET_HEADER_LEN]);
            eth.set_dst_addr(EthernetAddress::BROADCAST);
            eth.set_src_addr(asker_mac);
            eth.set_ethertype(EthernetProtocol::Arp);
        }
        let request = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: asker_mac,
            source_protocol_addr: asker_ip,
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: engine.my_ip,
        };
        let mut arp_packet = ArpPacket::new_unchecked(&mut buf[ETHERNET_HEADER_LEN..ETHERNET_HEADER_LEN + request.buffer_len()]);
        request.emit(&mut arp_packet);

        engine.process_frame(&buf);
        assert!(engine.rings.tx_ring.pop().is_some());
    }
}
