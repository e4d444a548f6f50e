//! Synchronous gateway resolution and asynchronous ARP reply (`SPEC_FULL.md`
//! §4.A), grounded on `rawsock-arp.c`'s `arp_resolve_sync`/`arp_response` and
//! the teacher's `net/arp.rs` for the async reply/queue shape.
//!
//! Every other protocol this engine speaks to a live peer goes through the
//! external packet-template engine (`crate::template`); ARP is the one wire
//! protocol this crate builds and parses itself, since nothing downstream
//! of the adapter resolves it for a spoofed source address.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::adapter::{Adapter, Frame, TxRings};
use crate::error::{Error, Result};
use crate::wire::{ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol};
use crate::wire::arp::ETHERNET_IPV4_MIN_FRAME_LEN;

// `wire::Ipv4Address` is `core::net::Ipv4Addr` itself (`wire::ipv4`), so it
// is used interchangeably with `std::net::Ipv4Addr` here without conversion.

const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 10;
const ETHERNET_HEADER_LEN: usize = crate::wire::ETHERNET_HEADER_LEN;

fn build_request(my_mac: EthernetAddress, my_ip: Ipv4Addr, target_ip: Ipv4Addr) -> [u8; ETHERNET_IPV4_MIN_FRAME_LEN] {
    let mut buf = [0u8; ETHERNET_IPV4_MIN_FRAME_LEN];

    let mut eth = EthernetFrame::new_unchecked(&mut buf[..ETHERNET_HEADER_LEN]);
    eth.set_dst_addr(EthernetAddress::BROADCAST);
    eth.set_src_addr(my_mac);
    eth.set_ethertype(EthernetProtocol::Arp);

    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: my_mac,
        source_protocol_addr: my_ip,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: target_ip,
    };
    let mut arp_packet = ArpPacket::new_unchecked(&mut buf[ETHERNET_HEADER_LEN..ETHERNET_HEADER_LEN + arp_repr.buffer_len()]);
    arp_repr.emit(&mut arp_packet);

    buf
}

/// Block until the gateway (or any `target_ip`) answers, retransmitting the
/// request once per second for up to `MAX_ATTEMPTS` attempts
/// (`SPEC_FULL.md` §4.A "synchronous resolve").
pub fn resolve_sync(
    adapter: &mut dyn Adapter,
    my_ip: Ipv4Addr,
    my_mac: EthernetAddress,
    target_ip: Ipv4Addr,
) -> Result<EthernetAddress> {
    let request = build_request(my_mac, my_ip, target_ip);
    adapter
        .send_frame(&request, true)
        .map_err(|_| Error::GatewayUnreachable { gateway: target_ip, attempts: 0 })?;

    let mut attempts = 1u32;
    let mut last_send = Instant::now();
    let mut recv_buf = vec![0u8; 2048];

    loop {
        if last_send.elapsed() >= RETRY_INTERVAL {
            if attempts >= MAX_ATTEMPTS {
                return Err(Error::GatewayUnreachable { gateway: target_ip, attempts });
            }
            adapter
                .send_frame(&request, true)
                .map_err(|_| Error::GatewayUnreachable { gateway: target_ip, attempts })?;
            attempts += 1;
            last_send = Instant::now();
        }

        let recv = adapter.recv_frame(&mut recv_buf, RETRY_INTERVAL);
        let Ok(Some(len)) = recv else { continue };

        let Ok(eth) = EthernetFrame::new_checked(&recv_buf[..len]) else { continue };
        if eth.ethertype() != EthernetProtocol::Arp {
            continue;
        }
        let Ok(arp_packet) = ArpPacket::new_checked(eth.payload()) else { continue };
        let Ok(repr) = ArpRepr::parse(&arp_packet) else { continue };

        let ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_hardware_addr,
            target_protocol_addr,
        } = repr;

        if operation != ArpOperation::Reply {
            trace!("arp: opcode={operation:?}, not reply");
            continue;
        }
        if target_protocol_addr != my_ip || target_hardware_addr != my_mac {
            trace!("arp: reply not addressed to us");
            continue;
        }
        if source_protocol_addr != target_ip {
            trace!("arp: reply from {source_protocol_addr}, not the queried {target_ip}");
            continue;
        }

        debug!("arp: resolved {target_ip} -> {source_hardware_addr}");
        return Ok(source_hardware_addr);
    }
}

/// Answer an incoming ARP request for one of our own addresses
/// (`SPEC_FULL.md` §4.A "async respond"). `frame` is the complete
/// Ethernet-wrapped frame as received; non-ARP or non-request frames, and
/// requests not addressed to `my_ip`, are silently ignored.
pub fn respond(my_ip: Ipv4Addr, my_mac: EthernetAddress, frame: &[u8], rings: &TxRings) {
    let Ok(eth) = EthernetFrame::new_checked(frame) else { return };
    if eth.ethertype() != EthernetProtocol::Arp {
        return;
    }
    let Ok(arp_packet) = ArpPacket::new_checked(eth.payload()) else { return };
    let Ok(repr) = ArpRepr::parse(&arp_packet) else { return };

    let ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr,
        source_protocol_addr,
        target_protocol_addr,
        ..
    } = repr;

    if operation != ArpOperation::Request {
        trace!("arp: opcode={operation:?}, not request");
        return;
    }
    if target_protocol_addr != my_ip {
        trace!("arp: request not for our IP");
        return;
    }

    let reply = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: my_mac,
        source_protocol_addr: my_ip,
        target_hardware_addr: source_hardware_addr,
        target_protocol_addr: source_protocol_addr,
    };

    let mut out_frame = acquire_free_backoff(rings);
    let needed = ETHERNET_IPV4_MIN_FRAME_LEN;
    if out_frame.data.len() < needed {
        out_frame.data.resize(needed, 0);
    }
    out_frame.data[..needed].fill(0);

    {
        let mut eth_out = EthernetFrame::new_unchecked(&mut out_frame.data[..ETHERNET_HEADER_LEN]);
        eth_out.set_dst_addr(source_hardware_addr);
        eth_out.set_src_addr(my_mac);
        eth_out.set_ethertype(EthernetProtocol::Arp);
    }
    {
        let mut arp_out = ArpPacket::new_unchecked(&mut out_frame.data[ETHERNET_HEADER_LEN..ETHERNET_HEADER_LEN + reply.buffer_len()]);
        reply.emit(&mut arp_out);
    }
    out_frame.len = needed;

    debug!("arp: reply to {source_protocol_addr}");
    rings.enqueue_tx(out_frame);
}

fn acquire_free_backoff(rings: &TxRings) -> Frame {
    loop {
        if let Some(frame) = rings.free_ring.pop() {
            return frame;
        }
        warn!("arp: free buffer pool exhausted, backing off");
        std::thread::sleep(Duration::from_micros(100));
    }
}
