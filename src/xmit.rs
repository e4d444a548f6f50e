use std::net::IpAddr;
use std::sync::atomic::AtomicBool;

use crate::adapter::TxRings;
use crate::segment::TransmitHead;
use crate::tcb::Tcb;
use crate::template::{PacketFields, PacketTemplate};
use crate::wire::tcp::Flags;

/// The transmit bridge (`SPEC_FULL.md` §4.H): turns a decision made inside
/// `crate::state`/`crate::app` into an actual frame on the wire, via the
/// external packet-template engine and the TX thread's ring
/// (`crate::adapter::TxRings`).
///
/// Kept as a trait so `crate::state`/`crate::app` never depend on
/// `crate::template`/`crate::adapter` directly — the same separation
/// `crate::adapter::Adapter` draws between "the interface" and "how a frame
/// actually reaches the wire".
pub trait Transmit {
    fn send_ack(&mut self, tcb: &Tcb);
    fn send_rst(&mut self, tcb: &Tcb);
    fn send_segment(&mut self, tcb: &Tcb, seg: TransmitHead, payload: &[u8]);
    /// Retransmit the (stateless) initial `SYN` for a TCB that was created
    /// ahead of its own handshake (reconnect, `SPEC_FULL.md` §4.G) and is
    /// still waiting for a `SYN|ACK`.
    fn send_syn(&mut self, tcb: &Tcb);
}

/// A `Transmit` implementation wired to a concrete `PacketTemplate` and a
/// pair of TX rings — what `crate::engine::Engine` actually uses.
pub struct FrameTransmit<'a, T: PacketTemplate> {
    pub template: &'a T,
    pub rings: &'a TxRings,
    pub warned_once: &'a AtomicBool,
}

impl<'a, T: PacketTemplate> FrameTransmit<'a, T> {
    fn emit(&self, fields: &PacketFields, payload: &[u8]) {
        let mut frame = self.rings.acquire_free(self.warned_once);
        let needed = self.template.header_len() + payload.len();
        if frame.data.len() < needed {
            frame.data.resize(needed, 0);
        }
        let written = self.template.create_packet(fields, payload, &mut frame.data);
        frame.len = written;
        self.rings.enqueue_tx(frame);
    }

    fn fields(&self, tcb: &Tcb, seq: u32, flags: Flags) -> Option<PacketFields> {
        match tcb.ip_remote {
            IpAddr::V4(ip) => Some(PacketFields {
                src_port: tcb.port_local,
                dst_ip: ip,
                dst_port: tcb.port_remote,
                seq,
                ack: tcb.ack_remote,
                flags,
                window: if tcb.small_window { 16 } else { 65535 },
            }),
            // No wire codec decodes or encodes IPv6 (`DESIGN.md` Open
            // Question 4); there is nothing to transmit to.
            IpAddr::V6(_) => None,
        }
    }
}

impl<'a, T: PacketTemplate> Transmit for FrameTransmit<'a, T> {
    fn send_ack(&mut self, tcb: &Tcb) {
        if let Some(fields) = self.fields(tcb, tcb.seq_local, Flags::ACK) {
            self.emit(&fields, &[]);
        }
    }

    fn send_rst(&mut self, tcb: &Tcb) {
        if let Some(fields) = self.fields(tcb, tcb.seq_local, Flags::RST | Flags::ACK) {
            self.emit(&fields, &[]);
        }
    }

    fn send_segment(&mut self, tcb: &Tcb, seg: TransmitHead, payload: &[u8]) {
        let flags = if seg.fin {
            Flags::FIN | Flags::ACK
        } else {
            Flags::PSH | Flags::ACK
        };
        if let Some(fields) = self.fields(tcb, seg.seq, flags) {
            self.emit(&fields, payload);
        }
    }

    fn send_syn(&mut self, tcb: &Tcb) {
        if let Some(fields) = self.fields(tcb, tcb.seq_local_first, Flags::SYN) {
            self.emit(&fields, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::EthernetTemplate;
    use crate::wire::{EthernetAddress, Ipv4Address};
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool;

    fn tcb() -> Tcb {
        Tcb::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            40000,
            80,
            1000,
            5000,
            64,
            false,
            0,
            0,
        )
    }

    #[test]
    fn send_segment_carries_real_payload() {
        let tmpl = EthernetTemplate {
            src_mac: EthernetAddress::new([0, 1, 2, 3, 4, 5]),
            dst_mac: EthernetAddress::new([6, 7, 8, 9, 10, 11]),
            src_ip: Ipv4Address::new(10, 0, 0, 1),
            ttl: 64,
        };
        let rings = TxRings::new(4, 128);
        let warned = AtomicBool::new(false);
        let mut xmit = FrameTransmit {
            template: &tmpl,
            rings: &rings,
            warned_once: &warned,
        };
        let tcb = tcb();
        let seg = TransmitHead {
            seq: 1000,
            len: 5,
            fin: false,
        };
        xmit.send_segment(&tcb, seg, b"hello");

        let frame = rings.tx_ring.pop().expect("frame enqueued");
        let eth = crate::wire::ethernet::Frame::new_checked(frame.as_slice()).unwrap();
        let ip = crate::wire::Ipv4Packet::new_checked(eth.payload()).unwrap();
        let tcp_pkt = crate::wire::tcp::Packet::new_checked(ip.payload()).unwrap();
        assert_eq!(tcp_pkt.payload(), b"hello");
        assert_eq!(tcp_pkt.src_port(), 40000);
    }
}
