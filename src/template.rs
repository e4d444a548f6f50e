use std::net::Ipv4Addr;

use crate::wire::ethernet::{self, EtherType};
use crate::wire::tcp::{self, Flags};
use crate::wire::{EthernetAddress, Ipv4Address, Ipv4Repr};

/// The fields that change from packet to packet; everything else (source
/// MAC, destination MAC, source IP) is fixed for the lifetime of a scan and
/// lives on the template itself.
#[derive(Debug, Clone, Copy)]
pub struct PacketFields {
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: Flags,
    pub window: u16,
}

/// The external packet-template engine's contract (`SPEC_FULL.md` §6
/// "Template": `tcp_create_packet`/`tcp_set_window`).
///
/// Building the template itself (selecting a source MAC/IP, resolving a
/// gateway MAC via `crate::arp`) is this engine's job; filling in per-packet
/// fields around a caller-supplied payload is this trait's job.
pub trait PacketTemplate {
    /// Build a complete Ethernet/IPv4/TCP frame into `out`, returning the
    /// number of bytes written. `out` must be at least
    /// `header_len() + payload.len()` bytes.
    fn create_packet(&self, fields: &PacketFields, payload: &[u8], out: &mut [u8]) -> usize;

    /// Total header length (Ethernet + IPv4 + TCP) this template emits.
    fn header_len(&self) -> usize {
        ethernet::HEADER_LEN + crate::wire::IPV4_HEADER_LEN + tcp::HEADER_LEN
    }

    /// Rewrite just the advertised window of an already-built packet,
    /// without touching anything else (`SPEC_FULL.md` §6 `tcp_set_window`;
    /// used by the small-window probe flag, `SPEC_FULL.md` §4.I).
    fn set_window(&self, buf: &mut [u8], window: u16) {
        let eth_len = ethernet::HEADER_LEN;
        let ip_len = crate::wire::IPV4_HEADER_LEN;
        let tcp_start = eth_len + ip_len;
        let mut tcp_packet = tcp::Packet::new_unchecked(&mut buf[tcp_start..]);
        tcp_packet.set_window_len(window);
    }
}

/// Reference `PacketTemplate`: builds a standard Ethernet/IPv4/TCP frame
/// header on every call, grounded on the `wire::ethernet`/`wire::ipv4`/
/// `wire::tcp` `Repr::emit` chains the teacher's `wire` module already
/// provides for every other protocol it supports.
#[derive(Debug, Clone)]
pub struct EthernetTemplate {
    pub src_mac: EthernetAddress,
    pub dst_mac: EthernetAddress,
    pub src_ip: Ipv4Address,
    pub ttl: u8,
}

impl PacketTemplate for EthernetTemplate {
    fn create_packet(&self, fields: &PacketFields, payload: &[u8], out: &mut [u8]) -> usize {
        let total_len = self.header_len() + payload.len();
        assert!(out.len() >= total_len, "template output buffer too small");

        let eth_len = ethernet::HEADER_LEN;
        let ip_len = crate::wire::IPV4_HEADER_LEN;

        {
            let mut eth_frame = ethernet::Frame::new_unchecked(&mut out[..eth_len]);
            ethernet::Repr {
                src_addr: self.src_mac,
                dst_addr: self.dst_mac,
                ethertype: EtherType::Ipv4,
            }
            .emit(&mut eth_frame);
        }

        {
            let mut ip_packet =
                crate::wire::Ipv4Packet::new_unchecked(&mut out[eth_len..eth_len + ip_len]);
            Ipv4Repr {
                src_addr: self.src_ip,
                dst_addr: fields.dst_ip,
                next_header: crate::wire::IpProtocol::Tcp,
                payload_len: tcp::HEADER_LEN + payload.len(),
                hop_limit: self.ttl,
            }
            .emit(&mut ip_packet);
        }

        {
            let tcp_start = eth_len + ip_len;
            let mut tcp_packet = tcp::Packet::new_unchecked(&mut out[tcp_start..total_len]);
            tcp::Repr {
                src_port: fields.src_port,
                dst_port: fields.dst_port,
                seq_number: fields.seq,
                ack_number: fields.ack,
                flags: fields.flags,
                window_len: fields.window,
            }
            .emit(&mut tcp_packet, &self.src_ip, &fields.dst_ip, |dst| {
                dst.copy_from_slice(payload)
            });
        }

        total_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_syn_packet() {
        let tmpl = EthernetTemplate {
            src_mac: EthernetAddress::new([0, 1, 2, 3, 4, 5]),
            dst_mac: EthernetAddress::new([6, 7, 8, 9, 10, 11]),
            src_ip: Ipv4Address::new(10, 0, 0, 1),
            ttl: 64,
        };
        let fields = PacketFields {
            src_port: 40000,
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_port: 80,
            seq: 1234,
            ack: 0,
            flags: Flags::SYN,
            window: 1024,
        };
        let mut buf = vec![0u8; tmpl.header_len()];
        let n = tmpl.create_packet(&fields, &[], &mut buf);
        assert_eq!(n, tmpl.header_len());

        let eth = ethernet::Frame::new_checked(&buf[..]).unwrap();
        assert_eq!(eth.ethertype(), EtherType::Ipv4);
        let ip = crate::wire::Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.protocol(), crate::wire::IpProtocol::Tcp);
        let tcp_pkt = tcp::Packet::new_checked(ip.payload()).unwrap();
        assert!(tcp_pkt.flags().contains(Flags::SYN));
        assert_eq!(tcp_pkt.src_port(), 40000);
    }
}
