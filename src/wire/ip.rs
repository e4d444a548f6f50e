use core::fmt;

use super::{Error, Result};

/// IP datagram encapsulated protocol.
///
/// Only the handful of values the engine ever needs to compare against are
/// named; anything else round-trips through `Unknown`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Unknown(u8),
}

impl From<u8> for Protocol {
    fn from(raw: u8) -> Protocol {
        match raw {
            0x01 => Protocol::Icmp,
            0x06 => Protocol::Tcp,
            0x11 => Protocol::Udp,
            other => Protocol::Unknown(other),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(value: Protocol) -> u8 {
        match value {
            Protocol::Icmp => 0x01,
            Protocol::Tcp => 0x06,
            Protocol::Udp => 0x11,
            Protocol::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Unknown(id) => write!(f, "0x{id:02x}"),
        }
    }
}

/// Return the IP version nibble of the first octet of a datagram.
///
/// Only IPv4 is decoded by this engine's RX path; anything else is a parse
/// reject (§7 of the design: the RX thread never needs IPv6 header fields,
/// since the only in-scope network-layer codec is IPv4 — see `DESIGN.md`).
pub const fn version_of_packet(data: &[u8]) -> Result<u8> {
    if data.is_empty() {
        return Err(Error);
    }
    match data[0] >> 4 {
        4 => Ok(4),
        other => Ok(other),
    }
}

pub mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::Protocol;
    use crate::wire::Ipv4Address;

    const fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub fn data(mut data: &[u8]) -> u16 {
        let mut accum: u32 = 0;

        const CHUNK_SIZE: usize = 32;
        while data.len() >= CHUNK_SIZE {
            let mut d = &data[..CHUNK_SIZE];
            while d.len() >= 2 {
                accum += NetworkEndian::read_u16(d) as u32;
                d = &d[2..];
            }
            data = &data[CHUNK_SIZE..];
        }

        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// Compute the IPv4 pseudo-header checksum word used by TCP and UDP.
    pub fn pseudo_header_v4(
        src_addr: &Ipv4Address,
        dst_addr: &Ipv4Address,
        next_header: Protocol,
        length: u32,
    ) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = next_header.into();
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(&src_addr.octets()),
            data(&dst_addr.octets()),
            data(&proto_len[..]),
        ])
    }
}
