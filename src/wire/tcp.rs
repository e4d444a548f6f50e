use bitflags::bitflags;
use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::ip::checksum;
use super::ip::Protocol;
use super::{Error, Result};
use super::Ipv4Address;

bitflags! {
    /// TCP header control bits. Only the flags this engine's reduced state
    /// machine (`crate::state`) ever inspects or sets are named; no options
    /// (window scale, SACK, timestamps) are emitted or parsed (non-goal).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        const FIN = 0x001;
        const SYN = 0x002;
        const RST = 0x004;
        const PSH = 0x008;
        const ACK = 0x010;
        const URG = 0x020;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (name, flag) in [
            ("SYN", Flags::SYN),
            ("ACK", Flags::ACK),
            ("FIN", Flags::FIN),
            ("RST", Flags::RST),
            ("PSH", Flags::PSH),
            ("URG", Flags::URG),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WINDOW: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub const fn PAYLOAD(data_offset_words: u8) -> Rest {
        (data_offset_words as usize * 4)..
    }
}

pub const HEADER_LEN: usize = field::URGENT.end;

/// Default maximum segment size assumed when a peer's SYN/ACK carries no MSS
/// option (this engine never emits or parses TCP options at all).
pub const DEFAULT_MSS: usize = 1400;

/// A read/write wrapper around a TCP segment buffer (no options).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

#[allow(clippy::len_without_is_empty)]
impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP segment structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error);
        }
        let data_offset = self.data_offset();
        if (data_offset as usize) < 5 || len < data_offset as usize * 4 {
            return Err(Error);
        }
        Ok(())
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[field::SEQ_NUM])
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[field::ACK_NUM])
    }

    /// Return the data offset, in 32-bit words.
    #[inline]
    pub fn data_offset(&self) -> u8 {
        self.buffer.as_ref()[field::FLAGS.start] >> 4
    }

    /// Return the control flags.
    #[inline]
    pub fn flags(&self) -> Flags {
        let raw = NetworkEndian::read_u16(&self.buffer.as_ref()[field::FLAGS]) & 0x01ff;
        Flags::from_bits_truncate(raw)
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::WINDOW])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    /// Validate the packet checksum.
    pub fn verify_checksum(&self, src_addr: &Ipv4Address, dst_addr: &Ipv4Address) -> bool {
        if self.checksum() == 0 {
            return true;
        }
        let data = self.buffer.as_ref();
        checksum::combine(&[
            checksum::pseudo_header_v4(src_addr, dst_addr, Protocol::Tcp, data.len() as u32),
            checksum::data(data),
        ]) == !0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return a pointer to the payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let data_offset = self.data_offset();
        &self.buffer.as_ref()[field::PAYLOAD(data_offset)]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::SEQ_NUM], value)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::ACK_NUM], value)
    }

    /// Set the data offset, in 32-bit words, and clear the reserved bits.
    #[inline]
    pub fn set_data_offset(&mut self, value: u8) {
        self.buffer.as_mut()[field::FLAGS.start] = value << 4;
    }

    /// Set the control flags, preserving the data offset nibble.
    #[inline]
    pub fn set_flags(&mut self, value: Flags) {
        let data_offset = self.data_offset();
        NetworkEndian::write_u16(
            &mut self.buffer.as_mut()[field::FLAGS],
            ((data_offset as u16) << 12) | value.bits(),
        )
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::WINDOW], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value)
    }

    /// Compute and fill in the checksum, given the IPv4 pseudo-header addresses.
    pub fn fill_checksum(&mut self, src_addr: &Ipv4Address, dst_addr: &Ipv4Address) {
        self.set_checksum(0);
        let checksum = {
            let data = self.buffer.as_ref();
            !checksum::combine(&[
                checksum::pseudo_header_v4(src_addr, dst_addr, Protocol::Tcp, data.len() as u32),
                checksum::data(data),
            ])
        };
        self.set_checksum(checksum)
    }

    /// Return a mutable pointer to the payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let data_offset = self.data_offset();
        &mut self.buffer.as_mut()[field::PAYLOAD(data_offset)]
    }
}

/// A high-level representation of a TCP segment header.
///
/// Deliberately minimal: no options are represented, matching this engine's
/// non-goals (no window scaling, no SACK, no timestamps).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: Flags,
    pub window_len: u16,
}

impl Repr {
    /// Parse a TCP segment header and return a high-level representation.
    pub fn parse<T: AsRef<[u8]> + ?Sized>(
        packet: &Packet<&T>,
        src_addr: &Ipv4Address,
        dst_addr: &Ipv4Address,
    ) -> Result<Repr> {
        packet.check_len()?;
        if packet.dst_port() == 0 {
            return Err(Error);
        }
        if !packet.verify_checksum(src_addr, dst_addr) {
            return Err(Error);
        }
        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            seq_number: packet.seq_number(),
            ack_number: packet.ack_number(),
            flags: packet.flags(),
            window_len: packet.window_len(),
        })
    }

    /// Length of the header this representation emits (always 20: no options).
    pub const fn header_len(&self) -> usize {
        HEADER_LEN
    }

    /// Emit a high-level representation into a TCP segment buffer.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]> + ?Sized>(
        &self,
        packet: &mut Packet<&mut T>,
        src_addr: &Ipv4Address,
        dst_addr: &Ipv4Address,
        emit_payload: impl FnOnce(&mut [u8]),
    ) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number);
        packet.set_data_offset((HEADER_LEN / 4) as u8);
        packet.set_flags(self.flags);
        packet.set_window_len(self.window_len);
        emit_payload(packet.payload_mut());
        packet.fill_checksum(src_addr, dst_addr);
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TCP src={} dst={} seq={} ack={} flags={} win={}",
            self.src_port, self.dst_port, self.seq_number, self.ack_number, self.flags, self.window_len
        )
    }
}
