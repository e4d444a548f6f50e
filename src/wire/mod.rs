/*! Low-level packet access and construction.

The `wire` module deals with packet *representation*. Two levels of
functionality live here, matching the shape used throughout this crate:

 * A `Packet<T>` family of structures provides raw accessors into a byte
   buffer, e.g. [EthernetFrame] or [Ipv4Packet]. No accessor panics once
   `Packet::check_len()` (or `new_checked`) has succeeded.
 * A `Repr` family of structs provides a validated, high-level view that
   can be parsed from and emitted into such a buffer, e.g. [ArpRepr] or
   [TcpRepr].

This module only covers the protocols the engine's own RX decode path
needs to recognize a TCP event: Ethernet, ARP, IPv4, and TCP.

[EthernetFrame]: ethernet::Frame
[Ipv4Packet]: ipv4::Packet
[ArpRepr]: arp::Repr
[TcpRepr]: tcp::Repr
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

use core::fmt;

pub mod ethernet;
pub use self::ethernet::{
    Address as EthernetAddress, EtherType as EthernetProtocol, Frame as EthernetFrame,
    HEADER_LEN as ETHERNET_HEADER_LEN,
};

pub mod arp;
pub use self::arp::{
    Hardware as ArpHardware, Operation as ArpOperation, Packet as ArpPacket, Repr as ArpRepr,
};

pub(crate) mod ip;
pub use self::ip::{Protocol as IpProtocol, checksum};

pub(crate) mod ipv4;
pub(crate) use self::ipv4::AddressExt as Ipv4AddressExt;
pub use self::ipv4::{
    Address as Ipv4Address, Cidr as Ipv4Cidr, Packet as Ipv4Packet, Repr as Ipv4Repr,
    HEADER_LEN as IPV4_HEADER_LEN,
};

pub mod tcp;
pub use self::tcp::{
    Flags as TcpFlags, Packet as TcpPacket, Repr as TcpRepr, HEADER_LEN as TCP_HEADER_LEN,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is a protocol this engine doesn't decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
