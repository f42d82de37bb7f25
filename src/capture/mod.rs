//! Capture input: pcap reading, link/network/transport header decoding and
//! IPv4 defragmentation.
//!
//! Reference: libpcap file format, RFC 791 (IPv4), RFC 8200 (IPv6),
//! RFC 793 (TCP).

pub mod defrag;
pub mod packet;
pub mod pcap_reader;

pub use defrag::{Defragmenter, FragmentKey, Ipv4Datagram, Ipv4Defragmenter};
pub use packet::{
    decode_packet, parse_ethernet, parse_ip, parse_linux_sll, parse_tcp, DecodedPacket, IpHeader, IpPacket,
    Ipv4Header, Ipv6Header, TcpHeader,
};
pub use pcap_reader::{PacketIterator, PcapReader};

use pcap_parser::Linktype;
use serde::Serialize;

/// Capture metadata of one packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureInfo {
    /// Capture timestamp in microseconds since the Unix epoch.
    pub timestamp_us: u64,
    /// Bytes present in the capture file.
    pub capture_length: u32,
    /// Bytes on the wire, possibly more than were captured.
    pub wire_length: u32,
}

/// Framing in front of the network layer, taken from the file header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum LinkType {
    #[default]
    Ethernet,
    /// Bare IPv4 or IPv6 packets.
    Raw,
    /// Linux cooked capture (SLL).
    LinuxSll,
    /// BSD loopback: a 4-byte address family before the IP header.
    Null,
    Unsupported(i32),
}

impl LinkType {
    pub fn is_supported(self) -> bool {
        !matches!(self, LinkType::Unsupported(_))
    }
}

impl From<Linktype> for LinkType {
    fn from(value: Linktype) -> Self {
        match value {
            Linktype::ETHERNET => LinkType::Ethernet,
            Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => LinkType::Raw,
            Linktype::LINUX_SLL => LinkType::LinuxSll,
            Linktype::NULL => LinkType::Null,
            Linktype(other) => LinkType::Unsupported(other),
        }
    }
}

/// Raw packet data extracted from a capture file.
#[derive(Debug, Clone)]
pub struct Packet {
    pub info: CaptureInfo,
    pub link_type: LinkType,
    /// Link-layer frame, framed as `link_type` says.
    pub data: Vec<u8>,
}
