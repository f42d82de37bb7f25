//! Link-layer, IPv4/IPv6 and TCP header decoding.
//!
//! We use `nom` combinators for zero-copy parsing. Truncated or malformed
//! headers make the packet undecodable (`None`); they are never an error,
//! captures routinely contain snapped or corrupt frames.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::IResult;
use serde::Serialize;

use super::defrag::Defragmenter;
use super::{CaptureInfo, LinkType, Packet};
use crate::reassembly::{FlowIdentity, Segment, Sequence, TcpFlags};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IP_PROTO_TCP: u8 = 6;

/// IPv4 "more fragments" flag (in the 3-bit flags field).
const IPV4_MORE_FRAGMENTS: u8 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ipv4Header {
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    /// The 3-bit flags field (reserved, DF, MF).
    pub flags: u8,
    /// Offset of this fragment in 8-byte units.
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    pub fn more_fragments(&self) -> bool {
        self.flags & IPV4_MORE_FRAGMENTS != 0
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset != 0
    }

    /// Offset of this fragment's payload in bytes.
    pub fn fragment_offset_bytes(&self) -> usize {
        self.fragment_offset as usize * 8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_length: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IpHeader {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

impl IpHeader {
    pub fn src(&self) -> IpAddr {
        match self {
            IpHeader::V4(h) => IpAddr::V4(h.src),
            IpHeader::V6(h) => IpAddr::V6(h.src),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            IpHeader::V4(h) => IpAddr::V4(h.dst),
            IpHeader::V6(h) => IpAddr::V6(h.dst),
        }
    }

    pub fn protocol(&self) -> u8 {
        match self {
            IpHeader::V4(h) => h.protocol,
            IpHeader::V6(h) => h.next_header,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in 32-bit words.
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

/// A network-layer packet borrowed from the link-layer frame.
#[derive(Debug, Clone, Copy)]
pub struct IpPacket<'a> {
    pub header: IpHeader,
    pub payload: &'a [u8],
}

/// A packet decoded down to the transport layer.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub capture: CaptureInfo,
    pub ip: IpHeader,
    /// Present when the packet carries TCP.
    pub tcp: Option<TcpHeader>,
    /// Transport payload for TCP packets, network payload otherwise.
    pub payload: Vec<u8>,
    /// The IPv4 datagram was reassembled from fragments.
    pub reassembled: bool,
}

impl DecodedPacket {
    pub fn flow(&self) -> Option<FlowIdentity> {
        let tcp = self.tcp?;
        Some(FlowIdentity::new(self.ip.src(), tcp.src_port, self.ip.dst(), tcp.dst_port))
    }

    /// The TCP segment carried by this packet.
    pub fn segment(&self) -> Option<Segment> {
        let tcp = self.tcp?;
        Some(Segment {
            seq: Sequence(tcp.seq),
            ack: Sequence(tcp.ack),
            flags: tcp.flags,
            payload: self.payload.clone(),
            capture: self.capture,
        })
    }
}

/// Ethernet II header, following one optional 802.1Q tag. Returns the
/// ethertype of the payload.
pub fn parse_ethernet(input: &[u8]) -> IResult<&[u8], u16> {
    let (input, _macs) = take(12usize)(input)?;
    let (input, ethertype) = be_u16(input)?;
    if ethertype == ETHERTYPE_VLAN {
        let (input, _tci) = be_u16(input)?;
        return be_u16(input);
    }
    Ok((input, ethertype))
}

fn parse_ipv4(input: &[u8]) -> IResult<&[u8], (Ipv4Header, &[u8])> {
    let start = input;
    let (input, version_ihl) = be_u8(input)?;
    let (input, tos) = be_u8(input)?;
    let (input, total_length) = be_u16(input)?;
    let (input, identification) = be_u16(input)?;
    let (input, flags_frag) = be_u16(input)?;
    let (input, ttl) = be_u8(input)?;
    let (input, protocol) = be_u8(input)?;
    let (input, checksum) = be_u16(input)?;
    let (input, src) = be_u32(input)?;
    let (_, dst) = be_u32(input)?;

    let ihl = version_ihl & 0x0F;
    let header_len = ihl as usize * 4;
    if version_ihl >> 4 != 4 || header_len < 20 || (total_length as usize) < header_len {
        return Err(nom::Err::Error(nom::error::Error::new(start, nom::error::ErrorKind::Verify)));
    }
    let (rest, _header) = take(header_len)(start)?;
    // trailing link-layer padding is not part of the datagram
    let payload_len = (total_length as usize - header_len).min(rest.len());
    let (rest, payload) = take(payload_len)(rest)?;

    let header = Ipv4Header {
        ihl,
        tos,
        total_length,
        identification,
        flags: (flags_frag >> 13) as u8,
        fragment_offset: flags_frag & 0x1FFF,
        ttl,
        protocol,
        checksum,
        src: Ipv4Addr::from(src),
        dst: Ipv4Addr::from(dst),
    };
    Ok((rest, (header, payload)))
}

fn parse_ipv6(input: &[u8]) -> IResult<&[u8], (Ipv6Header, &[u8])> {
    let (input, vtf) = be_u32(input)?;
    let (input, payload_length) = be_u16(input)?;
    let (input, next_header) = be_u8(input)?;
    let (input, hop_limit) = be_u8(input)?;
    let (input, src) = take(16usize)(input)?;
    let (input, dst) = take(16usize)(input)?;
    if vtf >> 28 != 6 {
        return Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify)));
    }
    let payload_len = (payload_length as usize).min(input.len());
    let (rest, payload) = take(payload_len)(input)?;

    let mut s = [0u8; 16];
    s.copy_from_slice(src);
    let mut d = [0u8; 16];
    d.copy_from_slice(dst);
    // Simplified: no extension header chasing.
    let header = Ipv6Header {
        traffic_class: ((vtf >> 20) & 0xFF) as u8,
        flow_label: vtf & 0x000F_FFFF,
        payload_length,
        next_header,
        hop_limit,
        src: Ipv6Addr::from(s),
        dst: Ipv6Addr::from(d),
    };
    Ok((rest, (header, payload)))
}

/// TCP header; the returned slice is the segment payload.
pub fn parse_tcp(input: &[u8]) -> IResult<&[u8], TcpHeader> {
    let start = input;
    let (input, src_port) = be_u16(input)?;
    let (input, dst_port) = be_u16(input)?;
    let (input, seq) = be_u32(input)?;
    let (input, ack) = be_u32(input)?;
    let (input, offset) = be_u8(input)?;
    let (input, flags) = be_u8(input)?;
    let (input, window) = be_u16(input)?;
    let (input, checksum) = be_u16(input)?;
    let (_, urgent) = be_u16(input)?;

    let data_offset = offset >> 4;
    let header_len = data_offset as usize * 4;
    if header_len < 20 {
        return Err(nom::Err::Error(nom::error::Error::new(start, nom::error::ErrorKind::Verify)));
    }
    let (payload, _options) = take(header_len)(start)?;
    Ok((
        payload,
        TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            data_offset,
            flags: TcpFlags(flags),
            window,
            checksum,
            urgent,
        },
    ))
}

/// Linux cooked capture header (16 bytes). Returns the protocol of the
/// payload as an ethertype.
pub fn parse_linux_sll(input: &[u8]) -> IResult<&[u8], u16> {
    // packet type, ARPHRD type, address length, 8 address bytes
    let (input, _) = take(14usize)(input)?;
    be_u16(input)
}

/// Ethertype of a bare IP packet, from its version nibble.
fn ip_version_ethertype(packet: &[u8]) -> Option<u16> {
    match packet.first()? >> 4 {
        4 => Some(ETHERTYPE_IPV4),
        6 => Some(ETHERTYPE_IPV6),
        _ => None,
    }
}

/// Decode the network layer of a frame captured with `link_type` framing.
pub fn parse_ip(link_type: LinkType, frame: &[u8]) -> Option<IpPacket<'_>> {
    let (rest, ethertype) = match link_type {
        LinkType::Ethernet => parse_ethernet(frame).ok()?,
        LinkType::LinuxSll => parse_linux_sll(frame).ok()?,
        LinkType::Raw => (frame, ip_version_ethertype(frame)?),
        LinkType::Null => {
            // the address family is in the capturing host's byte order
            let rest = frame.get(4..)?;
            (rest, ip_version_ethertype(rest)?)
        }
        LinkType::Unsupported(_) => return None,
    };
    match ethertype {
        ETHERTYPE_IPV4 => {
            let (_, (header, payload)) = parse_ipv4(rest).ok()?;
            Some(IpPacket {
                header: IpHeader::V4(header),
                payload,
            })
        }
        ETHERTYPE_IPV6 => {
            let (_, (header, payload)) = parse_ipv6(rest).ok()?;
            Some(IpPacket {
                header: IpHeader::V6(header),
                payload,
            })
        }
        _ => None,
    }
}

/// Decode a captured frame down to the transport layer, routing IPv4
/// fragments through `defrag`. Returns `None` for non-IP traffic, for
/// fragments of a still incomplete datagram, and for truncated headers.
pub fn decode_packet(packet: &Packet, defrag: &mut dyn Defragmenter) -> Option<DecodedPacket> {
    let ip = parse_ip(packet.link_type, &packet.data)?;

    let mut reassembled = false;
    let (header, payload) = match ip.header {
        IpHeader::V4(v4) if v4.is_fragment() => {
            let datagram = defrag.defrag(&v4, ip.payload, &packet.info)?;
            reassembled = true;
            (IpHeader::V4(datagram.header), datagram.payload)
        }
        header => (header, ip.payload.to_vec()),
    };

    if header.protocol() != IP_PROTO_TCP {
        return Some(DecodedPacket {
            capture: packet.info,
            ip: header,
            tcp: None,
            payload,
            reassembled,
        });
    }

    let (segment_payload, tcp) = parse_tcp(&payload).ok()?;
    Some(DecodedPacket {
        capture: packet.info,
        ip: header,
        tcp: Some(tcp),
        payload: segment_payload.to_vec(),
        reassembled,
    })
}
