//! TCP stream reassembly.
//!
//! ## Pipeline
//!
//! ```text
//! Segment
//!   → StreamPool (flow lookup, Stream pair created on first segment)
//!   → StreamConsumer::accept (flag validation via TcpFsm)
//!   → HalfStream (ordering, overlap trimming, page buffering)
//!   → ScatterGather delivery to the consumer
//! ```
//!
//! Each direction of a connection is reassembled independently; bytes are
//! handed over strictly in sequence order, and anything that cannot be
//! delivered is reported as loss rather than dropped silently.
//!
//! ## References
//!
//! - [RFC 793] Transmission Control Protocol
//! - [RFC 1982] Serial Number Arithmetic

pub mod assembler;
pub mod fsm;
pub mod page;
pub mod pool;
pub mod scatter;
pub mod sequence;
pub mod stream;

pub use assembler::{AssembleOutcome, Assembler, AssemblerConfig};
pub use fsm::{FlowState, FsmSummary, TcpFsm, Validation};
pub use page::{Page, PageCache, PageCacheStats};
pub use pool::{CloseReason, CompletionReport, StreamConsumer, StreamFactory, StreamPair, StreamPool};
pub use scatter::{AssemblyStats, ChunkInfo, ScatterGather, Skip};
pub use sequence::Sequence;
pub use stream::{HalfStream, LossReport, StreamStats};

use std::fmt;
use std::net::IpAddr;
use std::ops::BitOr;

use serde::Serialize;

use crate::capture::CaptureInfo;

/// Which half of a connection a segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    pub fn is_client(self) -> bool {
        matches!(self, Direction::ClientToServer)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("client"),
            Direction::ServerToClient => f.write_str("server"),
        }
    }
}

/// Source and destination of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Endpoints<T> {
    pub src: T,
    pub dst: T,
}

impl<T: Copy> Endpoints<T> {
    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

/// Network and transport endpoints of a packet, in the packet's orientation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowIdentity {
    pub network: Endpoints<IpAddr>,
    pub transport: Endpoints<u16>,
}

impl FlowIdentity {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self {
            network: Endpoints { src: src_ip, dst: dst_ip },
            transport: Endpoints { src: src_port, dst: dst_port },
        }
    }

    pub fn reverse(&self) -> Self {
        Self {
            network: self.network.reverse(),
            transport: self.transport.reverse(),
        }
    }

    /// Orientation-independent key: both directions of a connection map to
    /// the same value. The side with the lower (ip, port) comes first.
    pub fn key(&self) -> FlowKey {
        let a = (self.network.src, self.transport.src);
        let b = (self.network.dst, self.transport.dst);
        if a <= b {
            FlowKey { low: a, high: b }
        } else {
            FlowKey { low: b, high: a }
        }
    }
}

impl fmt::Debug for FlowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for FlowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.network.src, self.transport.src, self.network.dst, self.transport.dst
        )
    }
}

/// Bidirectional flow key used by the [`StreamPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    low: (IpAddr, u16),
    high: (IpAddr, u16),
}

/// TCP control flags (low byte of the flags field).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn fin(self) -> bool {
        self.contains(Self::FIN)
    }

    pub fn syn(self) -> bool {
        self.contains(Self::SYN)
    }

    pub fn rst(self) -> bool {
        self.contains(Self::RST)
    }

    pub fn ack(self) -> bool {
        self.contains(Self::ACK)
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SYN, "SYN"),
            (Self::ACK, "ACK"),
            (Self::FIN, "FIN"),
            (Self::RST, "RST"),
            (Self::PSH, "PSH"),
            (Self::URG, "URG"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&set.join("|"))
        }
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpFlags({self})")
    }
}

/// One transport-layer segment as handed to the assembler.
#[derive(Debug, Clone)]
pub struct Segment {
    pub seq: Sequence,
    pub ack: Sequence,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
    pub capture: CaptureInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_flow_key_is_orientation_independent() {
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let flow = FlowIdentity::new(a, 50000, b, 80);
        assert_eq!(flow.key(), flow.reverse().key());
        assert_ne!(flow.key(), FlowIdentity::new(a, 50001, b, 80).key());
        assert_eq!(flow.to_string(), "10.0.0.1:50000 -> 10.0.0.2:80");
    }

    #[test]
    fn test_flags_display() {
        assert_eq!((TcpFlags::SYN | TcpFlags::ACK).to_string(), "SYN|ACK");
        assert_eq!(TcpFlags::default().to_string(), "-");
    }
}
