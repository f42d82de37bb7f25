//! IPv4 fragment reassembly.
//!
//! Fragments are grouped by (source, destination, identification,
//! protocol). A datagram is complete once its last fragment has been seen
//! and the collected fragments cover every byte before it. Overlapping
//! fragments keep the bytes that arrived first.
//!
//! Reference: RFC 791 section 3.2, RFC 815.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use super::packet::Ipv4Header;
use super::CaptureInfo;

/// Largest datagram IPv4 can describe.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Capture-time age after which an incomplete datagram is discarded.
pub const DEFAULT_FRAGMENT_TIMEOUT_US: u64 = 30_000_000;

/// A datagram rebuilt from its fragments.
#[derive(Debug, Clone)]
pub struct Ipv4Datagram {
    /// Header of the first fragment, rewritten to describe the whole datagram.
    pub header: Ipv4Header,
    pub payload: Vec<u8>,
}

/// Accepts fragments and hands back whole datagrams.
pub trait Defragmenter: Send {
    /// Add one fragment. Returns the datagram once it is complete.
    fn defrag(&mut self, header: &Ipv4Header, payload: &[u8], capture: &CaptureInfo) -> Option<Ipv4Datagram>;

    /// Drop incomplete datagrams whose first fragment is older than
    /// `cutoff_us`. Returns how many were dropped.
    fn discard_older_than(&mut self, cutoff_us: u64) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub identification: u16,
    pub protocol: u8,
}

impl FragmentKey {
    fn of(header: &Ipv4Header) -> Self {
        Self {
            src: header.src,
            dst: header.dst,
            identification: header.identification,
            protocol: header.protocol,
        }
    }
}

#[derive(Debug)]
struct PendingDatagram {
    first_seen_us: u64,
    /// Fragment payloads keyed by byte offset.
    fragments: BTreeMap<usize, Vec<u8>>,
    /// Payload length, known once the last fragment arrived.
    total_len: Option<usize>,
    /// Header of the fragment at offset zero.
    first_header: Option<Ipv4Header>,
}

impl PendingDatagram {
    fn new(first_seen_us: u64) -> Self {
        Self {
            first_seen_us,
            fragments: BTreeMap::new(),
            total_len: None,
            first_header: None,
        }
    }

    fn is_complete(&self) -> bool {
        let (Some(total), Some(_)) = (self.total_len, self.first_header) else {
            return false;
        };
        let mut covered = 0usize;
        for (offset, bytes) in &self.fragments {
            if *offset > covered {
                return false;
            }
            covered = covered.max(offset + bytes.len());
        }
        covered >= total
    }

    fn assemble(self) -> Option<Ipv4Datagram> {
        let total = self.total_len?;
        let mut header = self.first_header?;
        let mut payload = Vec::with_capacity(total);
        for (offset, bytes) in self.fragments {
            let end = (offset + bytes.len()).min(total);
            let have = payload.len();
            if end > have {
                payload.extend_from_slice(&bytes[have - offset..end - offset]);
            }
        }
        header.flags &= !0x1;
        header.fragment_offset = 0;
        header.total_length = (header.header_len() + payload.len()).min(MAX_DATAGRAM_SIZE) as u16;
        Some(Ipv4Datagram { header, payload })
    }
}

/// Default [`Defragmenter`] keeping pending datagrams in a hash map.
#[derive(Debug, Default)]
pub struct Ipv4Defragmenter {
    pending: HashMap<FragmentKey, PendingDatagram>,
    reassembled: u64,
    discarded: u64,
}

impl Ipv4Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn reassembled(&self) -> u64 {
        self.reassembled
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl Defragmenter for Ipv4Defragmenter {
    fn defrag(&mut self, header: &Ipv4Header, payload: &[u8], capture: &CaptureInfo) -> Option<Ipv4Datagram> {
        let offset = header.fragment_offset_bytes();
        let end = offset + payload.len();
        if end + header.header_len() > MAX_DATAGRAM_SIZE {
            tracing::debug!(src = %header.src, id = header.identification, end, "oversized fragment dropped");
            return None;
        }

        let key = FragmentKey::of(header);
        let entry = self
            .pending
            .entry(key)
            .or_insert_with(|| PendingDatagram::new(capture.timestamp_us));
        if offset == 0 {
            entry.first_header = Some(*header);
        }
        if !header.more_fragments() {
            entry.total_len = Some(end);
        }
        entry.fragments.entry(offset).or_insert_with(|| payload.to_vec());

        if !entry.is_complete() {
            return None;
        }
        let datagram = self.pending.remove(&key)?.assemble()?;
        self.reassembled += 1;
        tracing::trace!(
            src = %header.src,
            id = header.identification,
            len = datagram.payload.len(),
            "reassembled fragmented datagram"
        );
        Some(datagram)
    }

    fn discard_older_than(&mut self, cutoff_us: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.first_seen_us >= cutoff_us);
        let dropped = before - self.pending.len();
        self.discarded += dropped as u64;
        if dropped > 0 {
            tracing::debug!(dropped, "discarded incomplete datagrams");
        }
        dropped
    }
}
