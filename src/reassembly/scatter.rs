//! Delivery unit handed to stream consumers.
//!
//! A reassembled run of bytes may span the lookahead kept from a previous
//! delivery, the live segment and any buffered pages it unblocked. The
//! [`ScatterGather`] view exposes them as one ordered byte range without
//! copying unless the consumer fetches across part boundaries.

use std::borrow::Cow;

use super::Direction;
use crate::capture::CaptureInfo;

/// Figures describing a delivery and the half-connection behind it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    /// Parts making up this delivery.
    pub chunks: usize,
    /// Segments (live or buffered) contributing to this delivery.
    pub packets: usize,
    /// Bytes/segments buffered out of order since the previous delivery.
    pub queued_bytes: usize,
    pub queued_packets: usize,
    /// Duplicate bytes/segments discarded since the previous delivery.
    pub overlap_bytes: usize,
    pub overlap_packets: usize,
}

/// Bytes that could not be delivered before this chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Skip {
    #[default]
    None,
    /// A known number of bytes is missing.
    Bytes(usize),
    /// Tracking was reset and the size of the hole cannot be known.
    Unknown,
}

impl Skip {
    pub fn bytes(self) -> usize {
        match self {
            Skip::Bytes(n) => n,
            Skip::None | Skip::Unknown => 0,
        }
    }

    pub fn is_none(self) -> bool {
        matches!(self, Skip::None)
    }

    pub(crate) fn merge(self, other: Skip) -> Skip {
        match (self, other) {
            (Skip::Unknown, _) | (_, Skip::Unknown) => Skip::Unknown,
            (Skip::Bytes(a), Skip::Bytes(b)) => Skip::Bytes(a + b),
            (Skip::None, s) | (s, Skip::None) => s,
        }
    }
}

/// Flags describing where a delivery sits in its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub direction: Direction,
    pub start: bool,
    pub end: bool,
    pub skip: Skip,
}

/// Reassembled data passed to a consumer.
pub trait ScatterGather {
    /// Available bytes (including kept ones) and bytes kept from the previous call.
    fn lengths(&self) -> (usize, usize);
    /// Up to `length` bytes from the front of the available range.
    fn fetch(&self, length: usize) -> Cow<'_, [u8]>;
    /// Keep bytes from `offset` onwards for the next delivery.
    fn keep_from(&mut self, offset: usize);
    /// Capture metadata of the packet that carried the byte at `offset`.
    fn capture_info(&self, offset: usize) -> CaptureInfo;
    fn info(&self) -> ChunkInfo;
    fn stats(&self) -> AssemblyStats;
}

/// Lookahead bytes carried over between deliveries.
#[derive(Debug, Default, Clone)]
pub(crate) struct Saved {
    pub bytes: Vec<u8>,
    /// (offset into `bytes`, capture of the packet that started there)
    pub marks: Vec<(usize, CaptureInfo)>,
}

impl Saved {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct Part<'a> {
    bytes: &'a [u8],
    capture: CaptureInfo,
}

/// Borrowed view over the parts of one delivery.
pub(crate) struct Reassembly<'a> {
    parts: Vec<Part<'a>>,
    saved_len: usize,
    info: ChunkInfo,
    stats: AssemblyStats,
    keep: Option<usize>,
}

impl<'a> Reassembly<'a> {
    pub fn new(saved: &'a Saved, info: ChunkInfo) -> Self {
        let mut parts = Vec::new();
        for (i, (offset, capture)) in saved.marks.iter().enumerate() {
            let end = saved
                .marks
                .get(i + 1)
                .map(|(next, _)| *next)
                .unwrap_or(saved.bytes.len());
            if end > *offset {
                parts.push(Part {
                    bytes: &saved.bytes[*offset..end],
                    capture: *capture,
                });
            }
        }
        Self {
            parts,
            saved_len: saved.len(),
            info,
            stats: AssemblyStats::default(),
            keep: None,
        }
    }

    pub fn push(&mut self, bytes: &'a [u8], capture: CaptureInfo) {
        self.stats.packets += 1;
        if !bytes.is_empty() {
            self.parts.push(Part { bytes, capture });
        }
    }

    pub fn set_stats(&mut self, stats: AssemblyStats) {
        let packets = self.stats.packets;
        self.stats = stats;
        self.stats.packets = packets;
        self.stats.chunks = self.parts.len();
    }

    fn available(&self) -> usize {
        self.parts.iter().map(|p| p.bytes.len()).sum()
    }

    /// Copy out the bytes the consumer asked to keep.
    pub fn take_kept(&self) -> Option<Saved> {
        let from = self.keep?;
        let mut saved = Saved::default();
        let mut pos = 0usize;
        for part in &self.parts {
            let part_end = pos + part.bytes.len();
            if part_end > from {
                let skip = from.saturating_sub(pos);
                saved.marks.push((saved.bytes.len(), part.capture));
                saved.bytes.extend_from_slice(&part.bytes[skip..]);
            }
            pos = part_end;
        }
        if saved.bytes.is_empty() {
            None
        } else {
            Some(saved)
        }
    }
}

impl ScatterGather for Reassembly<'_> {
    fn lengths(&self) -> (usize, usize) {
        (self.available(), self.saved_len)
    }

    fn fetch(&self, length: usize) -> Cow<'_, [u8]> {
        let length = length.min(self.available());
        match self.parts.first() {
            None => Cow::Borrowed(&[]),
            Some(first) if first.bytes.len() >= length => Cow::Borrowed(&first.bytes[..length]),
            Some(_) => {
                let mut out = Vec::with_capacity(length);
                for part in &self.parts {
                    let want = length - out.len();
                    if want == 0 {
                        break;
                    }
                    out.extend_from_slice(&part.bytes[..want.min(part.bytes.len())]);
                }
                Cow::Owned(out)
            }
        }
    }

    fn keep_from(&mut self, offset: usize) {
        self.keep = Some(offset);
    }

    fn capture_info(&self, offset: usize) -> CaptureInfo {
        let mut pos = 0usize;
        for part in &self.parts {
            pos += part.bytes.len();
            if offset < pos {
                return part.capture;
            }
        }
        self.parts.last().map(|p| p.capture).unwrap_or_default()
    }

    fn info(&self) -> ChunkInfo {
        self.info
    }

    fn stats(&self) -> AssemblyStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ci(ts: u64) -> CaptureInfo {
        CaptureInfo {
            timestamp_us: ts,
            ..Default::default()
        }
    }

    fn info() -> ChunkInfo {
        ChunkInfo {
            direction: Direction::ClientToServer,
            start: false,
            end: false,
            skip: Skip::None,
        }
    }

    #[test]
    fn test_fetch_across_parts() {
        let saved = Saved::default();
        let mut view = Reassembly::new(&saved, info());
        view.push(b"hello ", ci(1));
        view.push(b"world", ci(2));

        assert_eq!(view.lengths(), (11, 0));
        assert!(matches!(view.fetch(3), Cow::Borrowed(b"hel")));
        assert_eq!(&*view.fetch(100), b"hello world");
        assert_eq!(view.capture_info(5).timestamp_us, 1);
        assert_eq!(view.capture_info(6).timestamp_us, 2);
    }

    #[test]
    fn test_keep_from_carries_bytes_and_captures() {
        let saved = Saved::default();
        let mut view = Reassembly::new(&saved, info());
        view.push(b"abc", ci(1));
        view.push(b"def", ci(2));
        view.keep_from(2);

        let kept = view.take_kept().unwrap();
        assert_eq!(kept.bytes, b"cdef");
        assert_eq!(kept.marks, vec![(0, ci(1)), (1, ci(2))]);

        let next = Reassembly::new(&kept, info());
        assert_eq!(next.lengths(), (4, 4));
        assert_eq!(next.capture_info(0).timestamp_us, 1);
        assert_eq!(next.capture_info(2).timestamp_us, 2);
    }

    #[test]
    fn test_skip_merge() {
        assert_eq!(Skip::None.merge(Skip::Bytes(3)), Skip::Bytes(3));
        assert_eq!(Skip::Bytes(2).merge(Skip::Bytes(3)), Skip::Bytes(5));
        assert_eq!(Skip::Bytes(2).merge(Skip::Unknown), Skip::Unknown);
    }
}
