//! Per-direction reassembly state.
//!
//! A [`HalfStream`] tracks the next expected sequence number of one
//! direction, buffers segments that arrive ahead of it as pages, trims
//! retransmitted bytes, and delivers every contiguous run to the consumer as
//! soon as it becomes available.

use std::collections::VecDeque;
use std::mem;

use serde::Serialize;

use super::page::{Page, PageCache};
use super::pool::StreamConsumer;
use super::scatter::{AssemblyStats, ChunkInfo, Reassembly, Saved, Skip};
use super::sequence::Sequence;
use super::{Direction, Segment};
use crate::capture::CaptureInfo;

/// Cumulative counters for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub packets: u64,
    pub deliveries: u64,
    pub delivered_bytes: u64,
    pub queued_bytes: u64,
    pub queued_packets: u64,
    pub overlap_bytes: u64,
    pub overlap_packets: u64,
    /// Bytes declared missing by a forced flush.
    pub skipped_bytes: u64,
    /// Out-of-order segments refused by the buffering ceiling.
    pub dropped_packets: u64,
    /// Bytes of those segments.
    pub dropped_bytes: u64,
    /// Bytes discarded on resynchronization or teardown: buffered pages plus
    /// refused segments that were never retransmitted or skipped over.
    pub lost_bytes: u64,
    pub resyncs: u64,
}

/// Bytes still buffered when a direction was torn down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LossReport {
    pub buffered_bytes: u64,
    pub buffered_packets: u64,
    /// Total bytes this direction lost over its lifetime, including the above.
    pub total_lost_bytes: u64,
    pub stats: StreamStats,
}

/// Sequence range of a segment refused by the buffering ceiling.
#[derive(Debug, Clone, Copy)]
struct Refused {
    seq: Sequence,
    end: Sequence,
}

/// Reassembly state of one direction of a connection.
#[derive(Debug)]
pub struct HalfStream {
    direction: Direction,
    next_seq: Option<Sequence>,
    pending: VecDeque<Page>,
    pending_bytes: usize,
    /// Refused ranges still ahead of `next_seq`.
    refused: Vec<Refused>,
    saved: Saved,
    start_pending: bool,
    skip_pending: Skip,
    closed: bool,
    stats: StreamStats,
    since_delivery: AssemblyStats,
}

impl HalfStream {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            next_seq: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
            refused: Vec::new(),
            saved: Saved::default(),
            start_pending: false,
            skip_pending: Skip::None,
            closed: false,
            stats: StreamStats::default(),
            since_delivery: AssemblyStats::default(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn next_seq(&self) -> Option<Sequence> {
        self.next_seq
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn pending_packets(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Merge one segment into the stream. `limit` is the number of bytes this
    /// direction may keep buffered out of order.
    pub fn assemble(
        &mut self,
        segment: &Segment,
        limit: usize,
        cache: &PageCache,
        consumer: &mut dyn StreamConsumer,
    ) {
        self.stats.packets += 1;
        let syn = segment.flags.syn();
        let fin = segment.flags.fin();
        let data_seq = if syn { segment.seq.add(1) } else { segment.seq };

        if self.closed {
            if !segment.payload.is_empty() {
                self.note_overlap(segment.payload.len());
            }
            return;
        }

        let next = match self.next_seq {
            Some(next) => next,
            None => {
                if segment.payload.is_empty() && !syn && !fin {
                    // bare ACK before any data: nothing to anchor on yet
                    return;
                }
                self.start_pending = true;
                self.next_seq = Some(data_seq);
                data_seq
            }
        };

        if segment.payload.is_empty() && !fin {
            return;
        }

        if !data_seq.within_window(next, segment.payload.len()) {
            self.resync(data_seq, cache);
        }

        self.place(
            data_seq,
            &segment.payload,
            segment.capture,
            fin,
            limit,
            true,
            cache,
            consumer,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn place(
        &mut self,
        data_seq: Sequence,
        payload: &[u8],
        capture: CaptureInfo,
        fin: bool,
        limit: usize,
        may_flush: bool,
        cache: &PageCache,
        consumer: &mut dyn StreamConsumer,
    ) {
        let Some(next) = self.next_seq else {
            return;
        };
        let diff = data_seq.difference(next);

        if diff > 0 {
            self.buffer(data_seq, payload, capture, fin, limit, may_flush, cache, consumer);
            return;
        }

        let mut payload = payload;
        if diff < 0 {
            let overlap = (-(diff as i64)) as usize;
            if overlap > payload.len() || (overlap == payload.len() && !fin) {
                self.note_overlap(payload.len());
                return;
            }
            if overlap > 0 {
                self.note_overlap(overlap);
            }
            payload = &payload[overlap..];
        }

        self.deliver(Some((payload, capture, fin)), cache, consumer);
    }

    #[allow(clippy::too_many_arguments)]
    fn buffer(
        &mut self,
        data_seq: Sequence,
        payload: &[u8],
        capture: CaptureInfo,
        fin: bool,
        limit: usize,
        may_flush: bool,
        cache: &PageCache,
        consumer: &mut dyn StreamConsumer,
    ) {
        let len = payload.len();
        let duplicate = self
            .pending
            .iter()
            .any(|p| p.seq == data_seq && p.len() >= len && (p.end || !fin));
        if duplicate {
            self.note_overlap(len);
            return;
        }

        if self.pending_bytes + len > limit {
            if may_flush && !self.pending.is_empty() {
                self.force_flush(cache, consumer);
                self.place(data_seq, payload, capture, fin, limit, false, cache, consumer);
                return;
            }
            self.stats.dropped_packets += 1;
            self.stats.dropped_bytes += len as u64;
            self.refused.push(Refused {
                seq: data_seq,
                end: data_seq.add(len),
            });
            tracing::debug!(
                direction = %self.direction,
                seq = %data_seq,
                len,
                pending_bytes = self.pending_bytes,
                "buffering ceiling reached, dropping out-of-order segment"
            );
            return;
        }

        let mut page = cache.acquire_with(data_seq, payload, capture);
        page.end = fin;
        let idx = self
            .pending
            .iter()
            .position(|p| data_seq.less_than(p.seq))
            .unwrap_or(self.pending.len());
        self.pending.insert(idx, page);
        self.pending_bytes += len;

        self.stats.queued_bytes += len as u64;
        self.stats.queued_packets += 1;
        self.since_delivery.queued_bytes += len;
        self.since_delivery.queued_packets += 1;
        tracing::trace!(direction = %self.direction, seq = %data_seq, len, "buffered out-of-order segment");
    }

    /// Give up on the gap in front of the first buffered page and deliver
    /// whatever becomes contiguous.
    fn force_flush(&mut self, cache: &PageCache, consumer: &mut dyn StreamConsumer) {
        let (Some(next), Some(first)) = (self.next_seq, self.pending.front()) else {
            return;
        };
        let gap = first.seq.difference(next).max(0) as usize;
        let first_seq = first.seq;
        self.skip_pending = self.skip_pending.merge(Skip::Bytes(gap));
        self.stats.skipped_bytes += gap as u64;
        self.next_seq = Some(first_seq);
        self.settle_refused();
        tracing::debug!(direction = %self.direction, gap, "forced flush over missing bytes");
        self.deliver(None, cache, consumer);
    }

    /// Drop all buffered state and restart tracking at `seq`.
    fn resync(&mut self, seq: Sequence, cache: &PageCache) {
        let lost = self.pending_bytes + self.unsettled_refused_bytes();
        for page in self.pending.drain(..) {
            cache.release(page);
        }
        self.pending_bytes = 0;
        self.refused.clear();
        self.stats.lost_bytes += lost as u64;
        self.stats.resyncs += 1;
        self.skip_pending = Skip::Unknown;
        tracing::warn!(
            direction = %self.direction,
            from = ?self.next_seq,
            to = %seq,
            lost,
            "sequence desynchronized, resetting stream"
        );
        self.next_seq = Some(seq);
    }

    fn deliver(
        &mut self,
        live: Option<(&[u8], CaptureInfo, bool)>,
        cache: &PageCache,
        consumer: &mut dyn StreamConsumer,
    ) {
        let Some(mut next) = self.next_seq else {
            return;
        };
        let mut end = false;
        if let Some((bytes, _, fin)) = live {
            next = next.add(bytes.len());
            end = fin;
        }

        // (page, bytes at its front already delivered)
        let mut consumed: Vec<(Page, usize)> = Vec::new();
        while !end {
            let Some(page) = self.pending.pop_front() else {
                break;
            };
            let diff = page.seq.difference(next);
            if diff > 0 {
                self.pending.push_front(page);
                break;
            }
            self.pending_bytes -= page.len();
            let overlap = (-(diff as i64)) as usize;
            if overlap > page.len() || (overlap == page.len() && !page.end) {
                self.note_overlap(page.len());
                cache.release(page);
                continue;
            }
            if overlap > 0 {
                self.note_overlap(overlap);
            }
            next = page.end_seq();
            end = page.end;
            consumed.push((page, overlap));
        }

        let saved = mem::take(&mut self.saved);
        let info = ChunkInfo {
            direction: self.direction,
            start: mem::take(&mut self.start_pending),
            end,
            skip: mem::take(&mut self.skip_pending),
        };
        let stats = mem::take(&mut self.since_delivery);

        let (delivered, kept) = {
            let mut view = Reassembly::new(&saved, info);
            let mut delivered = 0usize;
            if let Some((bytes, capture, _)) = live {
                view.push(bytes, capture);
                delivered += bytes.len();
            }
            for (page, overlap) in &consumed {
                view.push(&page.bytes[*overlap..], page.capture);
                delivered += page.len() - overlap;
            }
            view.set_stats(stats);
            consumer.reassembled(&mut view);
            (delivered, view.take_kept())
        };

        self.saved = kept.unwrap_or_default();
        self.stats.deliveries += 1;
        self.stats.delivered_bytes += delivered as u64;
        for (page, _) in consumed {
            cache.release(page);
        }

        if end {
            self.next_seq = Some(next.add(1));
            self.closed = true;
        } else {
            self.next_seq = Some(next);
        }
        self.settle_refused();
    }

    /// Forget refused ranges the stream has moved past. Their bytes were
    /// either delivered by a retransmission or covered by a skip.
    fn settle_refused(&mut self) {
        let Some(next) = self.next_seq else {
            return;
        };
        self.refused.retain_mut(|r| {
            if !next.less_than(r.end) {
                return false;
            }
            if r.seq.less_than(next) {
                r.seq = next;
            }
            true
        });
    }

    /// Refused bytes not delivered, skipped, or held by a buffered page.
    fn unsettled_refused_bytes(&self) -> usize {
        self.refused
            .iter()
            .map(|r| {
                let len = i64::from(r.end.difference(r.seq));
                let mut cursor = 0i64;
                let mut uncovered = 0i64;
                for page in &self.pending {
                    let start = i64::from(page.seq.difference(r.seq));
                    let end = i64::from(page.end_seq().difference(r.seq));
                    if end <= cursor {
                        continue;
                    }
                    if start >= len {
                        break;
                    }
                    uncovered += (start - cursor).max(0);
                    cursor = cursor.max(end);
                }
                uncovered += (len - cursor).max(0);
                uncovered as usize
            })
            .sum()
    }

    fn note_overlap(&mut self, bytes: usize) {
        self.stats.overlap_bytes += bytes as u64;
        self.stats.overlap_packets += 1;
        self.since_delivery.overlap_bytes += bytes;
        self.since_delivery.overlap_packets += 1;
    }

    /// Tear the direction down, releasing buffered pages and reporting them
    /// as lost.
    pub fn complete(&mut self, cache: &PageCache) -> LossReport {
        let buffered_bytes = self.pending_bytes as u64;
        let buffered_packets = self.pending.len() as u64;
        let refused = self.unsettled_refused_bytes() as u64;
        for page in self.pending.drain(..) {
            cache.release(page);
        }
        self.pending_bytes = 0;
        self.refused.clear();
        self.stats.lost_bytes += buffered_bytes + refused;
        self.closed = true;
        LossReport {
            buffered_bytes,
            buffered_packets,
            total_lost_bytes: self.stats.lost_bytes + self.stats.skipped_bytes,
            stats: self.stats,
        }
    }
}
