//! Entry point of the reassembly engine.

use std::sync::Arc;

use serde::Deserialize;

use super::page::PageCache;
use super::pool::{CloseReason, StreamPool};
use super::{FlowIdentity, Segment};

/// Default per-connection ceiling on out-of-order bytes.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    /// Out-of-order bytes a connection may hold across both directions.
    pub max_buffered_bytes_per_flow: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes_per_flow: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

/// What happened to a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssembleOutcome {
    /// Merged into its stream.
    Assembled,
    /// The consumer declined the segment.
    Rejected,
    /// No live connection, and the segment carries nothing to open one
    /// (the last ACK of a close, a late RST or FIN).
    Untracked,
    /// The segment ended the connection.
    Closed(CloseReason),
}

/// Routes segments to their streams.
pub struct Assembler {
    pool: Arc<StreamPool>,
    cache: Arc<PageCache>,
    config: AssemblerConfig,
}

impl Assembler {
    pub fn new(pool: Arc<StreamPool>, cache: Arc<PageCache>, config: AssemblerConfig) -> Self {
        Self { pool, cache, config }
    }

    pub fn pool(&self) -> &Arc<StreamPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Merge one segment travelling along `flow`.
    pub fn assemble(&self, flow: &FlowIdentity, segment: &Segment) -> AssembleOutcome {
        // a connection first seen through its SYN+ACK belongs to the receiver
        let oriented = if segment.flags.syn() && segment.flags.ack() {
            flow.reverse()
        } else {
            *flow
        };
        let pair = match self.pool.get(&oriented) {
            Some(pair) => pair,
            None if opens_connection(segment) => self.pool.get_or_create(&oriented, &segment.capture).0,
            None => {
                tracing::trace!(flow = %flow, flags = %segment.flags, "segment for unknown connection");
                return AssembleOutcome::Untracked;
            }
        };

        let closed = {
            let mut pair = pair.lock();
            if pair.is_completed() {
                return AssembleOutcome::Rejected;
            }
            pair.touch(segment.capture.timestamp_us);
            let direction = pair.direction_of(flow);

            if !pair.consumer_mut().accept(segment, direction) {
                return AssembleOutcome::Rejected;
            }

            if segment.flags.rst() {
                pair.complete(CloseReason::Reset, &self.cache);
                Some(CloseReason::Reset)
            } else {
                let ceiling = self.config.max_buffered_bytes_per_flow;
                let limit = ceiling.saturating_sub(pair.buffered_bytes())
                    + match direction {
                        super::Direction::ClientToServer => pair.client.pending_bytes(),
                        super::Direction::ServerToClient => pair.server.pending_bytes(),
                    };
                let (half, consumer) = pair.half_and_consumer(direction);
                half.assemble(segment, limit, &self.cache, consumer);

                if pair.both_closed() {
                    pair.complete(CloseReason::Finished, &self.cache);
                    Some(CloseReason::Finished)
                } else {
                    None
                }
            }
        };

        match closed {
            Some(reason) => {
                self.pool.remove(flow);
                AssembleOutcome::Closed(reason)
            }
            None => AssembleOutcome::Assembled,
        }
    }

    /// Force-complete connections idle since before `cutoff_us`.
    pub fn flush_older_than(&self, cutoff_us: u64) -> usize {
        let idle = self.pool.take_idle(cutoff_us);
        let count = idle.len();
        for pair in idle {
            pair.lock().complete(CloseReason::Idle, &self.cache);
        }
        if count > 0 {
            tracing::debug!(count, cutoff_us, "flushed idle connections");
        }
        count
    }

    /// Complete every remaining connection.
    pub fn flush_all(&self) -> usize {
        let all = self.pool.take_all();
        let count = all.len();
        for pair in all {
            pair.lock().complete(CloseReason::Shutdown, &self.cache);
        }
        tracing::debug!(count, "flushed all connections");
        count
    }
}

/// Only a SYN or data can start tracking a connection.
fn opens_connection(segment: &Segment) -> bool {
    segment.flags.syn() || !segment.payload.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureInfo;
    use crate::reassembly::pool::{CompletionReport, StreamConsumer, StreamFactory};
    use crate::reassembly::{Direction, ScatterGather, Sequence, TcpFlags, TcpFsm};
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};

    #[derive(Default)]
    struct Shared {
        client: Vec<u8>,
        server: Vec<u8>,
        reports: Vec<CompletionReport>,
    }

    struct Recorder {
        fsm: TcpFsm,
        shared: Arc<Mutex<Shared>>,
    }

    impl StreamConsumer for Recorder {
        fn accept(&mut self, segment: &Segment, _direction: Direction) -> bool {
            self.fsm.validate(segment.flags);
            true
        }

        fn reassembled(&mut self, sg: &mut dyn ScatterGather) {
            let (len, _) = sg.lengths();
            let bytes = sg.fetch(len).into_owned();
            let mut shared = self.shared.lock();
            if sg.info().direction.is_client() {
                shared.client.extend(bytes);
            } else {
                shared.server.extend(bytes);
            }
        }

        fn reassembly_complete(&mut self, report: CompletionReport) {
            self.shared.lock().reports.push(report);
        }
    }

    struct RecorderFactory {
        shared: Arc<Mutex<Shared>>,
    }

    impl StreamFactory for RecorderFactory {
        fn new_stream(&self, _flow: &FlowIdentity, _capture: &CaptureInfo) -> Box<dyn StreamConsumer> {
            Box::new(Recorder {
                fsm: TcpFsm::new(),
                shared: self.shared.clone(),
            })
        }
    }

    fn setup(max: usize) -> (Assembler, Arc<Mutex<Shared>>) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let pool = Arc::new(StreamPool::new(Arc::new(RecorderFactory {
            shared: shared.clone(),
        })));
        let assembler = Assembler::new(
            pool,
            Arc::new(PageCache::default()),
            AssemblerConfig {
                max_buffered_bytes_per_flow: max,
            },
        );
        (assembler, shared)
    }

    fn client() -> FlowIdentity {
        FlowIdentity::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            40000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
        )
    }

    fn seg(seq: u32, flags: TcpFlags, payload: &[u8], ts: u64) -> Segment {
        Segment {
            seq: Sequence(seq),
            ack: Sequence(0),
            flags,
            payload: payload.to_vec(),
            capture: CaptureInfo {
                timestamp_us: ts,
                ..Default::default()
            },
        }
    }

    const SYN: TcpFlags = TcpFlags::SYN;
    const ACK: TcpFlags = TcpFlags::ACK;
    const FIN: TcpFlags = TcpFlags::FIN;

    #[test]
    fn test_full_connection_completes_and_is_removed() {
        let (asm, shared) = setup(DEFAULT_MAX_BUFFERED_BYTES);
        let c = client();
        let s = c.reverse();
        asm.assemble(&c, &seg(100, SYN, b"", 1));
        asm.assemble(&s, &seg(900, SYN | ACK, b"", 2));
        asm.assemble(&c, &seg(101, ACK, b"GET / HTTP/1.1\r\n\r\n", 3));
        asm.assemble(&s, &seg(901, ACK, b"HTTP/1.1 200 OK\r\n\r\n", 4));
        asm.assemble(&c, &seg(119, FIN | ACK, b"", 5));
        let outcome = asm.assemble(&s, &seg(920, FIN | ACK, b"", 6));

        assert_eq!(outcome, AssembleOutcome::Closed(CloseReason::Finished));
        assert!(asm.pool().is_empty());
        let shared = shared.lock();
        assert_eq!(shared.client, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(shared.server, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(shared.reports.len(), 1);
        assert_eq!(shared.reports[0].reason, CloseReason::Finished);
    }

    #[test]
    fn test_segments_after_close_do_not_reopen() {
        let (asm, shared) = setup(DEFAULT_MAX_BUFFERED_BYTES);
        let c = client();
        let s = c.reverse();
        asm.assemble(&c, &seg(100, SYN, b"", 1));
        asm.assemble(&s, &seg(900, SYN | ACK, b"", 2));
        asm.assemble(&c, &seg(101, ACK, b"ping", 3));
        asm.assemble(&c, &seg(105, FIN | ACK, b"", 4));
        asm.assemble(&s, &seg(901, FIN | ACK, b"", 5));

        // closing ACK, a retransmitted FIN and a late RST
        assert_eq!(asm.assemble(&c, &seg(106, ACK, b"", 6)), AssembleOutcome::Untracked);
        assert_eq!(asm.assemble(&s, &seg(901, FIN | ACK, b"", 7)), AssembleOutcome::Untracked);
        assert_eq!(asm.assemble(&c, &seg(106, TcpFlags::RST, b"", 8)), AssembleOutcome::Untracked);
        assert!(asm.pool().is_empty());
        assert_eq!(asm.flush_all(), 0);
        assert_eq!(shared.lock().reports.len(), 1);
    }

    #[test]
    fn test_data_without_handshake_opens_connection() {
        let (asm, shared) = setup(DEFAULT_MAX_BUFFERED_BYTES);
        assert_eq!(asm.assemble(&client(), &seg(7, ACK, b"", 1)), AssembleOutcome::Untracked);
        assert!(asm.pool().is_empty());
        assert_eq!(asm.assemble(&client(), &seg(7, ACK, b"mid", 2)), AssembleOutcome::Assembled);
        assert_eq!(asm.pool().len(), 1);
        assert_eq!(shared.lock().client, b"mid");
    }

    #[test]
    fn test_syn_ack_first_orients_flow_to_receiver() {
        let (asm, _shared) = setup(DEFAULT_MAX_BUFFERED_BYTES);
        let server_side = client().reverse();
        asm.assemble(&server_side, &seg(900, SYN | ACK, b"", 1));
        let pair = asm.pool().get(&client()).unwrap();
        assert_eq!(pair.lock().direction_of(&client()), Direction::ClientToServer);
    }

    #[test]
    fn test_rst_tears_down_with_loss_report() {
        let (asm, shared) = setup(DEFAULT_MAX_BUFFERED_BYTES);
        let c = client();
        asm.assemble(&c, &seg(1, ACK, b"ab", 1));
        asm.assemble(&c, &seg(10, ACK, b"lost", 2));
        let outcome = asm.assemble(&c.reverse(), &seg(50, TcpFlags::RST, b"", 3));

        assert_eq!(outcome, AssembleOutcome::Closed(CloseReason::Reset));
        assert!(asm.pool().is_empty());
        let shared = shared.lock();
        assert_eq!(shared.reports[0].client.buffered_bytes, 4);
        assert_eq!(shared.client, b"ab");
    }

    #[test]
    fn test_idle_sweep_and_shutdown_flush() {
        let (asm, shared) = setup(DEFAULT_MAX_BUFFERED_BYTES);
        asm.assemble(&client(), &seg(1, ACK, b"x", 1_000));
        let other = FlowIdentity::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
            40001,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
        );
        asm.assemble(&other, &seg(1, ACK, b"y", 9_000));

        assert_eq!(asm.flush_older_than(5_000), 1);
        assert_eq!(asm.pool().len(), 1);
        assert_eq!(asm.flush_all(), 1);
        assert!(asm.pool().is_empty());

        let reasons: Vec<_> = shared.lock().reports.iter().map(|r| r.reason).collect();
        assert_eq!(reasons, vec![CloseReason::Idle, CloseReason::Shutdown]);
    }

    #[test]
    fn test_ceiling_is_shared_by_both_directions() {
        let (asm, shared) = setup(6);
        let c = client();
        asm.assemble(&c, &seg(1, ACK, b"a", 1));
        asm.assemble(&c.reverse(), &seg(1, ACK, b"b", 1));
        asm.assemble(&c, &seg(5, ACK, b"eeee", 2));
        // server side has 2 bytes of headroom and nothing of its own to flush
        asm.assemble(&c.reverse(), &seg(5, ACK, b"ffff", 3));
        let pair = asm.pool().get(&c).unwrap();
        let pair = pair.lock();
        assert_eq!(pair.client.pending_bytes(), 4);
        assert_eq!(pair.server.pending_bytes(), 0);
        assert_eq!(pair.server.stats().dropped_packets, 1);
        assert_eq!(shared.lock().server, b"b");
    }
}
