//! Per-connection processing.
//!
//! Every new flow gets a [`TcpConnection`] consumer plus one reader task per
//! direction. The consumer runs on the ingest thread inside the stream pool
//! and hands delivered bytes to the readers over bounded channels, so a slow
//! reader holds up ingest instead of growing a queue. Readers collect their
//! direction and feed it to the stream decoders once the connection is gone.
//!
//! ```text
//! Assembler ─► TcpConnection ─► mpsc ─► client reader ─► stream decoders
//!                           └─► mpsc ─► server reader ─┘
//! ```
//!
//! The consumer side uses `blocking_send` and must not be driven from inside
//! an async task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::capture::CaptureInfo;
use crate::config::ConnectionConfig;
use crate::decoder::{dispatch, DecoderInput, StreamDecoders, StreamPayload};
use crate::reassembly::{
    CloseReason, CompletionReport, Direction, FlowIdentity, FsmSummary, LossReport, ScatterGather, Segment, Skip,
    StreamConsumer, StreamFactory, TcpFsm, Validation,
};

/// Message from a connection to one of its readers.
#[derive(Debug)]
enum StreamEvent {
    Data {
        bytes: Vec<u8>,
        skip: Skip,
        capture: CaptureInfo,
    },
    End {
        reason: CloseReason,
        loss: LossReport,
        fsm: FsmSummary,
    },
}

/// What one reader saw of its direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaderSummary {
    pub bytes: u64,
    pub truncated: bool,
    /// The reader ended without a completion report.
    pub orphaned: bool,
}

/// Totals over every reader of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FactorySummary {
    pub flows: u64,
    pub readers: u64,
    pub bytes: u64,
    pub truncated_streams: u64,
    pub orphaned_streams: u64,
    /// Reader tasks that panicked or were cancelled.
    pub failed_readers: u64,
}

/// Fields guarded by the factory lock.
#[derive(Default)]
struct FactoryState {
    readers: JoinSet<ReaderSummary>,
    flows_started: u64,
}

/// Creates a [`TcpConnection`] and its two readers for every new flow.
pub struct ConnectionFactory {
    runtime: Handle,
    decoders: StreamDecoders,
    config: ConnectionConfig,
    state: Mutex<FactoryState>,
    num_active: Arc<AtomicU64>,
}

impl ConnectionFactory {
    pub fn new(runtime: Handle, decoders: StreamDecoders, config: ConnectionConfig) -> Self {
        Self {
            runtime,
            decoders,
            config,
            state: Mutex::new(FactoryState::default()),
            num_active: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Readers that have not finished yet.
    pub fn num_active(&self) -> u64 {
        self.num_active.load(Ordering::Relaxed)
    }

    pub fn flows_started(&self) -> u64 {
        self.state.lock().flows_started
    }

    /// Wait for every reader spawned so far.
    ///
    /// Readers only finish once their connection completed, so every flow
    /// must have been flushed from the pool before this is awaited.
    pub async fn wait_all(&self) -> FactorySummary {
        let (mut readers, flows) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.readers), state.flows_started)
        };
        tracing::info!(flows, active = self.num_active(), "waiting for stream readers");

        let mut summary = FactorySummary {
            flows,
            ..Default::default()
        };
        while let Some(joined) = readers.join_next().await {
            match joined {
                Ok(reader) => {
                    summary.readers += 1;
                    summary.bytes += reader.bytes;
                    summary.truncated_streams += u64::from(reader.truncated);
                    summary.orphaned_streams += u64::from(reader.orphaned);
                }
                Err(e) => {
                    summary.failed_readers += 1;
                    tracing::error!(error = %e, "stream reader failed");
                }
            }
        }
        summary
    }

    fn spawn_reader(
        &self,
        readers: &mut JoinSet<ReaderSummary>,
        flow: FlowIdentity,
        direction: Direction,
        first_seen_us: u64,
    ) -> mpsc::Sender<StreamEvent> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let reader = StreamReader {
            flow,
            direction,
            first_seen_us,
            max_capture: self.config.max_stream_capture_bytes,
            decoders: self.decoders.clone(),
            num_active: self.num_active.clone(),
        };
        self.num_active.fetch_add(1, Ordering::Relaxed);
        readers.spawn_on(reader.run(rx), &self.runtime);
        tx
    }
}

impl StreamFactory for ConnectionFactory {
    fn new_stream(&self, flow: &FlowIdentity, capture: &CaptureInfo) -> Box<dyn StreamConsumer> {
        let mut state = self.state.lock();
        state.flows_started += 1;
        let client = self.spawn_reader(&mut state.readers, *flow, Direction::ClientToServer, capture.timestamp_us);
        let server = self.spawn_reader(
            &mut state.readers,
            flow.reverse(),
            Direction::ServerToClient,
            capture.timestamp_us,
        );
        tracing::trace!(flow = %flow, active = self.num_active(), "stream readers started");

        Box::new(TcpConnection {
            flow: *flow,
            fsm: TcpFsm::new(),
            client: Some(client),
            server: Some(server),
        })
    }
}

/// Consumer of one connection inside the stream pool.
pub struct TcpConnection {
    flow: FlowIdentity,
    fsm: TcpFsm,
    client: Option<mpsc::Sender<StreamEvent>>,
    server: Option<mpsc::Sender<StreamEvent>>,
}

impl TcpConnection {
    fn sender(&mut self, direction: Direction) -> &mut Option<mpsc::Sender<StreamEvent>> {
        match direction {
            Direction::ClientToServer => &mut self.client,
            Direction::ServerToClient => &mut self.server,
        }
    }

    fn send(&mut self, direction: Direction, event: StreamEvent) {
        let flow = self.flow;
        let slot = self.sender(direction);
        let Some(tx) = slot.as_ref() else {
            return;
        };
        if tx.blocking_send(event).is_err() {
            tracing::debug!(flow = %flow, direction = %direction, "stream reader gone, dropping its data");
            *slot = None;
        }
    }
}

impl StreamConsumer for TcpConnection {
    fn accept(&mut self, segment: &Segment, direction: Direction) -> bool {
        // anomalies are counted, never fatal
        match self.fsm.validate(segment.flags) {
            Validation::Violation => {
                tracing::debug!(
                    flow = %self.flow,
                    direction = %direction,
                    flags = %segment.flags,
                    state = %self.fsm.state(),
                    "unexpected flags for connection state"
                );
            }
            Validation::Retransmission => {
                tracing::trace!(flow = %self.flow, flags = %segment.flags, "retransmitted control segment");
            }
            Validation::Accept => {}
        }
        true
    }

    fn reassembled(&mut self, sg: &mut dyn ScatterGather) {
        let (available, saved) = sg.lengths();
        let info = sg.info();
        if available <= saved && info.skip.is_none() {
            return;
        }
        let bytes = sg.fetch(available).get(saved..).map(<[u8]>::to_vec).unwrap_or_default();
        let capture = sg.capture_info(saved);
        self.send(
            info.direction,
            StreamEvent::Data {
                bytes,
                skip: info.skip,
                capture,
            },
        );
    }

    fn reassembly_complete(&mut self, report: CompletionReport) {
        let fsm = self.fsm.summary();
        for (direction, loss) in [
            (Direction::ClientToServer, report.client),
            (Direction::ServerToClient, report.server),
        ] {
            self.send(
                direction,
                StreamEvent::End {
                    reason: report.reason,
                    loss,
                    fsm,
                },
            );
            // closing the channel lets the reader finish
            *self.sender(direction) = None;
        }
    }
}

/// Collects one direction of a connection.
struct StreamReader {
    /// Oriented from the sender of this direction.
    flow: FlowIdentity,
    direction: Direction,
    first_seen_us: u64,
    max_capture: usize,
    decoders: StreamDecoders,
    num_active: Arc<AtomicU64>,
}

impl StreamReader {
    async fn run(self, mut rx: mpsc::Receiver<StreamEvent>) -> ReaderSummary {
        let mut data = Vec::new();
        let mut total_bytes = 0u64;
        let mut skipped_bytes = 0u64;
        let mut unknown_skips = 0u64;
        let mut deliveries = 0u64;
        let mut first_data_us = None;
        let mut last_seen_us = self.first_seen_us;
        let mut end = None;

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Data { bytes, skip, capture } => {
                    match skip {
                        Skip::None => {}
                        Skip::Bytes(n) => skipped_bytes += n as u64,
                        Skip::Unknown => unknown_skips += 1,
                    }
                    if bytes.is_empty() {
                        continue;
                    }
                    deliveries += 1;
                    total_bytes += bytes.len() as u64;
                    first_data_us.get_or_insert(capture.timestamp_us);
                    last_seen_us = last_seen_us.max(capture.timestamp_us);
                    let room = self.max_capture.saturating_sub(data.len());
                    data.extend_from_slice(&bytes[..bytes.len().min(room)]);
                }
                StreamEvent::End { reason, loss, fsm } => {
                    end = Some((reason, loss, fsm));
                    break;
                }
            }
        }

        let truncated = total_bytes > data.len() as u64;
        let summary = ReaderSummary {
            bytes: total_bytes,
            truncated,
            orphaned: end.is_none(),
        };
        if unknown_skips > 0 {
            tracing::debug!(flow = %self.flow, direction = %self.direction, unknown_skips, "stream lost sync");
        }

        if total_bytes > 0 && !self.decoders.is_empty() {
            let payload = StreamPayload {
                flow: self.flow,
                direction: self.direction,
                first_seen_us: first_data_us.unwrap_or(self.first_seen_us),
                last_seen_us,
                data,
                total_bytes,
                truncated,
                skipped_bytes,
                lost_bytes: end.map_or(skipped_bytes, |(_, loss, _)| loss.total_lost_bytes.max(skipped_bytes)),
                deliveries,
                close_reason: end.map(|(reason, _, _)| reason),
                fsm: end.map(|(_, _, fsm)| fsm).unwrap_or_default(),
            };
            let decoders = self.decoders.clone();
            // writers do blocking I/O
            let decoded = tokio::task::spawn_blocking(move || {
                dispatch(&decoders, DecoderInput::Stream(&payload));
            })
            .await;
            if let Err(e) = decoded {
                tracing::error!(flow = %self.flow, direction = %self.direction, error = %e, "stream decoding failed");
            }
        }

        self.num_active.fetch_sub(1, Ordering::Relaxed);
        tracing::trace!(flow = %self.flow, direction = %self.direction, bytes = total_bytes, "stream reader done");
        summary
    }
}
