//! Concurrency-safe registry of live connections.
//!
//! The pool maps an orientation-independent [`FlowKey`] to the
//! [`StreamPair`] holding both directions of a connection plus the consumer
//! that receives its data. At most one pair exists per live key; removal is
//! idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use super::page::PageCache;
use super::scatter::ScatterGather;
use super::stream::{HalfStream, LossReport};
use super::{Direction, FlowIdentity, FlowKey, Segment};
use crate::capture::CaptureInfo;

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Both directions delivered their FIN.
    Finished,
    Reset,
    /// No packet within the idle timeout.
    Idle,
    /// End of input.
    Shutdown,
}

/// Final accounting handed to the consumer on teardown.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CompletionReport {
    pub reason: CloseReason,
    pub client: LossReport,
    pub server: LossReport,
}

/// Receiver of one connection's reassembled data.
pub trait StreamConsumer: Send {
    /// Called for every segment before reassembly. Returning `false` keeps
    /// the segment away from the assembler.
    fn accept(&mut self, segment: &Segment, direction: Direction) -> bool;
    /// A contiguous run of bytes is available for one direction.
    fn reassembled(&mut self, sg: &mut dyn ScatterGather);
    /// The connection is gone; no further calls follow.
    fn reassembly_complete(&mut self, report: CompletionReport);
}

/// Creates a consumer for every new connection.
pub trait StreamFactory: Send + Sync {
    fn new_stream(&self, flow: &FlowIdentity, capture: &CaptureInfo) -> Box<dyn StreamConsumer>;
}

/// Both directions of a connection together with their consumer.
pub struct StreamPair {
    /// Flow in client orientation.
    flow: FlowIdentity,
    pub client: HalfStream,
    pub server: HalfStream,
    consumer: Box<dyn StreamConsumer>,
    first_seen_us: u64,
    last_seen_us: u64,
    completed: bool,
}

impl StreamPair {
    fn new(flow: FlowIdentity, capture: &CaptureInfo, consumer: Box<dyn StreamConsumer>) -> Self {
        Self {
            flow,
            client: HalfStream::new(Direction::ClientToServer),
            server: HalfStream::new(Direction::ServerToClient),
            consumer,
            first_seen_us: capture.timestamp_us,
            last_seen_us: capture.timestamp_us,
            completed: false,
        }
    }

    pub fn flow(&self) -> &FlowIdentity {
        &self.flow
    }

    pub fn first_seen_us(&self) -> u64 {
        self.first_seen_us
    }

    pub fn last_seen_us(&self) -> u64 {
        self.last_seen_us
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Direction of a packet travelling along `flow`.
    pub fn direction_of(&self, flow: &FlowIdentity) -> Direction {
        if flow.network.src == self.flow.network.src && flow.transport.src == self.flow.transport.src {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }

    pub(crate) fn touch(&mut self, timestamp_us: u64) {
        self.last_seen_us = self.last_seen_us.max(timestamp_us);
    }

    pub(crate) fn buffered_bytes(&self) -> usize {
        self.client.pending_bytes() + self.server.pending_bytes()
    }

    /// Split borrow of one direction and the consumer.
    pub(crate) fn half_and_consumer(
        &mut self,
        direction: Direction,
    ) -> (&mut HalfStream, &mut dyn StreamConsumer) {
        let half = match direction {
            Direction::ClientToServer => &mut self.client,
            Direction::ServerToClient => &mut self.server,
        };
        (half, self.consumer.as_mut())
    }

    pub(crate) fn consumer_mut(&mut self) -> &mut dyn StreamConsumer {
        self.consumer.as_mut()
    }

    pub(crate) fn both_closed(&self) -> bool {
        self.client.is_closed() && self.server.is_closed()
    }

    /// Tear both directions down and notify the consumer once.
    pub(crate) fn complete(&mut self, reason: CloseReason, cache: &PageCache) -> Option<CompletionReport> {
        if self.completed {
            return None;
        }
        self.completed = true;
        let report = CompletionReport {
            reason,
            client: self.client.complete(cache),
            server: self.server.complete(cache),
        };
        tracing::debug!(
            flow = %self.flow,
            reason = ?reason,
            client_lost = report.client.total_lost_bytes,
            server_lost = report.server.total_lost_bytes,
            "connection complete"
        );
        self.consumer.reassembly_complete(report);
        Some(report)
    }
}

/// Shared map of live connections.
pub struct StreamPool {
    factory: Arc<dyn StreamFactory>,
    flows: Mutex<HashMap<FlowKey, Arc<Mutex<StreamPair>>>>,
}

impl StreamPool {
    pub fn new(factory: Arc<dyn StreamFactory>) -> Self {
        Self {
            factory,
            flows: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the pair for `flow`, creating it (and its consumer) on first
    /// sight. A new pair treats `flow`'s source as the client. The boolean is
    /// true when the pair was created by this call.
    pub fn get_or_create(
        &self,
        flow: &FlowIdentity,
        capture: &CaptureInfo,
    ) -> (Arc<Mutex<StreamPair>>, bool) {
        let mut flows = self.flows.lock();
        if let Some(pair) = flows.get(&flow.key()) {
            return (pair.clone(), false);
        }
        let consumer = self.factory.new_stream(flow, capture);
        let pair = Arc::new(Mutex::new(StreamPair::new(*flow, capture, consumer)));
        flows.insert(flow.key(), pair.clone());
        tracing::debug!(flow = %flow, active = flows.len(), "new connection");
        (pair, true)
    }

    pub fn get(&self, flow: &FlowIdentity) -> Option<Arc<Mutex<StreamPair>>> {
        self.flows.lock().get(&flow.key()).cloned()
    }

    /// Forget a flow. Removing an unknown flow is a no-op.
    pub fn remove(&self, flow: &FlowIdentity) -> Option<Arc<Mutex<StreamPair>>> {
        self.flows.lock().remove(&flow.key())
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.lock().is_empty()
    }

    /// Remove and return every pair whose last packet is older than `cutoff_us`.
    pub(crate) fn take_idle(&self, cutoff_us: u64) -> Vec<Arc<Mutex<StreamPair>>> {
        let mut flows = self.flows.lock();
        let idle: Vec<FlowKey> = flows
            .iter()
            .filter(|(_, pair)| pair.lock().last_seen_us() < cutoff_us)
            .map(|(key, _)| *key)
            .collect();
        idle.iter().filter_map(|key| flows.remove(key)).collect()
    }

    /// Remove and return every pair.
    pub(crate) fn take_all(&self) -> Vec<Arc<Mutex<StreamPair>>> {
        self.flows.lock().drain().map(|(_, pair)| pair).collect()
    }
}
