//! Decoder dispatch.
//!
//! A decoder turns one input unit (a decoded packet or a reassembled stream
//! direction) into at most one typed [`Record`]. Each selected decoder is
//! wrapped in a [`DecoderInstance`] that owns its writer and counters:
//!
//! ```text
//! unit → Decoder::transform → record counter → writer → metrics
//! ```
//!
//! Decoders are looked up by name in an explicit [`DecoderRegistry`] built by
//! the caller; there is no process-wide registration.

pub mod builtin;
pub mod record;
pub mod registry;

pub use record::{HttpRecord, Ipv4Record, Record, RecordType, StreamRecord, TcpRecord};
pub use registry::DecoderRegistry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::capture::DecodedPacket;
use crate::config::{ConfigError, DecoderConfig};
use crate::metrics::RecordMetrics;
use crate::reassembly::{CloseReason, Direction, FlowIdentity, FsmSummary};
use crate::writer::{AuditRecordWriter, RecordHeader, WriterError, WriterFactory};

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("decoder {name} failed to initialize: {reason}")]
    Init { name: String, reason: String },

    #[error("decoder {name}: writer error: {source}")]
    Write {
        name: String,
        #[source]
        source: WriterError,
    },

    #[error("decoder {name} produced a {found} record, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: RecordType,
        found: RecordType,
    },

    #[error("decoder {name} failed to shut down: {reason}")]
    Deinit { name: String, reason: String },
}

/// Which input units a decoder consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecoderKind {
    Packet,
    Stream,
}

/// One direction of a connection, collected after reassembly finished.
#[derive(Debug, Clone)]
pub struct StreamPayload {
    /// Flow oriented from the sender of `data`.
    pub flow: FlowIdentity,
    pub direction: Direction,
    pub first_seen_us: u64,
    pub last_seen_us: u64,
    /// Delivered bytes, up to the capture limit.
    pub data: Vec<u8>,
    /// Bytes delivered by reassembly, including those beyond `data`.
    pub total_bytes: u64,
    pub truncated: bool,
    /// Bytes declared missing while the stream was live.
    pub skipped_bytes: u64,
    /// Total bytes this direction lost, buffered pages at teardown included.
    pub lost_bytes: u64,
    pub deliveries: u64,
    /// `None` when the reader ended without a completion report.
    pub close_reason: Option<CloseReason>,
    pub fsm: FsmSummary,
}

/// Input handed to [`Decoder::transform`].
#[derive(Debug, Clone, Copy)]
pub enum DecoderInput<'a> {
    Packet(&'a DecodedPacket),
    Stream(&'a StreamPayload),
}

/// A named transform from input units to records of one type.
pub trait Decoder: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn kind(&self) -> DecoderKind;
    fn record_type(&self) -> RecordType;

    /// Runs once after the writer has been opened.
    fn post_init(&self) -> Result<(), String> {
        Ok(())
    }

    /// Produce a record for `input`, or `None` when it is not relevant.
    fn transform(&self, input: DecoderInput<'_>) -> Option<Record>;

    /// Runs once before the writer is closed.
    fn deinit(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Final accounting of one decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecoderSummary {
    pub name: String,
    /// Records produced by the transform.
    pub records: u64,
    /// Records the writer accepted.
    pub written: u64,
    pub bytes: u64,
    pub write_failures: u64,
}

/// A decoder bound to its writer and counters.
pub struct DecoderInstance {
    decoder: Box<dyn Decoder>,
    writer: Mutex<Option<Box<dyn AuditRecordWriter>>>,
    metrics: Option<Arc<RecordMetrics>>,
    records: AtomicU64,
    write_failures: AtomicU64,
    halted: AtomicBool,
}

impl DecoderInstance {
    pub fn new(
        decoder: Box<dyn Decoder>,
        writer: Box<dyn AuditRecordWriter>,
        metrics: Option<Arc<RecordMetrics>>,
    ) -> Self {
        Self {
            decoder,
            writer: Mutex::new(Some(writer)),
            metrics,
            records: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            halted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        self.decoder.name()
    }

    pub fn kind(&self) -> DecoderKind {
        self.decoder.kind()
    }

    pub fn record_type(&self) -> RecordType {
        self.decoder.record_type()
    }

    /// Records produced so far.
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    /// Run the transform over `input` and write the resulting record.
    ///
    /// A failed write loses that record only. A record of the wrong type
    /// halts the decoder: every later call is a no-op.
    pub fn decode(&self, input: DecoderInput<'_>) -> Result<(), DecoderError> {
        if self.is_halted() {
            return Ok(());
        }
        let Some(record) = self.decoder.transform(input) else {
            return Ok(());
        };

        let expected = self.decoder.record_type();
        if record.record_type() != expected {
            self.halted.store(true, Ordering::Relaxed);
            tracing::error!(
                decoder = self.name(),
                expected = %expected,
                found = %record.record_type(),
                "decoder produced a foreign record type, halting it"
            );
            return Err(DecoderError::TypeMismatch {
                name: self.name().to_string(),
                expected,
                found: record.record_type(),
            });
        }

        self.records.fetch_add(1, Ordering::Relaxed);

        let written = match self.writer.lock().as_mut() {
            Some(writer) => writer.write(&record),
            None => Err(WriterError::Closed(self.name().to_string())),
        };
        if let Err(source) = written {
            let failures = self.write_failures.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::error!(decoder = self.name(), failures, error = %source, "failed to write record");
            return Err(DecoderError::Write {
                name: self.name().to_string(),
                source,
            });
        }

        if let Some(metrics) = &self.metrics {
            if let Err(e) = metrics.inc(&record) {
                tracing::warn!(decoder = self.name(), error = %e, "failed to update record metrics");
            }
        }
        Ok(())
    }

    /// Run the decoder's teardown hook, then close its writer.
    pub fn destroy(&self) -> Result<DecoderSummary, DecoderError> {
        let deinit = self.decoder.deinit();
        let writer = self.writer.lock().take();
        let closed = match writer {
            Some(mut writer) => writer.close(),
            None => Err(WriterError::Closed(self.name().to_string())),
        };

        if let Err(reason) = deinit {
            return Err(DecoderError::Deinit {
                name: self.name().to_string(),
                reason,
            });
        }
        let summary = closed.map_err(|source| DecoderError::Write {
            name: self.name().to_string(),
            source,
        })?;

        Ok(DecoderSummary {
            name: self.name().to_string(),
            records: self.records(),
            written: summary.records,
            bytes: summary.bytes,
            write_failures: self.write_failures(),
        })
    }
}

/// Stream decoders shared with the connection readers.
pub type StreamDecoders = Arc<[Arc<DecoderInstance>]>;

/// The decoders selected for a run, split by input kind.
#[derive(Default)]
pub struct DecoderSet {
    packet: Vec<Arc<DecoderInstance>>,
    stream: Vec<Arc<DecoderInstance>>,
}

impl DecoderSet {
    /// Select decoders from `registry`, open their writers and run their
    /// init hooks.
    ///
    /// Selection errors are always fatal. Init failures are fatal unless
    /// `ignore_init_errors` is set, in which case the decoder is skipped.
    pub fn initialize(
        registry: &DecoderRegistry,
        config: &DecoderConfig,
        writers: &WriterFactory,
        metrics: Option<Arc<RecordMetrics>>,
        source: &str,
    ) -> Result<Self, DecoderError> {
        let names = registry.select(&config.include, &config.exclude)?;
        let mut set = DecoderSet::default();

        for name in names {
            match Self::init_one(registry, &name, writers, metrics.clone(), source) {
                Ok(instance) => set.push(instance),
                Err(e) if config.ignore_init_errors => {
                    tracing::warn!(decoder = %name, error = %e, "skipping decoder that failed to initialize");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            packet_decoders = set.packet.len(),
            stream_decoders = set.stream.len(),
            "decoders initialized"
        );
        Ok(set)
    }

    fn init_one(
        registry: &DecoderRegistry,
        name: &str,
        writers: &WriterFactory,
        metrics: Option<Arc<RecordMetrics>>,
        source: &str,
    ) -> Result<DecoderInstance, DecoderError> {
        let init_err = |reason: String| DecoderError::Init {
            name: name.to_string(),
            reason,
        };

        let decoder = registry
            .build(name)
            .ok_or_else(|| ConfigError::UnknownDecoder(name.to_string()))?;
        let record_type = decoder.record_type();
        let mut writer = writers
            .create(name, record_type)
            .map_err(|e| init_err(e.to_string()))?;
        decoder.post_init().map_err(init_err)?;
        writer
            .write_header(&RecordHeader {
                record_type,
                source: source.to_string(),
                created_us: now_us(),
            })
            .map_err(|e| init_err(e.to_string()))?;

        tracing::debug!(decoder = name, kind = ?decoder.kind(), record_type = %record_type, "decoder ready");
        Ok(DecoderInstance::new(decoder, writer, metrics))
    }

    pub fn push(&mut self, instance: DecoderInstance) {
        match instance.kind() {
            DecoderKind::Packet => self.packet.push(Arc::new(instance)),
            DecoderKind::Stream => self.stream.push(Arc::new(instance)),
        }
    }

    pub fn packet_decoders(&self) -> &[Arc<DecoderInstance>] {
        &self.packet
    }

    pub fn stream_decoders(&self) -> &[Arc<DecoderInstance>] {
        &self.stream
    }

    pub fn is_empty(&self) -> bool {
        self.packet.is_empty() && self.stream.is_empty()
    }

    pub fn has_stream_decoders(&self) -> bool {
        !self.stream.is_empty()
    }

    pub fn shared_stream_decoders(&self) -> StreamDecoders {
        self.stream.iter().cloned().collect()
    }

    pub fn decode_packet(&self, packet: &DecodedPacket) {
        dispatch(&self.packet, DecoderInput::Packet(packet));
    }

    pub fn decode_stream(&self, payload: &StreamPayload) {
        dispatch(&self.stream, DecoderInput::Stream(payload));
    }

    /// Destroy every decoder. Failures are logged and left out of the result.
    pub fn destroy(&self) -> Vec<DecoderSummary> {
        let mut summaries = Vec::new();
        for instance in self.packet.iter().chain(self.stream.iter()) {
            match instance.destroy() {
                Ok(summary) => {
                    tracing::info!(
                        decoder = %summary.name,
                        records = summary.records,
                        written = summary.written,
                        bytes = summary.bytes,
                        "decoder closed"
                    );
                    summaries.push(summary);
                }
                Err(e) => tracing::error!(decoder = instance.name(), error = %e, "failed to close decoder"),
            }
        }
        summaries
    }
}

/// Hand `input` to every decoder. Failures are already logged by the
/// instance and must not stop the others.
pub fn dispatch(decoders: &[Arc<DecoderInstance>], input: DecoderInput<'_>) {
    for decoder in decoders {
        if let Err(e) = decoder.decode(input) {
            tracing::trace!(decoder = decoder.name(), error = %e, "decode failed");
        }
    }
}

fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::MemorySink;

    /// Emits a record for every packet whose payload is non-empty.
    struct NonEmpty;

    impl Decoder for NonEmpty {
        fn name(&self) -> &str {
            "NonEmpty"
        }
        fn description(&self) -> &str {
            "test"
        }
        fn kind(&self) -> DecoderKind {
            DecoderKind::Packet
        }
        fn record_type(&self) -> RecordType {
            RecordType::Ipv4
        }
        fn transform(&self, input: DecoderInput<'_>) -> Option<Record> {
            let DecoderInput::Packet(p) = input else {
                return None;
            };
            if p.payload.is_empty() {
                return None;
            }
            builtin::ipv4_record(p)
        }
    }

    /// Claims to emit TCP records but emits IPv4 ones.
    struct Liar;

    impl Decoder for Liar {
        fn name(&self) -> &str {
            "Liar"
        }
        fn description(&self) -> &str {
            "test"
        }
        fn kind(&self) -> DecoderKind {
            DecoderKind::Packet
        }
        fn record_type(&self) -> RecordType {
            RecordType::Tcp
        }
        fn transform(&self, input: DecoderInput<'_>) -> Option<Record> {
            let DecoderInput::Packet(p) = input else {
                return None;
            };
            builtin::ipv4_record(p)
        }
    }

    fn packet(payload: &[u8]) -> DecodedPacket {
        use crate::capture::{CaptureInfo, IpHeader, Ipv4Header};
        use std::net::Ipv4Addr;
        DecodedPacket {
            capture: CaptureInfo::default(),
            ip: IpHeader::V4(Ipv4Header {
                ihl: 5,
                tos: 0,
                total_length: 20 + payload.len() as u16,
                identification: 0,
                flags: 0,
                fragment_offset: 0,
                ttl: 64,
                protocol: 17,
                checksum: 0,
                src: Ipv4Addr::new(1, 1, 1, 1),
                dst: Ipv4Addr::new(2, 2, 2, 2),
            }),
            tcp: None,
            payload: payload.to_vec(),
            reassembled: false,
        }
    }

    #[test]
    fn test_counts_only_produced_records() {
        let sink = MemorySink::new();
        let writer = WriterFactory::memory(sink.clone())
            .create("NonEmpty", RecordType::Ipv4)
            .unwrap();
        let instance = DecoderInstance::new(Box::new(NonEmpty), writer, None);
        for payload in [&b""[..], b"a", b"", b"bb", b"ccc"] {
            instance.decode(DecoderInput::Packet(&packet(payload))).unwrap();
        }
        let summary = instance.destroy().unwrap();
        assert_eq!(summary.records, 3);
        assert_eq!(summary.written, 3);
        assert_eq!(sink.records("NonEmpty").len(), 3);
        assert!(sink.stream("NonEmpty").unwrap().closed);
    }

    #[test]
    fn test_type_mismatch_halts_decoder() {
        let writer = WriterFactory::memory(MemorySink::new())
            .create("Liar", RecordType::Tcp)
            .unwrap();
        let instance = DecoderInstance::new(Box::new(Liar), writer, None);
        let err = instance.decode(DecoderInput::Packet(&packet(b"x"))).unwrap_err();
        assert!(matches!(err, DecoderError::TypeMismatch { .. }));
        assert!(instance.is_halted());
        instance.decode(DecoderInput::Packet(&packet(b"x"))).unwrap();
        assert_eq!(instance.records(), 0);
    }

    #[test]
    fn test_destroy_twice_fails_on_closed_writer() {
        let writer = WriterFactory::memory(MemorySink::new())
            .create("NonEmpty", RecordType::Ipv4)
            .unwrap();
        let instance = DecoderInstance::new(Box::new(NonEmpty), writer, None);
        instance.destroy().unwrap();
        assert!(matches!(instance.destroy(), Err(DecoderError::Write { .. })));
        assert!(instance.decode(DecoderInput::Packet(&packet(b"late"))).is_err());
    }
}
