//! Capture-to-records pipeline.
//!
//! ```text
//! PcapReader
//!   → decode_packet (Ethernet, IP, TCP; IPv4 defragmentation)
//!   → packet decoders
//!   → Assembler (FSM check, reassembly, capture-time idle sweep)
//!   → ConnectionFactory readers → stream decoders
//! ```
//!
//! Packets are read on a blocking thread. Once input ends every remaining
//! connection is flushed, the readers are awaited and the decoders closed,
//! in that order, so no delivered byte is lost to an early writer close.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::Registry;
use serde::Serialize;
use tokio::runtime::Handle;

use crate::capture::{decode_packet, Defragmenter, Ipv4Defragmenter, PcapReader};
use crate::config::{Config, SweepConfig};
use crate::connection::{ConnectionFactory, FactorySummary};
use crate::decoder::{DecoderRegistry, DecoderSet, DecoderSummary};
use crate::metrics::RecordMetrics;
use crate::reassembly::{AssembleOutcome, Assembler, PageCache, PageCacheStats, StreamPool};
use crate::writer::WriterFactory;

/// Producer name written into every record header.
const SOURCE: &str = concat!("flowscope ", env!("CARGO_PKG_VERSION"));

/// Counters of the ingest thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub packets: u64,
    /// Frames that were not IP, truncated, or fragments still waiting for
    /// the rest of their datagram.
    pub undecoded: u64,
    pub segments: u64,
    pub rejected_segments: u64,
    /// Segments without SYN or data for a connection not being tracked.
    pub untracked_segments: u64,
    /// Connections ended by FIN or RST.
    pub closed_connections: u64,
    pub idle_flushed: u64,
    pub shutdown_flushed: u64,
    pub sweeps: u64,
    pub fragments_reassembled: u64,
    pub fragments_discarded: u64,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub ingest: IngestStats,
    pub connections: FactorySummary,
    pub decoders: Vec<DecoderSummary>,
    pub page_cache: PageCacheStats,
    /// Prometheus exposition text, when metrics export is enabled.
    #[serde(skip)]
    pub metrics: Option<String>,
}

impl RunSummary {
    pub fn write_failures(&self) -> u64 {
        self.decoders.iter().map(|d| d.write_failures).sum()
    }
}

pub struct Pipeline {
    config: Config,
    decoders: Arc<DecoderSet>,
    metrics: Option<Arc<RecordMetrics>>,
    factory: Arc<ConnectionFactory>,
    assembler: Arc<Assembler>,
}

impl Pipeline {
    /// Select and initialize decoders, then wire up reassembly.
    ///
    /// Must be called from within a tokio runtime; the stream readers are
    /// spawned onto it. `metrics` is only used when
    /// `config.export_metrics` is set; `None` then means a fresh registry.
    pub fn new(
        config: Config,
        registry: &DecoderRegistry,
        writers: WriterFactory,
        metrics: Option<Registry>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().context("pipeline needs a running tokio runtime")?;

        let metrics = if config.export_metrics {
            Some(Arc::new(record_metrics(&config, registry, metrics.unwrap_or_default())?))
        } else {
            None
        };

        let decoders = DecoderSet::initialize(registry, &config.decoders, &writers, metrics.clone(), SOURCE)?;
        if decoders.is_empty() {
            anyhow::bail!("no decoder could be initialized");
        }
        let decoders = Arc::new(decoders);

        let factory = Arc::new(ConnectionFactory::new(
            runtime,
            decoders.shared_stream_decoders(),
            config.connection.clone(),
        ));
        let pool = Arc::new(StreamPool::new(factory.clone()));
        let assembler = Arc::new(Assembler::new(pool, Arc::new(PageCache::default()), config.assembler));

        Ok(Self {
            config,
            decoders,
            metrics,
            factory,
            assembler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process one capture file and close every decoder.
    pub async fn run(self, path: impl AsRef<Path>) -> Result<RunSummary> {
        let path = path.as_ref().to_path_buf();
        tracing::info!(path = %path.display(), "processing capture");

        let reader = PcapReader::new(&path)?;
        let decoders = self.decoders.clone();
        let assembler = self.assembler.clone();
        let sweep = self.config.sweep.clone();
        let ingested = tokio::task::spawn_blocking(move || ingest(&reader, &decoders, &assembler, &sweep))
            .await
            .context("ingest thread failed")?;

        let (ingest, read_error) = ingested;
        tracing::info!(
            packets = ingest.packets,
            segments = ingest.segments,
            flows = self.factory.flows_started(),
            "input finished, waiting for connections"
        );
        let connections = self.factory.wait_all().await;
        let decoders = self.decoders.destroy();

        if let Some(e) = read_error {
            return Err(e.context(format!("failed to read {}", path.display())));
        }

        let metrics = match &self.metrics {
            Some(m) => Some(m.gather_text()?),
            None => None,
        };
        let summary = RunSummary {
            ingest,
            connections,
            decoders,
            page_cache: self.assembler.cache().stats(),
            metrics,
        };
        if summary.write_failures() > 0 {
            tracing::warn!(failures = summary.write_failures(), "some records could not be written");
        }
        tracing::info!(
            packets = summary.ingest.packets,
            connections = summary.connections.flows,
            stream_bytes = summary.connections.bytes,
            "capture processed"
        );
        Ok(summary)
    }
}

/// Register one counter vector per record type the selection will produce.
fn record_metrics(config: &Config, registry: &DecoderRegistry, prometheus: Registry) -> Result<RecordMetrics> {
    let mut metrics = RecordMetrics::new(prometheus);
    for name in registry.select(&config.decoders.include, &config.decoders.exclude)? {
        if let Some(decoder) = registry.build(&name) {
            metrics.register(decoder.record_type())?;
        }
    }
    Ok(metrics)
}

/// Read every packet and drive it through decoding and reassembly.
///
/// Connections are flushed even when reading fails part way, so their
/// readers always finish. The read error, if any, is returned next to the
/// counters.
fn ingest(
    reader: &PcapReader,
    decoders: &DecoderSet,
    assembler: &Assembler,
    sweep: &SweepConfig,
) -> (IngestStats, Option<anyhow::Error>) {
    let mut stats = IngestStats::default();
    let mut defrag = Ipv4Defragmenter::new();

    let read = read_packets(reader, decoders, assembler, sweep, &mut defrag, &mut stats);
    stats.shutdown_flushed = assembler.flush_all() as u64;
    stats.fragments_reassembled = defrag.reassembled();
    stats.fragments_discarded = defrag.discarded();
    if defrag.pending() > 0 {
        tracing::debug!(pending = defrag.pending(), "incomplete datagrams left at end of input");
    }
    (stats, read.err())
}

fn read_packets(
    reader: &PcapReader,
    decoders: &DecoderSet,
    assembler: &Assembler,
    sweep: &SweepConfig,
    defrag: &mut dyn Defragmenter,
    stats: &mut IngestStats,
) -> Result<()> {
    let idle_us = sweep.idle_timeout().as_micros() as u64;
    let interval_us = sweep.interval().as_micros() as u64;
    let fragment_us = sweep.fragment_timeout().as_micros() as u64;
    let reassemble = decoders.has_stream_decoders();
    let mut next_sweep_us = None;

    for packet in reader.packets()? {
        let packet = packet?;
        stats.packets += 1;
        let now_us = packet.info.timestamp_us;

        match next_sweep_us {
            None => next_sweep_us = Some(now_us.saturating_add(interval_us)),
            Some(due) if now_us >= due => {
                stats.sweeps += 1;
                stats.idle_flushed += assembler.flush_older_than(now_us.saturating_sub(idle_us)) as u64;
                defrag.discard_older_than(now_us.saturating_sub(fragment_us));
                next_sweep_us = Some(now_us.saturating_add(interval_us));
            }
            Some(_) => {}
        }

        let Some(decoded) = decode_packet(&packet, defrag) else {
            stats.undecoded += 1;
            tracing::trace!(packet = stats.packets, "packet not decoded");
            continue;
        };
        decoders.decode_packet(&decoded);

        let (Some(flow), Some(segment)) = (decoded.flow(), decoded.segment()) else {
            continue;
        };
        stats.segments += 1;
        if !reassemble {
            continue;
        }
        match assembler.assemble(&flow, &segment) {
            AssembleOutcome::Assembled => {}
            AssembleOutcome::Rejected => stats.rejected_segments += 1,
            AssembleOutcome::Untracked => stats.untracked_segments += 1,
            AssembleOutcome::Closed(reason) => {
                stats.closed_connections += 1;
                tracing::trace!(flow = %flow, reason = ?reason, "connection closed");
            }
        }
    }
    Ok(())
}
