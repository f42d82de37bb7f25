//! Prometheus counters for written audit records.
//!
//! One counter vector per record type, labelled by the record's own field
//! values. The registry is owned by the composition root and passed in, so
//! several pipelines (or tests) never share counters.

use std::collections::HashMap;

use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::decoder::record::{metric_labels, Record, RecordType};

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("no counter registered for record type {0}")]
    Unregistered(RecordType),
}

pub struct RecordMetrics {
    registry: Registry,
    counters: HashMap<RecordType, IntCounterVec>,
}

impl RecordMetrics {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            counters: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Create and register the counter of `record_type`. Registering the
    /// same type twice is a no-op.
    pub fn register(&mut self, record_type: RecordType) -> Result<(), MetricsError> {
        if self.counters.contains_key(&record_type) {
            return Ok(());
        }
        let counter = IntCounterVec::new(
            Opts::new(
                format!("{}_records_total", record_type.name().to_lowercase()),
                format!("Total number of {} audit records written", record_type.name()),
            )
            .namespace("flowscope"),
            metric_labels(record_type),
        )?;
        self.registry.register(Box::new(counter.clone()))?;
        self.counters.insert(record_type, counter);
        Ok(())
    }

    /// Count one written record.
    pub fn inc(&self, record: &Record) -> Result<(), MetricsError> {
        let record_type = record.record_type();
        let counter = self
            .counters
            .get(&record_type)
            .ok_or(MetricsError::Unregistered(record_type))?;
        let values = record.metric_values();
        let labels: Vec<&str> = values.iter().map(String::as_str).collect();
        counter.get_metric_with_label_values(&labels)?.inc();
        Ok(())
    }

    /// Current value of one labelled counter.
    pub fn value(&self, record_type: RecordType, labels: &[&str]) -> Option<u64> {
        let counter = self.counters.get(&record_type)?;
        counter.get_metric_with_label_values(labels).ok().map(|c| c.get())
    }

    /// Render every registered metric in the text exposition format.
    pub fn gather_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::record::StreamRecord;

    fn stream(direction: &str) -> Record {
        Record::Stream(StreamRecord {
            timestamp_us: 0,
            duration_us: 0,
            src_ip: "10.0.0.1".into(),
            src_port: 1,
            dst_ip: "10.0.0.2".into(),
            dst_port: 2,
            direction: direction.into(),
            bytes: 0,
            captured_bytes: 0,
            truncated: false,
            skipped_bytes: 0,
            lost_bytes: 0,
            deliveries: 0,
            close_reason: "finished".into(),
            fsm_state: "closed".into(),
            anomalies: 0,
            retransmissions: 0,
            partial: false,
            preview: String::new(),
        })
    }

    #[test]
    fn test_counts_by_label_values() {
        let mut metrics = RecordMetrics::new(Registry::new());
        metrics.register(RecordType::Stream).unwrap();
        metrics.register(RecordType::Stream).unwrap();
        metrics.inc(&stream("client")).unwrap();
        metrics.inc(&stream("client")).unwrap();
        metrics.inc(&stream("server")).unwrap();

        assert_eq!(metrics.value(RecordType::Stream, &["client", "finished"]), Some(2));
        assert_eq!(metrics.value(RecordType::Stream, &["server", "finished"]), Some(1));
        let text = metrics.gather_text().unwrap();
        assert!(text.contains("flowscope_stream_records_total"));
    }

    #[test]
    fn test_unregistered_type_is_an_error() {
        let metrics = RecordMetrics::new(Registry::new());
        assert!(matches!(
            metrics.inc(&stream("client")),
            Err(MetricsError::Unregistered(RecordType::Stream))
        ));
    }
}
