//! Audit record writers.
//!
//! Every decoder owns one writer, opened when the decoder is initialized and
//! closed when it is destroyed. Writers encode records (JSON lines or CSV)
//! and report the final record count and byte size on close.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decoder::record::{csv_header, Record, RecordType};

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("writer {0} is already closed")]
    Closed(String),

    #[error("record type {found} written to {expected} writer")]
    WrongType { expected: RecordType, found: RecordType },

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Written once before the first record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordHeader {
    pub record_type: RecordType,
    /// Input the records were produced from.
    pub source: String,
    pub created_us: u64,
}

/// Final accounting of a closed writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriterSummary {
    pub name: String,
    pub records: u64,
    pub bytes: u64,
}

pub trait AuditRecordWriter: Send {
    fn write_header(&mut self, header: &RecordHeader) -> Result<(), WriterError>;
    fn write(&mut self, record: &Record) -> Result<(), WriterError>;
    /// Flush and release the sink. Further writes fail.
    fn close(&mut self) -> Result<WriterSummary, WriterError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One JSON document per line.
    #[default]
    Json,
    Csv,
    /// Count records, write nothing.
    Null,
}

impl OutputFormat {
    fn extension(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Null => "",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub out_dir: PathBuf,
    pub buffered: bool,
    pub buffer_size: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Json,
            out_dir: PathBuf::from("output"),
            buffered: true,
            buffer_size: 64 * 1024,
        }
    }
}

enum WriterTarget {
    Output(OutputConfig),
    Memory(MemorySink),
}

/// Builds one writer per decoder.
pub struct WriterFactory {
    target: WriterTarget,
}

impl WriterFactory {
    pub fn new(config: OutputConfig) -> Self {
        Self {
            target: WriterTarget::Output(config),
        }
    }

    /// Writers that keep every record in `sink`.
    pub fn memory(sink: MemorySink) -> Self {
        Self {
            target: WriterTarget::Memory(sink),
        }
    }

    pub fn create(&self, name: &str, record_type: RecordType) -> Result<Box<dyn AuditRecordWriter>, WriterError> {
        match &self.target {
            WriterTarget::Memory(sink) => Ok(Box::new(MemoryWriter::new(name, record_type, sink.clone()))),
            WriterTarget::Output(config) => match config.format {
                OutputFormat::Null => Ok(Box::new(NullWriter::new(name))),
                OutputFormat::Json => {
                    let sink = open_sink(config, name)?;
                    Ok(Box::new(JsonWriter::new(name, record_type, sink)))
                }
                OutputFormat::Csv => {
                    let sink = open_sink(config, name)?;
                    Ok(Box::new(CsvWriter::new(name, record_type, sink)))
                }
            },
        }
    }
}

fn open_sink(config: &OutputConfig, name: &str) -> Result<Box<dyn Write + Send>, WriterError> {
    fs::create_dir_all(&config.out_dir)?;
    let path = output_path(&config.out_dir, name, config.format);
    let file = File::create(&path)?;
    tracing::debug!(path = %path.display(), "opened record file");
    if config.buffered {
        Ok(Box::new(BufWriter::with_capacity(config.buffer_size, file)))
    } else {
        Ok(Box::new(file))
    }
}

/// File a decoder's records are written to.
pub fn output_path(out_dir: &Path, name: &str, format: OutputFormat) -> PathBuf {
    out_dir.join(format!("{}.{}", name, format.extension()))
}

/// Tracks what every file-backed writer needs.
struct Sink {
    name: String,
    record_type: RecordType,
    out: Option<Box<dyn Write + Send>>,
    records: u64,
    bytes: u64,
}

impl Sink {
    fn new(name: &str, record_type: RecordType, out: Box<dyn Write + Send>) -> Self {
        Self {
            name: name.to_string(),
            record_type,
            out: Some(out),
            records: 0,
            bytes: 0,
        }
    }

    fn check(&self, record: &Record) -> Result<(), WriterError> {
        if record.record_type() != self.record_type {
            return Err(WriterError::WrongType {
                expected: self.record_type,
                found: record.record_type(),
            });
        }
        Ok(())
    }

    fn put(&mut self, line: &[u8]) -> Result<(), WriterError> {
        let out = self.out.as_mut().ok_or_else(|| WriterError::Closed(self.name.clone()))?;
        out.write_all(line)?;
        out.write_all(b"\n")?;
        self.bytes += line.len() as u64 + 1;
        Ok(())
    }

    fn close(&mut self) -> Result<WriterSummary, WriterError> {
        let mut out = self.out.take().ok_or_else(|| WriterError::Closed(self.name.clone()))?;
        out.flush()?;
        Ok(WriterSummary {
            name: self.name.clone(),
            records: self.records,
            bytes: self.bytes,
        })
    }
}

/// First line of a JSON record file.
#[derive(Serialize)]
struct JsonHeaderLine<'a> {
    header: &'a RecordHeader,
}

/// JSON lines writer. The first line is the header, wrapped in a `header`
/// object; every following line is one record.
pub struct JsonWriter {
    sink: Sink,
}

impl JsonWriter {
    pub fn new(name: &str, record_type: RecordType, out: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Sink::new(name, record_type, out),
        }
    }
}

impl AuditRecordWriter for JsonWriter {
    fn write_header(&mut self, header: &RecordHeader) -> Result<(), WriterError> {
        let line = serde_json::to_vec(&JsonHeaderLine { header })?;
        self.sink.put(&line)
    }

    fn write(&mut self, record: &Record) -> Result<(), WriterError> {
        self.sink.check(record)?;
        let line = serde_json::to_vec(record)?;
        self.sink.put(&line)?;
        self.sink.records += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<WriterSummary, WriterError> {
        self.sink.close()
    }
}

/// Comma separated values with a header row.
pub struct CsvWriter {
    sink: Sink,
}

impl CsvWriter {
    pub fn new(name: &str, record_type: RecordType, out: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Sink::new(name, record_type, out),
        }
    }
}

impl AuditRecordWriter for CsvWriter {
    fn write_header(&mut self, header: &RecordHeader) -> Result<(), WriterError> {
        let row = csv_row(csv_header(header.record_type).iter().copied());
        self.sink.put(row.as_bytes())
    }

    fn write(&mut self, record: &Record) -> Result<(), WriterError> {
        self.sink.check(record)?;
        let fields = record.csv_record();
        let row = csv_row(fields.iter().map(String::as_str));
        self.sink.put(row.as_bytes())?;
        self.sink.records += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<WriterSummary, WriterError> {
        self.sink.close()
    }
}

/// Quote a field when it contains a separator, quote or line break.
pub fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_row<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    fields.map(csv_escape).collect::<Vec<_>>().join(",")
}

/// Discards records but keeps count.
pub struct NullWriter {
    name: String,
    records: u64,
    closed: bool,
}

impl NullWriter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: 0,
            closed: false,
        }
    }
}

impl AuditRecordWriter for NullWriter {
    fn write_header(&mut self, _header: &RecordHeader) -> Result<(), WriterError> {
        Ok(())
    }

    fn write(&mut self, _record: &Record) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::Closed(self.name.clone()));
        }
        self.records += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<WriterSummary, WriterError> {
        if self.closed {
            return Err(WriterError::Closed(self.name.clone()));
        }
        self.closed = true;
        Ok(WriterSummary {
            name: self.name.clone(),
            records: self.records,
            bytes: 0,
        })
    }
}

/// Records captured by one [`MemoryWriter`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    pub header: Option<RecordHeader>,
    pub records: Vec<Record>,
    pub closed: bool,
}

/// Shared store behind the in-memory writers, keyed by decoder name.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    streams: Arc<Mutex<BTreeMap<String, MemoryStream>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, name: &str) -> Vec<Record> {
        self.streams
            .lock()
            .get(name)
            .map(|s| s.records.clone())
            .unwrap_or_default()
    }

    pub fn stream(&self, name: &str) -> Option<MemoryStream> {
        self.streams.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.streams.lock().keys().cloned().collect()
    }
}

pub struct MemoryWriter {
    name: String,
    record_type: RecordType,
    sink: MemorySink,
    records: u64,
    bytes: u64,
    closed: bool,
}

impl MemoryWriter {
    pub fn new(name: &str, record_type: RecordType, sink: MemorySink) -> Self {
        sink.streams.lock().insert(name.to_string(), MemoryStream::default());
        Self {
            name: name.to_string(),
            record_type,
            sink,
            records: 0,
            bytes: 0,
            closed: false,
        }
    }

    fn with_stream<R>(&self, f: impl FnOnce(&mut MemoryStream) -> R) -> R {
        let mut streams = self.sink.streams.lock();
        f(streams.entry(self.name.clone()).or_default())
    }
}

impl AuditRecordWriter for MemoryWriter {
    fn write_header(&mut self, header: &RecordHeader) -> Result<(), WriterError> {
        self.with_stream(|s| s.header = Some(header.clone()));
        Ok(())
    }

    fn write(&mut self, record: &Record) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::Closed(self.name.clone()));
        }
        if record.record_type() != self.record_type {
            return Err(WriterError::WrongType {
                expected: self.record_type,
                found: record.record_type(),
            });
        }
        self.bytes += serde_json::to_vec(record)?.len() as u64;
        self.with_stream(|s| s.records.push(record.clone()));
        self.records += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<WriterSummary, WriterError> {
        if self.closed {
            return Err(WriterError::Closed(self.name.clone()));
        }
        self.closed = true;
        self.with_stream(|s| s.closed = true);
        Ok(WriterSummary {
            name: self.name.clone(),
            records: self.records,
            bytes: self.bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::record::TcpRecord;

    fn tcp(ts: u64) -> Record {
        Record::Tcp(TcpRecord {
            timestamp_us: ts,
            src_ip: "10.0.0.1".into(),
            dst_ip: "10.0.0.2".into(),
            src_port: 1234,
            dst_port: 80,
            seq: 1,
            ack: 0,
            data_offset: 5,
            flags: "SYN".into(),
            window: 8192,
            checksum: 0,
            urgent: 0,
            payload_size: 0,
        })
    }

    fn header(record_type: RecordType) -> RecordHeader {
        RecordHeader {
            record_type,
            source: "test.pcap".into(),
            created_us: 0,
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("flowscope_writer_{}_{}", tag, std::process::id()))
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_json_writer_counts_lines_and_bytes() {
        let dir = temp_dir("json");
        let factory = WriterFactory::new(OutputConfig {
            format: OutputFormat::Json,
            out_dir: dir.clone(),
            ..Default::default()
        });
        let mut w = factory.create("TCP", RecordType::Tcp).unwrap();
        w.write_header(&header(RecordType::Tcp)).unwrap();
        w.write(&tcp(1)).unwrap();
        w.write(&tcp(2)).unwrap();
        let summary = w.close().unwrap();

        let content = fs::read_to_string(output_path(&dir, "TCP", OutputFormat::Json)).unwrap();
        fs::remove_dir_all(&dir).ok();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.bytes, content.len() as u64);
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["header"]["source"], "test.pcap");
        assert_eq!(first["header"]["record_type"], "Tcp");
        let record: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(record["timestamp_us"], 1);
        assert!(matches!(w.write(&tcp(3)), Err(WriterError::Closed(_))));
    }

    #[test]
    fn test_csv_writer_emits_header_row() {
        let dir = temp_dir("csv");
        let factory = WriterFactory::new(OutputConfig {
            format: OutputFormat::Csv,
            out_dir: dir.clone(),
            buffered: false,
            ..Default::default()
        });
        let mut w = factory.create("TCP", RecordType::Tcp).unwrap();
        w.write_header(&header(RecordType::Tcp)).unwrap();
        w.write(&tcp(5)).unwrap();
        w.close().unwrap();

        let content = fs::read_to_string(output_path(&dir, "TCP", OutputFormat::Csv)).unwrap();
        fs::remove_dir_all(&dir).ok();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("timestamp_us,src_ip,dst_ip"));
        assert!(lines.next().unwrap().starts_with("5,10.0.0.1,10.0.0.2,1234,80"));
    }

    #[test]
    fn test_memory_writer_rejects_foreign_type() {
        let sink = MemorySink::new();
        let mut w = WriterFactory::memory(sink.clone())
            .create("HTTP", RecordType::Http)
            .unwrap();
        assert!(matches!(w.write(&tcp(1)), Err(WriterError::WrongType { .. })));
        assert!(sink.records("HTTP").is_empty());
        w.close().unwrap();
        assert!(sink.stream("HTTP").unwrap().closed);
    }
}
