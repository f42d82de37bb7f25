//! Audit record types emitted by the built-in decoders.

use std::fmt;

use serde::Serialize;

/// The kind of record a decoder emits. Every decoder is bound to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordType {
    Ipv4,
    Tcp,
    Stream,
    Http,
}

impl RecordType {
    pub fn name(self) -> &'static str {
        match self {
            RecordType::Ipv4 => "IPv4",
            RecordType::Tcp => "TCP",
            RecordType::Stream => "Stream",
            RecordType::Http => "HTTP",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tabular and metric views of a record.
pub trait AuditRecord: Serialize {
    const TYPE: RecordType;

    fn csv_header() -> &'static [&'static str];
    fn csv_record(&self) -> Vec<String>;
    /// Label names of the per-type record counter.
    fn metric_labels() -> &'static [&'static str];
    /// Label values matching [`AuditRecord::metric_labels`].
    fn metric_values(&self) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ipv4Record {
    pub timestamp_us: u64,
    pub version: u8,
    pub ihl: u8,
    pub tos: u8,
    pub length: u16,
    pub id: u16,
    pub flags: u8,
    pub frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_ip: String,
    pub dst_ip: String,
    pub payload_size: usize,
    pub reassembled: bool,
}

impl AuditRecord for Ipv4Record {
    const TYPE: RecordType = RecordType::Ipv4;

    fn csv_header() -> &'static [&'static str] {
        &[
            "timestamp_us",
            "version",
            "ihl",
            "tos",
            "length",
            "id",
            "flags",
            "frag_offset",
            "ttl",
            "protocol",
            "checksum",
            "src_ip",
            "dst_ip",
            "payload_size",
            "reassembled",
        ]
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp_us.to_string(),
            self.version.to_string(),
            self.ihl.to_string(),
            self.tos.to_string(),
            self.length.to_string(),
            self.id.to_string(),
            self.flags.to_string(),
            self.frag_offset.to_string(),
            self.ttl.to_string(),
            self.protocol.to_string(),
            self.checksum.to_string(),
            self.src_ip.clone(),
            self.dst_ip.clone(),
            self.payload_size.to_string(),
            self.reassembled.to_string(),
        ]
    }

    fn metric_labels() -> &'static [&'static str] {
        &["protocol", "reassembled"]
    }

    fn metric_values(&self) -> Vec<String> {
        vec![self.protocol.to_string(), self.reassembled.to_string()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpRecord {
    pub timestamp_us: u64,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: u8,
    /// Flag names joined by `|`.
    pub flags: String,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub payload_size: usize,
}

impl AuditRecord for TcpRecord {
    const TYPE: RecordType = RecordType::Tcp;

    fn csv_header() -> &'static [&'static str] {
        &[
            "timestamp_us",
            "src_ip",
            "dst_ip",
            "src_port",
            "dst_port",
            "seq",
            "ack",
            "data_offset",
            "flags",
            "window",
            "checksum",
            "urgent",
            "payload_size",
        ]
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp_us.to_string(),
            self.src_ip.clone(),
            self.dst_ip.clone(),
            self.src_port.to_string(),
            self.dst_port.to_string(),
            self.seq.to_string(),
            self.ack.to_string(),
            self.data_offset.to_string(),
            self.flags.clone(),
            self.window.to_string(),
            self.checksum.to_string(),
            self.urgent.to_string(),
            self.payload_size.to_string(),
        ]
    }

    fn metric_labels() -> &'static [&'static str] {
        &["dst_port", "flags"]
    }

    fn metric_values(&self) -> Vec<String> {
        vec![self.dst_port.to_string(), self.flags.clone()]
    }
}

/// Summary of one reassembled direction of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRecord {
    pub timestamp_us: u64,
    pub duration_us: u64,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    pub direction: String,
    /// Bytes delivered by reassembly.
    pub bytes: u64,
    /// Bytes retained for decoding.
    pub captured_bytes: u64,
    pub truncated: bool,
    pub skipped_bytes: u64,
    pub lost_bytes: u64,
    pub deliveries: u64,
    pub close_reason: String,
    pub fsm_state: String,
    pub anomalies: u64,
    pub retransmissions: u64,
    /// The handshake was not observed.
    pub partial: bool,
    /// First bytes of the stream, non-printable bytes escaped.
    pub preview: String,
}

impl AuditRecord for StreamRecord {
    const TYPE: RecordType = RecordType::Stream;

    fn csv_header() -> &'static [&'static str] {
        &[
            "timestamp_us",
            "duration_us",
            "src_ip",
            "src_port",
            "dst_ip",
            "dst_port",
            "direction",
            "bytes",
            "captured_bytes",
            "truncated",
            "skipped_bytes",
            "lost_bytes",
            "deliveries",
            "close_reason",
            "fsm_state",
            "anomalies",
            "retransmissions",
            "partial",
            "preview",
        ]
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp_us.to_string(),
            self.duration_us.to_string(),
            self.src_ip.clone(),
            self.src_port.to_string(),
            self.dst_ip.clone(),
            self.dst_port.to_string(),
            self.direction.clone(),
            self.bytes.to_string(),
            self.captured_bytes.to_string(),
            self.truncated.to_string(),
            self.skipped_bytes.to_string(),
            self.lost_bytes.to_string(),
            self.deliveries.to_string(),
            self.close_reason.clone(),
            self.fsm_state.clone(),
            self.anomalies.to_string(),
            self.retransmissions.to_string(),
            self.partial.to_string(),
            self.preview.clone(),
        ]
    }

    fn metric_labels() -> &'static [&'static str] {
        &["direction", "close_reason"]
    }

    fn metric_values(&self) -> Vec<String> {
        vec![self.direction.clone(), self.close_reason.clone()]
    }
}

/// First HTTP message seen in one direction of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpRecord {
    pub timestamp_us: u64,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    /// `request` or `response`.
    pub kind: String,
    pub method: String,
    pub uri: String,
    pub version: String,
    pub status_code: u16,
    pub reason: String,
    pub host: String,
    pub user_agent: String,
    pub content_type: String,
    pub content_length: Option<u64>,
    /// Messages of the same kind found in the direction.
    pub messages: u32,
}

impl AuditRecord for HttpRecord {
    const TYPE: RecordType = RecordType::Http;

    fn csv_header() -> &'static [&'static str] {
        &[
            "timestamp_us",
            "src_ip",
            "src_port",
            "dst_ip",
            "dst_port",
            "kind",
            "method",
            "uri",
            "version",
            "status_code",
            "reason",
            "host",
            "user_agent",
            "content_type",
            "content_length",
            "messages",
        ]
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp_us.to_string(),
            self.src_ip.clone(),
            self.src_port.to_string(),
            self.dst_ip.clone(),
            self.dst_port.to_string(),
            self.kind.clone(),
            self.method.clone(),
            self.uri.clone(),
            self.version.clone(),
            self.status_code.to_string(),
            self.reason.clone(),
            self.host.clone(),
            self.user_agent.clone(),
            self.content_type.clone(),
            self.content_length.map(|l| l.to_string()).unwrap_or_default(),
            self.messages.to_string(),
        ]
    }

    fn metric_labels() -> &'static [&'static str] {
        &["kind", "method", "status_code"]
    }

    fn metric_values(&self) -> Vec<String> {
        vec![self.kind.clone(), self.method.clone(), self.status_code.to_string()]
    }
}

/// A record produced by any decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Record {
    Ipv4(Ipv4Record),
    Tcp(TcpRecord),
    Stream(StreamRecord),
    Http(HttpRecord),
}

macro_rules! dispatch {
    ($self:ident, $r:ident => $body:expr) => {
        match $self {
            Record::Ipv4($r) => $body,
            Record::Tcp($r) => $body,
            Record::Stream($r) => $body,
            Record::Http($r) => $body,
        }
    };
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Ipv4(_) => RecordType::Ipv4,
            Record::Tcp(_) => RecordType::Tcp,
            Record::Stream(_) => RecordType::Stream,
            Record::Http(_) => RecordType::Http,
        }
    }

    pub fn timestamp_us(&self) -> u64 {
        dispatch!(self, r => r.timestamp_us)
    }

    pub fn csv_record(&self) -> Vec<String> {
        dispatch!(self, r => r.csv_record())
    }

    pub fn metric_values(&self) -> Vec<String> {
        dispatch!(self, r => r.metric_values())
    }
}

/// CSV column names of a record type.
pub fn csv_header(record_type: RecordType) -> &'static [&'static str] {
    match record_type {
        RecordType::Ipv4 => Ipv4Record::csv_header(),
        RecordType::Tcp => TcpRecord::csv_header(),
        RecordType::Stream => StreamRecord::csv_header(),
        RecordType::Http => HttpRecord::csv_header(),
    }
}

/// Metric label names of a record type.
pub fn metric_labels(record_type: RecordType) -> &'static [&'static str] {
    match record_type {
        RecordType::Ipv4 => Ipv4Record::metric_labels(),
        RecordType::Tcp => TcpRecord::metric_labels(),
        RecordType::Stream => StreamRecord::metric_labels(),
        RecordType::Http => HttpRecord::metric_labels(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http() -> HttpRecord {
        HttpRecord {
            timestamp_us: 7,
            src_ip: "10.0.0.1".into(),
            src_port: 40000,
            dst_ip: "10.0.0.2".into(),
            dst_port: 80,
            kind: "request".into(),
            method: "GET".into(),
            uri: "/".into(),
            version: "HTTP/1.1".into(),
            status_code: 0,
            reason: String::new(),
            host: "example.com".into(),
            user_agent: String::new(),
            content_type: String::new(),
            content_length: None,
            messages: 1,
        }
    }

    #[test]
    fn test_csv_columns_match_header() {
        let record = Record::Http(http());
        assert_eq!(record.csv_record().len(), csv_header(RecordType::Http).len());
        assert_eq!(
            record.metric_values().len(),
            metric_labels(RecordType::Http).len()
        );
    }

    #[test]
    fn test_json_is_untagged() {
        let json = serde_json::to_value(Record::Http(http())).unwrap();
        assert_eq!(json["method"], "GET");
        assert_eq!(json["content_length"], serde_json::Value::Null);
        assert!(json.get("Http").is_none());
    }
}
