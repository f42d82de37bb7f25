//! Decoders shipped with the crate.
//!
//! | name   | kind   | record |
//! |--------|--------|--------|
//! | IPv4   | packet | [`Ipv4Record`] |
//! | TCP    | packet | [`TcpRecord`] |
//! | Stream | stream | [`StreamRecord`] |
//! | HTTP   | stream | [`HttpRecord`] |

use super::record::{HttpRecord, Ipv4Record, Record, RecordType, StreamRecord, TcpRecord};
use super::registry::DecoderRegistry;
use super::{Decoder, DecoderInput, DecoderKind, StreamPayload};
use crate::capture::{DecodedPacket, IpHeader};

/// Bytes of a stream shown in its record.
const PREVIEW_BYTES: usize = 32;

/// HTTP methods recognized at the start of a request.
const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Upper bound on a header block; anything longer is not treated as HTTP.
const MAX_HEADER_BLOCK: usize = 64 * 1024;

pub fn register_all(registry: &mut DecoderRegistry) {
    registry.register(|| Box::new(Ipv4Decoder));
    registry.register(|| Box::new(TcpDecoder));
    registry.register(|| Box::new(StreamDecoder));
    registry.register(|| Box::new(HttpDecoder));
}

/// The IPv4 record of a packet, `None` for IPv6.
pub fn ipv4_record(packet: &DecodedPacket) -> Option<Record> {
    let IpHeader::V4(h) = packet.ip else {
        return None;
    };
    Some(Record::Ipv4(Ipv4Record {
        timestamp_us: packet.capture.timestamp_us,
        version: 4,
        ihl: h.ihl,
        tos: h.tos,
        length: h.total_length,
        id: h.identification,
        flags: h.flags,
        frag_offset: h.fragment_offset,
        ttl: h.ttl,
        protocol: h.protocol,
        checksum: h.checksum,
        src_ip: h.src.to_string(),
        dst_ip: h.dst.to_string(),
        payload_size: (h.total_length as usize).saturating_sub(h.header_len()),
        reassembled: packet.reassembled,
    }))
}

pub struct Ipv4Decoder;

impl Decoder for Ipv4Decoder {
    fn name(&self) -> &str {
        "IPv4"
    }

    fn description(&self) -> &str {
        "Internet Protocol version 4 headers"
    }

    fn kind(&self) -> DecoderKind {
        DecoderKind::Packet
    }

    fn record_type(&self) -> RecordType {
        RecordType::Ipv4
    }

    fn transform(&self, input: DecoderInput<'_>) -> Option<Record> {
        match input {
            DecoderInput::Packet(packet) => ipv4_record(packet),
            DecoderInput::Stream(_) => None,
        }
    }
}

pub struct TcpDecoder;

impl Decoder for TcpDecoder {
    fn name(&self) -> &str {
        "TCP"
    }

    fn description(&self) -> &str {
        "Transmission Control Protocol segment headers"
    }

    fn kind(&self) -> DecoderKind {
        DecoderKind::Packet
    }

    fn record_type(&self) -> RecordType {
        RecordType::Tcp
    }

    fn transform(&self, input: DecoderInput<'_>) -> Option<Record> {
        let DecoderInput::Packet(packet) = input else {
            return None;
        };
        let tcp = packet.tcp?;
        Some(Record::Tcp(TcpRecord {
            timestamp_us: packet.capture.timestamp_us,
            src_ip: packet.ip.src().to_string(),
            dst_ip: packet.ip.dst().to_string(),
            src_port: tcp.src_port,
            dst_port: tcp.dst_port,
            seq: tcp.seq,
            ack: tcp.ack,
            data_offset: tcp.data_offset,
            flags: tcp.flags.to_string(),
            window: tcp.window,
            checksum: tcp.checksum,
            urgent: tcp.urgent,
            payload_size: packet.payload.len(),
        }))
    }
}

/// Escape non-printable bytes of the first [`PREVIEW_BYTES`] of `data`.
fn preview(data: &[u8]) -> String {
    let end = data.len().min(PREVIEW_BYTES);
    data[..end]
        .iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect()
}

pub struct StreamDecoder;

impl Decoder for StreamDecoder {
    fn name(&self) -> &str {
        "Stream"
    }

    fn description(&self) -> &str {
        "Per-direction summary of reassembled TCP streams"
    }

    fn kind(&self) -> DecoderKind {
        DecoderKind::Stream
    }

    fn record_type(&self) -> RecordType {
        RecordType::Stream
    }

    fn transform(&self, input: DecoderInput<'_>) -> Option<Record> {
        let DecoderInput::Stream(s) = input else {
            return None;
        };
        Some(Record::Stream(StreamRecord {
            timestamp_us: s.first_seen_us,
            duration_us: s.last_seen_us.saturating_sub(s.first_seen_us),
            src_ip: s.flow.network.src.to_string(),
            src_port: s.flow.transport.src,
            dst_ip: s.flow.network.dst.to_string(),
            dst_port: s.flow.transport.dst,
            direction: s.direction.to_string(),
            bytes: s.total_bytes,
            captured_bytes: s.data.len() as u64,
            truncated: s.truncated,
            skipped_bytes: s.skipped_bytes,
            lost_bytes: s.lost_bytes,
            deliveries: s.deliveries,
            close_reason: s
                .close_reason
                .map(|r| format!("{r:?}").to_lowercase())
                .unwrap_or_else(|| "unknown".to_string()),
            fsm_state: s.fsm.state.to_string(),
            anomalies: s.fsm.violations,
            retransmissions: s.fsm.retransmissions,
            partial: s.fsm.partial,
            preview: preview(&s.data),
        }))
    }
}

/// Start line and selected headers of one HTTP message.
#[derive(Debug, Default, PartialEq, Eq)]
struct HttpHead {
    request: bool,
    method: String,
    uri: String,
    version: String,
    status_code: u16,
    reason: String,
    host: String,
    user_agent: String,
    content_type: String,
    content_length: Option<u64>,
    /// Bytes of the start line and headers, including the blank line.
    len: usize,
}

fn parse_head(data: &[u8]) -> Option<HttpHead> {
    let window = &data[..data.len().min(MAX_HEADER_BLOCK)];
    let end = window.windows(4).position(|w| w == b"\r\n\r\n")?;
    let text = std::str::from_utf8(&window[..end]).ok()?;
    let mut lines = text.split("\r\n");
    let start = lines.next()?;

    let mut head = HttpHead {
        len: end + 4,
        ..Default::default()
    };
    let mut parts = start.splitn(3, ' ');
    let first = parts.next()?;
    if first.starts_with("HTTP/") {
        head.version = first.to_string();
        head.status_code = parts.next()?.parse().ok()?;
        head.reason = parts.next().unwrap_or_default().to_string();
    } else if HTTP_METHODS.contains(&first) {
        head.request = true;
        head.method = first.to_string();
        head.uri = parts.next()?.to_string();
        head.version = parts.next()?.to_string();
        if !head.version.starts_with("HTTP/") {
            return None;
        }
    } else {
        return None;
    }

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "host" => head.host = value.to_string(),
            "user-agent" => head.user_agent = value.to_string(),
            "content-type" => head.content_type = value.to_string(),
            "content-length" => head.content_length = value.parse().ok(),
            _ => {}
        }
    }
    Some(head)
}

/// Count consecutive messages starting at the front of `data`. Stops at the
/// first block that is not a well-formed head or whose body length is not
/// declared.
fn count_messages(data: &[u8]) -> u32 {
    let mut offset = 0usize;
    let mut count = 0u32;
    while offset < data.len() {
        let Some(head) = parse_head(&data[offset..]) else {
            break;
        };
        count += 1;
        let body = match head.content_length {
            Some(len) => len as usize,
            None if head.request => 0,
            None => break,
        };
        offset = offset.saturating_add(head.len).saturating_add(body);
    }
    count
}

pub struct HttpDecoder;

impl Decoder for HttpDecoder {
    fn name(&self) -> &str {
        "HTTP"
    }

    fn description(&self) -> &str {
        "Hypertext Transfer Protocol request and status lines"
    }

    fn kind(&self) -> DecoderKind {
        DecoderKind::Stream
    }

    fn record_type(&self) -> RecordType {
        RecordType::Http
    }

    fn transform(&self, input: DecoderInput<'_>) -> Option<Record> {
        let DecoderInput::Stream(s) = input else {
            return None;
        };
        http_record(s)
    }
}

fn http_record(s: &StreamPayload) -> Option<Record> {
    let head = parse_head(&s.data)?;
    Some(Record::Http(HttpRecord {
        timestamp_us: s.first_seen_us,
        src_ip: s.flow.network.src.to_string(),
        src_port: s.flow.transport.src,
        dst_ip: s.flow.network.dst.to_string(),
        dst_port: s.flow.transport.dst,
        kind: if head.request { "request" } else { "response" }.to_string(),
        method: head.method,
        uri: head.uri,
        version: head.version,
        status_code: head.status_code,
        reason: head.reason,
        host: head.host,
        user_agent: head.user_agent,
        content_type: head.content_type,
        content_length: head.content_length,
        messages: count_messages(&s.data),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::{Direction, FlowIdentity, FlowState, FsmSummary};
    use std::net::{IpAddr, Ipv4Addr};

    fn payload(data: &[u8]) -> StreamPayload {
        StreamPayload {
            flow: FlowIdentity::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                40000,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                80,
            ),
            direction: Direction::ClientToServer,
            first_seen_us: 100,
            last_seen_us: 350,
            data: data.to_vec(),
            total_bytes: data.len() as u64,
            truncated: false,
            skipped_bytes: 0,
            lost_bytes: 0,
            deliveries: 1,
            close_reason: None,
            fsm: FsmSummary {
                state: FlowState::Established,
                violations: 2,
                retransmissions: 0,
                partial: true,
            },
        }
    }

    #[test]
    fn test_http_request_with_pipelining() {
        let data = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: curl/8\r\n\r\n\
POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nabc";
        let Some(Record::Http(r)) = HttpDecoder.transform(DecoderInput::Stream(&payload(data))) else {
            panic!("expected an HTTP record");
        };
        assert_eq!(r.kind, "request");
        assert_eq!(r.method, "GET");
        assert_eq!(r.uri, "/index.html");
        assert_eq!(r.host, "example.com");
        assert_eq!(r.user_agent, "curl/8");
        assert_eq!(r.messages, 2);
    }

    #[test]
    fn test_http_response() {
        let data = b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nno";
        let Some(Record::Http(r)) = HttpDecoder.transform(DecoderInput::Stream(&payload(data))) else {
            panic!("expected an HTTP record");
        };
        assert_eq!(r.kind, "response");
        assert_eq!(r.status_code, 404);
        assert_eq!(r.reason, "Not Found");
        assert_eq!(r.content_length, Some(2));
        assert_eq!(r.messages, 1);
    }

    #[test]
    fn test_non_http_stream_yields_nothing() {
        assert!(HttpDecoder
            .transform(DecoderInput::Stream(&payload(b"\x16\x03\x01binary tls")))
            .is_none());
        assert!(HttpDecoder
            .transform(DecoderInput::Stream(&payload(b"GET / HTTP/1.1\r\nHost: x\r\n")))
            .is_none());
    }

    #[test]
    fn test_stream_record_summary() {
        let Some(Record::Stream(r)) = StreamDecoder.transform(DecoderInput::Stream(&payload(b"hi\x00\n"))) else {
            panic!("expected a stream record");
        };
        assert_eq!(r.duration_us, 250);
        assert_eq!(r.direction, "client");
        assert_eq!(r.preview, "hi\\x00\\n");
        assert_eq!(r.close_reason, "unknown");
        assert_eq!(r.fsm_state, "established");
        assert_eq!(r.anomalies, 2);
        assert!(r.partial);
    }

    #[test]
    fn test_packet_decoders_ignore_streams() {
        let p = payload(b"x");
        assert!(Ipv4Decoder.transform(DecoderInput::Stream(&p)).is_none());
        assert!(TcpDecoder.transform(DecoderInput::Stream(&p)).is_none());
    }
}
