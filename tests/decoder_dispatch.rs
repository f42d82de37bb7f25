//! Decoder selection and dispatch accounting.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use flowscope::capture::{CaptureInfo, DecodedPacket, IpHeader, Ipv4Header};
use flowscope::config::{ConfigError, DecoderConfig};
use flowscope::decoder::{
    builtin, Decoder, DecoderError, DecoderInput, DecoderInstance, DecoderKind, DecoderRegistry, DecoderSet, Record,
    RecordType,
};
use flowscope::writer::{AuditRecordWriter, MemorySink, RecordHeader, WriterError, WriterFactory, WriterSummary};

fn packet(id: u16, payload_len: usize) -> DecodedPacket {
    DecodedPacket {
        capture: CaptureInfo {
            timestamp_us: u64::from(id),
            ..Default::default()
        },
        ip: IpHeader::V4(Ipv4Header {
            ihl: 5,
            tos: 0,
            total_length: (20 + payload_len) as u16,
            identification: id,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: 17,
            checksum: 0,
            src: Ipv4Addr::new(192, 0, 2, 1),
            dst: Ipv4Addr::new(192, 0, 2, 2),
        }),
        tcp: None,
        payload: vec![0; payload_len],
        reassembled: false,
    }
}

fn config(include: &str, exclude: &str) -> DecoderConfig {
    DecoderConfig {
        include: include.into(),
        exclude: exclude.into(),
        ignore_init_errors: false,
    }
}

#[test]
fn test_include_then_exclude_leaves_one_decoder() {
    let sink = MemorySink::new();
    let set = DecoderSet::initialize(
        &DecoderRegistry::with_builtin(),
        &config("IPv4,TCP", "TCP"),
        &WriterFactory::memory(sink.clone()),
        None,
        "test",
    )
    .unwrap();

    let names: Vec<&str> = set.packet_decoders().iter().map(|d| d.name()).collect();
    assert_eq!(names, vec!["IPv4"]);
    assert!(!set.has_stream_decoders());
    assert_eq!(sink.names(), vec!["IPv4".to_string()]);
    assert!(sink.stream("IPv4").unwrap().header.is_some());
}

#[test]
fn test_unknown_decoder_fails_before_any_writer_opens() {
    let sink = MemorySink::new();
    for (include, exclude) in [("IPv4,DNS", ""), ("", "SMTP")] {
        let err = DecoderSet::initialize(
            &DecoderRegistry::with_builtin(),
            &config(include, exclude),
            &WriterFactory::memory(sink.clone()),
            None,
            "test",
        )
        .err()
        .expect("unknown decoder must fail");
        assert!(matches!(err, DecoderError::Config(ConfigError::UnknownDecoder(_))));
    }
    assert!(sink.names().is_empty());
}

/// A decoder whose post_init always fails.
struct Broken;

impl Decoder for Broken {
    fn name(&self) -> &str {
        "Broken"
    }
    fn description(&self) -> &str {
        "fails to initialize"
    }
    fn kind(&self) -> DecoderKind {
        DecoderKind::Packet
    }
    fn record_type(&self) -> RecordType {
        RecordType::Ipv4
    }
    fn post_init(&self) -> Result<(), String> {
        Err("no license".into())
    }
    fn transform(&self, _input: DecoderInput<'_>) -> Option<Record> {
        None
    }
}

#[test]
fn test_init_failure_is_fatal_unless_ignored() {
    let mut registry = DecoderRegistry::with_builtin();
    registry.register(|| Box::new(Broken));
    let writers = WriterFactory::memory(MemorySink::new());

    let err = DecoderSet::initialize(&registry, &config("Broken,IPv4", ""), &writers, None, "test")
        .err()
        .expect("init failure must be fatal");
    assert!(matches!(err, DecoderError::Init { ref name, .. } if name == "Broken"));

    let mut lenient = config("Broken,IPv4", "");
    lenient.ignore_init_errors = true;
    let set = DecoderSet::initialize(&registry, &lenient, &writers, None, "test").unwrap();
    let names: Vec<&str> = set.packet_decoders().iter().map(|d| d.name()).collect();
    assert_eq!(names, vec!["IPv4"]);
}

/// Writer that refuses the records whose IPv4 identification is listed.
struct Flaky {
    fail_ids: HashSet<u16>,
    records: u64,
}

impl AuditRecordWriter for Flaky {
    fn write_header(&mut self, _header: &RecordHeader) -> Result<(), WriterError> {
        Ok(())
    }

    fn write(&mut self, record: &Record) -> Result<(), WriterError> {
        if let Record::Ipv4(r) = record {
            if self.fail_ids.contains(&r.id) {
                return Err(WriterError::Rejected(format!("id {}", r.id)));
            }
        }
        self.records += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<WriterSummary, WriterError> {
        Ok(WriterSummary {
            name: "Flaky".into(),
            records: self.records,
            bytes: 0,
        })
    }
}

/// Emits a record only for packets carrying a payload.
struct PayloadOnly;

impl Decoder for PayloadOnly {
    fn name(&self) -> &str {
        "PayloadOnly"
    }
    fn description(&self) -> &str {
        "IPv4 records for non-empty packets"
    }
    fn kind(&self) -> DecoderKind {
        DecoderKind::Packet
    }
    fn record_type(&self) -> RecordType {
        RecordType::Ipv4
    }
    fn transform(&self, input: DecoderInput<'_>) -> Option<Record> {
        match input {
            DecoderInput::Packet(p) if !p.payload.is_empty() => builtin::ipv4_record(p),
            _ => None,
        }
    }
}

#[test]
fn test_written_count_with_failing_writer() {
    // N = 10 inputs, K = 6 produce a record, 2 of those fail to write
    let lens = [0usize, 4, 4, 0, 8, 0, 2, 0, 1, 9];
    let producing: Vec<u16> = (0..lens.len() as u16).filter(|i| lens[*i as usize] > 0).collect();
    let k = producing.len() as u64;
    let fail_ids: HashSet<u16> = producing.iter().take(2).copied().collect();

    let instance = DecoderInstance::new(
        Box::new(PayloadOnly),
        Box::new(Flaky {
            fail_ids,
            records: 0,
        }),
        None,
    );
    let mut errors = 0;
    for (id, len) in lens.iter().enumerate() {
        if instance.decode(DecoderInput::Packet(&packet(id as u16, *len))).is_err() {
            errors += 1;
        }
    }

    assert_eq!(errors, 2);
    assert_eq!(instance.write_failures(), 2);
    let summary = instance.destroy().unwrap();
    assert_eq!(summary.records, k);
    assert_eq!(summary.written, k - 2);
    assert!(summary.written <= summary.records);
}

#[test]
fn test_ipv6_has_no_ipv4_record() {
    use flowscope::capture::Ipv6Header;
    let p = DecodedPacket {
        capture: CaptureInfo::default(),
        ip: IpHeader::V6(Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_length: 0,
            next_header: 17,
            hop_limit: 64,
            src: "2001:db8::1".parse().unwrap(),
            dst: "2001:db8::2".parse().unwrap(),
        }),
        tcp: None,
        payload: Vec::new(),
        reassembled: false,
    };
    assert!(builtin::ipv4_record(&p).is_none());
    assert_eq!(p.ip.src(), "2001:db8::1".parse::<IpAddr>().unwrap());
}
