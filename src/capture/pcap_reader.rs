//! Streaming reader for legacy pcap files.
//!
//! Packets are read lazily through `pcap-parser`'s buffered reader so that
//! captures larger than memory can be processed.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};

use super::{CaptureInfo, LinkType, Packet};

/// Magic number of pcap files with nanosecond timestamps.
const PCAP_MAGIC_NANOS: u32 = 0xa1b2_3c4d;

/// Streams packets from a pcap file.
pub struct PcapReader {
    path: PathBuf,
}

impl PcapReader {
    /// Open a pcap file for reading.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::metadata(&path).with_context(|| format!("pcap file not found: {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return an iterator over all packets in the file.
    pub fn packets(&self) -> Result<PacketIterator> {
        PacketIterator::new(&self.path)
    }
}

/// Iterator that lazily reads packets from a pcap file.
pub struct PacketIterator {
    reader: LegacyPcapReader<BufReader<File>>,
    nanosecond_timestamps: bool,
    link_type: LinkType,
    done: bool,
}

impl PacketIterator {
    fn new(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open pcap: {}", path.display()))?;
        let buf = BufReader::with_capacity(256 * 1024, file);
        let reader =
            LegacyPcapReader::new(65536, buf).map_err(|e| anyhow!("failed to create pcap reader: {:?}", e))?;
        Ok(Self {
            reader,
            nanosecond_timestamps: false,
            link_type: LinkType::default(),
            done: false,
        })
    }
}

impl Iterator for PacketIterator {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let packet = match block {
                        PcapBlockOwned::LegacyHeader(hdr) => {
                            self.nanosecond_timestamps = hdr.magic_number == PCAP_MAGIC_NANOS;
                            self.link_type = LinkType::from(hdr.network);
                            if !self.link_type.is_supported() {
                                tracing::warn!(
                                    linktype = %hdr.network,
                                    "unsupported link type, packets will not be decoded"
                                );
                            }
                            None
                        }
                        PcapBlockOwned::Legacy(pkt) => {
                            let fraction = if self.nanosecond_timestamps {
                                pkt.ts_usec as u64 / 1_000
                            } else {
                                pkt.ts_usec as u64
                            };
                            Some(Packet {
                                info: CaptureInfo {
                                    timestamp_us: (pkt.ts_sec as u64) * 1_000_000 + fraction,
                                    capture_length: pkt.caplen,
                                    wire_length: pkt.origlen,
                                },
                                link_type: self.link_type,
                                data: pkt.data.to_vec(),
                            })
                        }
                        _ => None,
                    };
                    self.reader.consume(offset);
                    if let Some(packet) = packet {
                        return Some(Ok(packet));
                    }
                }
                Err(PcapError::Eof) => {
                    self.done = true;
                    return None;
                }
                Err(PcapError::Incomplete(_)) => {
                    if let Err(e) = self.reader.refill() {
                        self.done = true;
                        return Some(Err(anyhow!("pcap refill failed: {:?}", e)));
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(anyhow!("pcap read error: {:?}", e)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_pcap_reader_missing_file() {
        let r = PcapReader::new("/nonexistent/file.pcap");
        assert!(r.is_err());
    }

    #[test]
    fn test_reads_packets_with_capture_info() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&65535u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        for (sec, usec) in [(1u32, 5u32), (2, 7)] {
            bytes.extend_from_slice(&sec.to_le_bytes());
            bytes.extend_from_slice(&usec.to_le_bytes());
            bytes.extend_from_slice(&3u32.to_le_bytes());
            bytes.extend_from_slice(&60u32.to_le_bytes());
            bytes.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        }

        let path = std::env::temp_dir().join(format!("flowscope_reader_{}.pcap", std::process::id()));
        std::fs::File::create(&path).unwrap().write_all(&bytes).unwrap();

        let packets: Vec<Packet> = PcapReader::new(&path)
            .unwrap()
            .packets()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].info.timestamp_us, 1_000_005);
        assert_eq!(packets[1].info.timestamp_us, 2_000_007);
        assert_eq!(packets[0].info.capture_length, 3);
        assert_eq!(packets[0].info.wire_length, 60);
        assert_eq!(packets[1].data, vec![0xaa, 0xbb, 0xcc]);
        assert_eq!(packets[0].link_type, LinkType::Ethernet);
    }

    #[test]
    fn test_link_type_from_header() {
        assert_eq!(LinkType::from(pcap_parser::Linktype(101)), LinkType::Raw);
        assert_eq!(LinkType::from(pcap_parser::Linktype(113)), LinkType::LinuxSll);
        assert_eq!(LinkType::from(pcap_parser::Linktype(0)), LinkType::Null);
        assert_eq!(LinkType::from(pcap_parser::Linktype(147)), LinkType::Unsupported(147));
        assert!(!LinkType::Unsupported(147).is_supported());
    }
}
