//! Optional packet capture sink for both traffic directions of a session.

use std::fs::File;
use std::path::Path;
use std::time::UNIX_EPOCH;

use pcap_file::pcap::{PcapPacket, PcapWriter};

use crate::error::AppResult;

/// Wraps a `PcapWriter` so both the transmit and receive directions of a
/// session can be recorded to one capture file.
pub struct PacketSink {
    writer: PcapWriter<File>,
}

impl PacketSink {
    pub fn create(path: &Path) -> AppResult<Self> {
        let file = File::options().create(true).write(true).truncate(true).open(path)?;
        let writer = PcapWriter::new(file)
            .map_err(|error| crate::error::AppError::Config(format!("pcap: {error}")))?;
        tracing::info!(?path, "recording packet capture");
        Ok(Self { writer })
    }

    pub fn record(&mut self, packet: &[u8]) {
        let pkt = PcapPacket {
            timestamp: UNIX_EPOCH.elapsed().unwrap_or_default(),
            orig_len: packet.len() as u32,
            data: std::borrow::Cow::Borrowed(packet),
        };
        if let Err(error) = self.writer.write_packet(&pkt) {
            tracing::warn!(?error, "failed to write pcap packet");
        }
    }
}
