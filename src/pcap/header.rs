use std::{io::Error, time::Duration};

use tokio::io::AsyncWrite;
use tpm2_tcti_proto::serialize::ByteWrite;

pub const PCAP_MAGIC: u32 = 0xA1B2C3D4;

/// Raw IPv4/IPv6, with no link-layer header in front.
pub const LINKTYPE_RAW: u32 = 101;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// The header at the start of a capture file. All fields are written big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub gmt_offset: i32,
    pub timestamp_accuracy: u32,
    pub snapshot_length: u32,
    pub link_type: u32,
}

impl Default for GlobalHeader {
    fn default() -> Self {
        Self {
            major_version: 2,
            minor_version: 4,
            gmt_offset: 0,
            timestamp_accuracy: 0,
            snapshot_length: 65536,
            link_type: LINKTYPE_RAW,
        }
    }
}

impl ByteWrite for GlobalHeader {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<(), Error> {
        (PCAP_MAGIC, self.major_version, self.minor_version).write(writer).await?;
        (self.gmt_offset, self.timestamp_accuracy, self.snapshot_length, self.link_type).write(writer).await
    }
}

/// The header in front of every captured datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub seconds: u32,
    pub microseconds: u32,
    pub captured_length: u32,
    pub original_length: u32,
}

impl RecordHeader {
    pub fn new(timestamp: CaptureTimestamp, length: usize) -> Self {
        let (seconds, microseconds) = timestamp.split();
        Self {
            seconds,
            microseconds,
            captured_length: length as u32,
            original_length: length as u32,
        }
    }
}

impl ByteWrite for RecordHeader {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<(), Error> {
        (self.seconds, self.microseconds, self.captured_length, self.original_length).write(writer).await
    }
}

/// When a chunk was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTimestamp {
    /// Whole milliseconds since the unix epoch.
    Millis(u64),
    /// A time since the unix epoch with sub-millisecond precision.
    Exact(Duration),
}

impl CaptureTimestamp {
    pub fn now() -> Self {
        Self::Exact(crate::utils::since_epoch())
    }

    /// Splits this timestamp into whole seconds and microseconds, as stored in a record header.
    pub fn split(self) -> (u32, u32) {
        let (seconds, micros) = match self {
            Self::Millis(millis) => (millis / 1000, (millis % 1000) * 1000),
            Self::Exact(duration) => (duration.as_secs(), u64::from(duration.subsec_micros())),
        };

        (seconds as u32, bound_micros(micros))
    }
}

fn bound_micros(mut micros: u64) -> u32 {
    while micros >= MICROS_PER_SECOND {
        micros /= 10;
    }

    micros as u32
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tpm2_tcti_proto::serialize::ByteWrite;

    use super::{bound_micros, CaptureTimestamp, GlobalHeader, RecordHeader};

    #[tokio::test]
    async fn test_global_header_bytes() {
        let mut buf = Vec::new();
        GlobalHeader::default().write(&mut buf).await.unwrap();

        assert_eq!(buf.len(), 24);
        assert_eq!(
            buf,
            [
                0xA1, 0xB2, 0xC3, 0xD4, 0x00, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x65,
            ]
        );
    }

    #[tokio::test]
    async fn test_record_header_bytes() {
        let mut buf = Vec::new();
        RecordHeader::new(CaptureTimestamp::Millis(1_700_000_000_123), 38).write(&mut buf).await.unwrap();

        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[0..4], &1_700_000_000u32.to_be_bytes());
        assert_eq!(&buf[4..8], &123_000u32.to_be_bytes());
        assert_eq!(&buf[8..12], &38u32.to_be_bytes());
        assert_eq!(&buf[12..16], &38u32.to_be_bytes());
    }

    #[test]
    fn test_timestamp_split() {
        assert_eq!(CaptureTimestamp::Millis(0).split(), (0, 0));
        assert_eq!(CaptureTimestamp::Millis(1999).split(), (1, 999_000));
        assert_eq!(CaptureTimestamp::Exact(Duration::new(5, 123_456_789)).split(), (5, 123_456));
        assert_eq!(CaptureTimestamp::Exact(Duration::from_micros(7)).split(), (0, 7));
    }

    #[test]
    fn test_micros_are_bounded() {
        assert_eq!(bound_micros(999_999), 999_999);
        assert_eq!(bound_micros(1_000_000), 100_000);
        assert_eq!(bound_micros(123_456_789), 123_456);
    }
}
