//! Writes the traffic crossing the proxy into a libpcap capture file.
//!
//! Every chunk read from either side is wrapped in a synthetic IPv4/UDP datagram whose addresses
//! and ports identify its direction and channel, then appended as one record:
//!
//! | Direction          | Source port | Destination port | First identification |
//! |--------------------|-------------|------------------|----------------------|
//! | upstream control   | 2321        | 10001            | 1                    |
//! | upstream data      | 2322        | 10002            | 2                    |
//! | downstream control | 10001       | 2321             | 1                    |
//! | downstream data    | 10002       | 2322             | 2                    |
//!
//! All addresses are `127.0.0.1`.

use std::{fmt, io, net::Ipv4Addr, path::Path};

use bytes::Bytes;
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
};
use tpm2_tcti_proto::serialize::ByteWrite;
use tracing::debug;

use crate::{driver::Channel, proxy::Side};

mod header;
mod pseudo_udp;

pub use header::{CaptureTimestamp, GlobalHeader, RecordHeader, LINKTYPE_RAW, PCAP_MAGIC};
pub use pseudo_udp::{internet_checksum, PseudoIpv4Udp, PseudoUdpFlow, MAX_UDP_PAYLOAD};

/// The side and channel a captured chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    UpstreamControl,
    UpstreamData,
    DownstreamControl,
    DownstreamData,
}

impl Direction {
    pub const ALL: [Direction; 4] = [Self::UpstreamControl, Self::UpstreamData, Self::DownstreamControl, Self::DownstreamData];

    pub const fn new(side: Side, channel: Channel) -> Self {
        match (side, channel) {
            (Side::Upstream, Channel::Control) => Self::UpstreamControl,
            (Side::Upstream, Channel::Data) => Self::UpstreamData,
            (Side::Downstream, Channel::Control) => Self::DownstreamControl,
            (Side::Downstream, Channel::Data) => Self::DownstreamData,
        }
    }

    /// The synthetic addressing this direction's chunks are captured with.
    pub const fn flow(self) -> PseudoUdpFlow {
        let (source_port, destination_port, identification) = match self {
            Self::UpstreamControl => (2321, 10001, 1),
            Self::UpstreamData => (2322, 10002, 2),
            Self::DownstreamControl => (10001, 2321, 1),
            Self::DownstreamData => (10002, 2322, 2),
        };

        PseudoUdpFlow {
            source: Ipv4Addr::LOCALHOST,
            source_port,
            destination: Ipv4Addr::LOCALHOST,
            destination_port,
            identification,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpstreamControl => f.write_str("upstream control"),
            Self::UpstreamData => f.write_str("upstream data"),
            Self::DownstreamControl => f.write_str("downstream control"),
            Self::DownstreamData => f.write_str("downstream data"),
        }
    }
}

/// A chunk of bytes exactly as it was read from one of the proxy's connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub timestamp: CaptureTimestamp,
    pub direction: Direction,
    pub payload: Bytes,
}

impl CapturedPacket {
    pub fn now(direction: Direction, payload: Bytes) -> Self {
        Self {
            timestamp: CaptureTimestamp::now(),
            direction,
            payload,
        }
    }
}

/// Streams captured chunks into a pcap file.
pub struct CaptureWriter<W = BufWriter<File>> {
    writer: W,
    flows: [PseudoIpv4Udp; 4],
    records: u64,
}

impl CaptureWriter<BufWriter<File>> {
    /// Creates (or truncates) the file at `path` and writes the global header to it.
    pub async fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path.as_ref()).await?;
        debug!("Writing packet capture to {}", path.as_ref().display());
        Self::new(BufWriter::new(file)).await
    }
}

impl<W: AsyncWrite + Unpin> CaptureWriter<W> {
    pub async fn new(writer: W) -> io::Result<Self> {
        Self::with_header(writer, GlobalHeader::default()).await
    }

    pub async fn with_header(mut writer: W, header: GlobalHeader) -> io::Result<Self> {
        header.write(&mut writer).await?;

        Ok(Self {
            writer,
            flows: Direction::ALL.map(|direction| PseudoIpv4Udp::new(direction.flow())),
            records: 0,
        })
    }

    /// Appends a chunk as one record, or as several if it doesn't fit in a single datagram.
    pub async fn write_packet(&mut self, packet: &CapturedPacket) -> io::Result<()> {
        let flow = &mut self.flows[packet.direction.index()];

        for chunk in packet.payload.chunks(MAX_UDP_PAYLOAD) {
            let datagram = flow.generate(chunk);
            RecordHeader::new(packet.timestamp, datagram.len()).write(&mut self.writer).await?;
            self.writer.write_all(&datagram).await?;
            self.records += 1;
        }

        Ok(())
    }

    /// How many records were written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flushes everything written so far and returns the underlying writer.
    pub async fn finish(mut self) -> io::Result<W> {
        self.writer.flush().await?;
        Ok(self.writer)
    }
}
