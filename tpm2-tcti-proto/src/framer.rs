//! Reassembles length-delimited TPM2 packets out of an arbitrarily fragmented byte stream.

use bytes::BytesMut;
use thiserror::Error;

use crate::{
    buffer::ReassemblyBuffer,
    packet::{Tpm2Header, Tpm2Packet, HEADER_SIZE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A header declared a total size smaller than the header itself. The stream cannot be
    /// resynchronized after this.
    #[error("declared TPM2 packet size {size} is smaller than the 10-byte header")]
    InvalidSize { size: u32 },
}

/// Turns a stream of bytes into a sequence of [`Tpm2Packet`].
///
/// Bytes are fed with [`Framer::ingest`] as they arrive and complete packets are taken out with
/// [`Framer::try_extract_packet`], one at a time.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: ReassemblyBuffer,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buffer: ReassemblyBuffer::new(),
        }
    }

    /// Appends received bytes. This never fails; malformed input is only detected when
    /// extracting.
    pub fn ingest(&mut self, chunk: &[u8]) {
        self.buffer.push(chunk);
    }

    /// The amount of bytes received and not yet consumed as part of a packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to take the next complete packet out of the buffered bytes.
    ///
    /// Returns `Ok(None)` if not enough bytes are buffered yet, in which case nothing is
    /// consumed. Returns [`FrameError::InvalidSize`] if the next header's size is smaller than
    /// the header, in which case nothing is consumed either.
    pub fn try_extract_packet(&mut self) -> Result<Option<Tpm2Packet>, FrameError> {
        let header = match self.buffer.peek(HEADER_SIZE) {
            Ok(bytes) => Tpm2Header::parse(bytes),
            Err(_) => return Ok(None),
        };

        if (header.size as usize) < HEADER_SIZE {
            return Err(FrameError::InvalidSize { size: header.size });
        }

        let mut raw = match self.buffer.pop(header.size as usize) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };

        let payload = raw.split_off(HEADER_SIZE);
        Ok(Some(Tpm2Packet {
            tag: header.tag,
            size: header.size,
            code: header.code,
            payload,
        }))
    }

    /// Serializes a packet into wire bytes. The size field is computed from the payload.
    pub fn serialize(packet: &Tpm2Packet) -> BytesMut {
        packet.serialize()
    }
}
