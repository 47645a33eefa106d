//! Format of a TPM2 command or response as seen on the TCTI data channel:
//! ```text
//! +-----+------+------+---------+
//! | TAG | SIZE | CODE | PAYLOAD |
//! +-----+------+------+---------+
//! |  2  |  4   |  4   |  SIZE-10|
//! +-----+------+------+---------+
//! ```
//!
//! All fields are big-endian. `SIZE` is the total length of the packet, header included. `CODE`
//! is the command code on commands and the response code on responses.

use std::{
    fmt,
    io::{Error, ErrorKind},
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::{
    serialize::{ByteRead, ByteWrite},
    tag::StructureTag,
};

/// The size (in bytes) of the TPM2 packet header.
pub const HEADER_SIZE: usize = 10;

/// The header fields of a TPM2 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tpm2Header {
    pub tag: u16,
    pub size: u32,
    pub code: u32,
}

impl Tpm2Header {
    /// Parses a header from the first [`HEADER_SIZE`] bytes of a buffer.
    ///
    /// Panics if the buffer is shorter than [`HEADER_SIZE`].
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            tag: u16::from_be_bytes([buf[0], buf[1]]),
            size: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            code: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        }
    }
}

/// A complete TPM2 command or response.
#[derive(Clone, PartialEq, Eq)]
pub struct Tpm2Packet {
    pub tag: u16,

    /// The total length of the packet as it was (or will be) on the wire, header included.
    pub size: u32,

    pub code: u32,
    pub payload: Bytes,
}

impl Tpm2Packet {
    /// Creates a packet, computing `size` from the payload's length.
    pub fn new(tag: u16, code: u32, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            tag,
            size: (HEADER_SIZE + payload.len()) as u32,
            code,
            payload,
        }
    }

    /// The size this packet has when serialized. This is computed from the payload and ignores
    /// the `size` field.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn header(&self) -> Tpm2Header {
        Tpm2Header {
            tag: self.tag,
            size: self.wire_size() as u32,
            code: self.code,
        }
    }

    pub fn structure_tag(&self) -> Option<StructureTag> {
        StructureTag::from_u16(self.tag)
    }

    /// Serializes this packet into its wire representation.
    pub fn serialize(&self) -> BytesMut {
        let header = self.header();
        let mut buf = BytesMut::with_capacity(self.wire_size());
        buf.put_u16(header.tag);
        buf.put_u32(header.size);
        buf.put_u32(header.code);
        buf.put_slice(&self.payload);
        buf
    }
}

impl fmt::Debug for Tpm2Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Tpm2Packet");
        match self.structure_tag() {
            Some(tag) => s.field("tag", &tag),
            None => s.field("tag", &format_args!("{:#06x}", self.tag)),
        };

        s.field("size", &self.size)
            .field("code", &format_args!("{:#010x}", self.code))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl ByteWrite for Tpm2Header {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<(), Error> {
        (self.tag, self.size, self.code).write(writer).await
    }
}

impl ByteRead for Tpm2Header {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let (tag, size, code) = <(u16, u32, u32)>::read(reader).await?;
        Ok(Self { tag, size, code })
    }
}

impl ByteWrite for Tpm2Packet {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<(), Error> {
        (self.header(), &self.payload[..]).write(writer).await
    }
}

impl ByteRead for Tpm2Packet {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let header = Tpm2Header::read(reader).await?;
        let size = header.size as usize;
        if size < HEADER_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("TPM2 packet size {size} is smaller than its header"),
            ));
        }

        let mut payload = vec![0u8; size - HEADER_SIZE];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            tag: header.tag,
            size: header.size,
            code: header.code,
            payload: Bytes::from(payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::{
        serialize::{ByteRead, ByteWrite},
        tag::StructureTag,
    };

    use super::{Tpm2Header, Tpm2Packet, HEADER_SIZE};

    #[test]
    fn test_serialize_empty() {
        let packet = Tpm2Packet::new(0x8001, 0x0, Bytes::new());
        assert_eq!(packet.size, 10);
        assert_eq!(&packet.serialize()[..], &[0x80, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_serialize_recomputes_size() {
        let mut packet = Tpm2Packet::new(0x8002, 0x0000_0144, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        packet.size = 9999;

        let bytes = packet.serialize();
        assert_eq!(bytes.len(), HEADER_SIZE + 4);
        assert_eq!(Tpm2Header::parse(&bytes).size, 14);
        assert_eq!(&bytes[HEADER_SIZE..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_structure_tag() {
        assert_eq!(Tpm2Packet::new(0x8001, 0, Bytes::new()).structure_tag(), Some(StructureTag::NoSessions));
        assert_eq!(Tpm2Packet::new(0x1234, 0, Bytes::new()).structure_tag(), None);
    }

    #[tokio::test]
    async fn test_async_write_matches_serialize() {
        let packet = Tpm2Packet::new(0x8001, 0x0000_017B, vec![0x00, 0x08]);
        let mut v = Vec::new();
        packet.write(&mut v).await.unwrap();
        assert_eq!(&v[..], &packet.serialize()[..]);

        let mut reader = &v[..];
        assert_eq!(Tpm2Packet::read(&mut reader).await.unwrap(), packet);
    }

    #[tokio::test]
    async fn test_async_read_rejects_short_size() {
        let bytes = [0x80, 0x01, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00];
        let error = Tpm2Packet::read(&mut &bytes[..]).await.unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }
}
