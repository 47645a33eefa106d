//! Sans-io building blocks for relaying the TPM2 TCTI data channel: a reassembly buffer, the
//! packet type and its wire format, and the framer that turns a fragmented byte stream back into
//! whole packets.
//!
//! Nothing in this crate touches a socket. The async [`ByteRead`](serialize::ByteRead) and
//! [`ByteWrite`](serialize::ByteWrite) traits operate on any tokio reader or writer.

pub mod buffer;
pub mod framer;
pub mod packet;
pub mod serialize;
pub mod tag;

pub use buffer::{BufferError, ReassemblyBuffer};
pub use framer::{FrameError, Framer};
pub use packet::{Tpm2Header, Tpm2Packet, HEADER_SIZE};
pub use tag::StructureTag;
