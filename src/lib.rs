//! A man-in-the-middle proxy for the swtpm TCTI protocol.
//!
//! The proxy sits between an upstream simulator and a downstream TPM client, each reached through
//! an [`EndpointDriver`](driver::EndpointDriver) carrying a control and a data channel. Control
//! traffic is forwarded untouched, while the data channel is reframed into whole
//! [`Tpm2Packet`](tpm2_tcti_proto::Tpm2Packet)s and handed to user-supplied handlers, which may
//! inspect, rewrite, or drop them. Everything crossing the proxy can be recorded to a pcap file.

pub mod address;
pub mod driver;
pub mod pcap;
pub mod proxy;
pub mod utils;

pub use tpm2_tcti_proto as proto;
