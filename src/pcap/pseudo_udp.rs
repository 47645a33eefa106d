//! Synthesizes IPv4/UDP datagrams around raw payloads so captures are legible to packet analysers.

use std::net::Ipv4Addr;

pub const IPV4_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

/// The largest payload a single datagram can carry, limited by the IPv4 total length field.
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize - IPV4_HEADER_SIZE - UDP_HEADER_SIZE;

const IPV4_VERSION_IHL: u8 = 0x45;
const FLAG_DONT_FRAGMENT: u8 = 0x40;
const DEFAULT_TTL: u8 = 64;
const PROTOCOL_UDP: u8 = 17;

/// The fixed addressing of one synthetic stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoUdpFlow {
    pub source: Ipv4Addr,
    pub source_port: u16,
    pub destination: Ipv4Addr,
    pub destination_port: u16,
    /// The identification given to this flow's first datagram.
    pub identification: u16,
}

/// Wraps payloads in IPv4/UDP headers for one flow, numbering each datagram.
#[derive(Debug, Clone)]
pub struct PseudoIpv4Udp {
    flow: PseudoUdpFlow,
    next_identification: u16,
}

impl PseudoIpv4Udp {
    pub const fn new(flow: PseudoUdpFlow) -> Self {
        Self {
            next_identification: flow.identification,
            flow,
        }
    }

    /// Builds the next datagram of this flow around `payload`.
    ///
    /// # Panics
    /// Panics if `payload` is longer than [`MAX_UDP_PAYLOAD`].
    pub fn generate(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.len() > MAX_UDP_PAYLOAD {
            panic!("Payload too long for a single datagram ({} > {MAX_UDP_PAYLOAD})", payload.len());
        }

        let udp_length = (UDP_HEADER_SIZE + payload.len()) as u16;
        let total_length = (IPV4_HEADER_SIZE + UDP_HEADER_SIZE + payload.len()) as u16;
        let identification = self.next_identification;
        self.next_identification = self.next_identification.wrapping_add(1);

        let mut datagram = Vec::with_capacity(total_length as usize);
        datagram.extend_from_slice(&[IPV4_VERSION_IHL, 0]);
        datagram.extend_from_slice(&total_length.to_be_bytes());
        datagram.extend_from_slice(&identification.to_be_bytes());
        datagram.extend_from_slice(&[FLAG_DONT_FRAGMENT, 0, DEFAULT_TTL, PROTOCOL_UDP, 0, 0]);
        datagram.extend_from_slice(&self.flow.source.octets());
        datagram.extend_from_slice(&self.flow.destination.octets());

        let ip_checksum = internet_checksum(&datagram[..IPV4_HEADER_SIZE]);
        datagram[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

        datagram.extend_from_slice(&self.flow.source_port.to_be_bytes());
        datagram.extend_from_slice(&self.flow.destination_port.to_be_bytes());
        datagram.extend_from_slice(&udp_length.to_be_bytes());
        datagram.extend_from_slice(&[0, 0]);
        datagram.extend_from_slice(payload);

        let udp_checksum = match udp_checksum(&self.flow, &datagram[IPV4_HEADER_SIZE..]) {
            0 => 0xFFFF,
            checksum => checksum,
        };
        datagram[26..28].copy_from_slice(&udp_checksum.to_be_bytes());

        datagram
    }
}

/// Adds up big-endian 16-bit words, padding an odd trailing byte with a zero.
fn ones_complement_sum(data: &[u8], mut sum: u32) -> u32 {
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }

    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }

    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum as u16
}

/// Computes the RFC 1071 checksum over bytes.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(ones_complement_sum(data, 0))
}

/// Computes the UDP checksum of a segment, covering the IPv4 pseudo-header.
fn udp_checksum(flow: &PseudoUdpFlow, segment: &[u8]) -> u16 {
    let mut sum = ones_complement_sum(&flow.source.octets(), 0);
    sum = ones_complement_sum(&flow.destination.octets(), sum);
    sum += u32::from(PROTOCOL_UDP);
    sum += segment.len() as u32;
    !fold(ones_complement_sum(segment, sum))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::{fold, ones_complement_sum, PseudoIpv4Udp, PseudoUdpFlow, IPV4_HEADER_SIZE, MAX_UDP_PAYLOAD};

    const FLOW: PseudoUdpFlow = PseudoUdpFlow {
        source: Ipv4Addr::new(10, 0, 0, 1),
        source_port: 2321,
        destination: Ipv4Addr::new(192, 168, 7, 9),
        destination_port: 10001,
        identification: 0xFFFF,
    };

    fn verifies(header_sum: u32, data: &[u8]) -> bool {
        fold(ones_complement_sum(data, header_sum)) == 0xFFFF
    }

    fn pseudo_header_sum(datagram: &[u8]) -> u32 {
        let mut sum = ones_complement_sum(&datagram[12..20], 0);
        sum += 17;
        sum += (datagram.len() - IPV4_HEADER_SIZE) as u32;
        sum
    }

    #[test]
    fn test_layout() {
        let mut generator = PseudoIpv4Udp::new(FLOW);
        let datagram = generator.generate(&[0x80, 0x01, 0x00]);

        assert_eq!(datagram.len(), 31);
        assert_eq!(datagram[0], 0x45);
        assert_eq!(&datagram[2..4], &31u16.to_be_bytes());
        assert_eq!(&datagram[4..6], &[0xFF, 0xFF]);
        assert_eq!(&datagram[6..10], &[0x40, 0x00, 64, 17]);
        assert_eq!(&datagram[12..16], &[10, 0, 0, 1]);
        assert_eq!(&datagram[16..20], &[192, 168, 7, 9]);
        assert_eq!(&datagram[20..22], &2321u16.to_be_bytes());
        assert_eq!(&datagram[22..24], &10001u16.to_be_bytes());
        assert_eq!(&datagram[24..26], &11u16.to_be_bytes());
        assert_eq!(&datagram[28..], &[0x80, 0x01, 0x00]);
    }

    #[test]
    fn test_checksums_verify() {
        let mut generator = PseudoIpv4Udp::new(FLOW);
        for len in [0, 1, 2, 9, 10, 255, 1024, MAX_UDP_PAYLOAD] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let datagram = generator.generate(&payload);

            assert!(verifies(0, &datagram[..IPV4_HEADER_SIZE]), "IPv4 checksum, payload of {len}");
            assert!(verifies(pseudo_header_sum(&datagram), &datagram[IPV4_HEADER_SIZE..]), "UDP checksum, payload of {len}");
        }
    }

    #[test]
    fn test_identification_increments_and_wraps() {
        let mut generator = PseudoIpv4Udp::new(FLOW);
        let identifications: Vec<[u8; 2]> = (0..3).map(|_| generator.generate(&[1])).map(|d| [d[4], d[5]]).collect();
        assert_eq!(identifications, [[0xFF, 0xFF], [0x00, 0x00], [0x00, 0x01]]);
    }

    #[test]
    #[should_panic]
    fn test_oversized_payload() {
        PseudoIpv4Udp::new(FLOW).generate(&vec![0; MAX_UDP_PAYLOAD + 1]);
    }
}
