use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes, checksum};

use crate::probe::packet::fill_payload;

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;

/// Get process identifier for ICMP identification field
pub fn get_identifier() -> u16 {
    std::process::id() as u16
}

/// Write an Echo Request into `buffer`, the payload being everything past the
/// ICMP header. `buffer` must hold at least the header.
///
/// Payload layout:
/// - Bytes 0-3: probe marker (truncated if the payload is shorter)
/// - Bytes 4+: pattern fill
pub fn write_echo_request(buffer: &mut [u8], identifier: u16, sequence: u16) {
    debug_assert!(buffer.len() >= ICMP_HEADER_SIZE);
    let Some(mut packet) = MutableEchoRequestPacket::new(buffer) else {
        return;
    };
    packet.set_icmp_type(IcmpTypes::EchoRequest);
    packet.set_icmp_code(IcmpCode::new(0));
    packet.set_identifier(identifier);
    packet.set_sequence_number(sequence);
    packet.set_checksum(0);
    fill_payload(packet.payload_mut());

    let cksum = IcmpPacket::new(buffer).map(|p| checksum(&p)).unwrap_or(0);
    if let Some(mut packet) = MutableEchoRequestPacket::new(buffer) {
        packet.set_checksum(cksum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::packet::PROBE_MARKER;
    use pnet::packet::icmp::echo_request::EchoRequestPacket;

    fn echo_request(identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
        let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload_size];
        write_echo_request(&mut buffer, identifier, sequence);
        buffer
    }

    #[test]
    fn test_write_echo_request() {
        let packet = echo_request(1234, 5678, 56);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + 56);
        assert_eq!(packet[0], 8); // Echo Request type
        assert_eq!(packet[1], 0); // Code

        let echo = EchoRequestPacket::new(&packet).unwrap();
        assert_eq!(echo.get_identifier(), 1234);
        assert_eq!(echo.get_sequence_number(), 5678);
        assert_eq!(&packet[ICMP_HEADER_SIZE..ICMP_HEADER_SIZE + 4], PROBE_MARKER);
    }

    #[test]
    fn test_checksum_valid() {
        let packet = echo_request(1, 2, 1400);
        let icmp = IcmpPacket::new(&packet).unwrap();
        assert_eq!(checksum(&icmp), icmp.get_checksum());
    }

    #[test]
    fn test_write_echo_request_small_payload() {
        let packet = echo_request(1234, 5678, 2);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + 2);
        assert_eq!(&packet[ICMP_HEADER_SIZE..], &PROBE_MARKER[..2]);

        let packet = echo_request(1234, 5678, 0);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE);
    }
}
