//! Frame classification into the traffic classes the engine routes.

use bitflags::bitflags;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::udp::UdpPacket;

use crate::capture::frame::{Frame, split_ipv4};

/// UDP port for NAT-traversal encapsulated ESP (RFC 3948)
pub const NAT_T_PORT: u16 = 4500;
/// ICMP header size preceding the quoted datagram in error messages
const ICMP_ERROR_HEADER_SIZE: usize = 8;
/// UDP header size
const UDP_HEADER_SIZE: usize = 8;

bitflags! {
    /// Traffic classes a frame belongs to. Empty means "other".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Classes: u8 {
        const ESP = 0b01;
        const ICMPV4 = 0b10;
    }
}

impl Classes {
    /// Neither ESP nor ICMPv4
    pub fn is_other(self) -> bool {
        self.is_empty()
    }
}

/// Classification capability the capture engine depends on
pub trait Classify: Send {
    fn classify(&self, frame: &Frame) -> Classes;
}

/// Classifier that walks the frame's protocol layers
#[derive(Debug, Default, Clone, Copy)]
pub struct LayerClassifier;

impl Classify for LayerClassifier {
    fn classify(&self, frame: &Frame) -> Classes {
        frame
            .ipv4_bytes()
            .map(classify_ipv4)
            .unwrap_or_default()
    }
}

/// Classify an IPv4 datagram
pub fn classify_ipv4(bytes: &[u8]) -> Classes {
    let Some((ip, payload)) = split_ipv4(bytes) else {
        return Classes::empty();
    };
    // Later fragments carry no transport header
    if ip.get_fragment_offset() != 0 {
        return Classes::empty();
    }

    match ip.get_next_level_protocol() {
        IpNextHeaderProtocols::Esp => Classes::ESP,
        IpNextHeaderProtocols::Udp if is_udp_encapsulated_esp(payload) => Classes::ESP,
        IpNextHeaderProtocols::Icmp => {
            let Some(icmp) = IcmpPacket::new(payload) else {
                return Classes::empty();
            };
            if quotes_esp(&icmp, payload) {
                Classes::ICMPV4 | Classes::ESP
            } else {
                Classes::ICMPV4
            }
        }
        _ => Classes::empty(),
    }
}

/// UDP on the NAT-T port whose payload starts with a non-zero SPI.
///
/// A zero first word is the IKE non-ESP marker and a single 0xFF byte is a
/// NAT-keepalive; neither is ESP.
fn is_udp_encapsulated_esp(payload: &[u8]) -> bool {
    let Some(udp) = UdpPacket::new(payload) else {
        return false;
    };
    if udp.get_source() != NAT_T_PORT && udp.get_destination() != NAT_T_PORT {
        return false;
    }
    let Some(spi) = payload.get(UDP_HEADER_SIZE..UDP_HEADER_SIZE + 4) else {
        return false;
    };
    spi != [0, 0, 0, 0]
}

/// ICMP error messages quoting an ESP datagram
fn quotes_esp(icmp: &IcmpPacket<'_>, payload: &[u8]) -> bool {
    let icmp_type = icmp.get_icmp_type();
    if icmp_type != IcmpTypes::DestinationUnreachable
        && icmp_type != IcmpTypes::TimeExceeded
        && icmp_type != IcmpTypes::ParameterProblem
    {
        return false;
    }
    let Some(quoted) = payload.get(ICMP_ERROR_HEADER_SIZE..) else {
        return false;
    };
    split_ipv4(quoted).is_some_and(|(ip, _)| ip.get_next_level_protocol() == IpNextHeaderProtocols::Esp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::LinkType;

    fn ipv4(protocol: u8, payload: &[u8]) -> Vec<u8> {
        let total = 20 + payload.len();
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = protocol;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
        ip.extend_from_slice(payload);
        ip
    }

    fn classify(data: Vec<u8>) -> Classes {
        LayerClassifier.classify(&Frame::new(LinkType::RawIp, data))
    }

    #[test]
    fn test_esp() {
        let esp = ipv4(50, &[0, 0, 0x10, 0x01, 0, 0, 0, 1, 0xAA, 0xBB]);
        assert_eq!(classify(esp), Classes::ESP);
    }

    #[test]
    fn test_icmp_echo() {
        let echo = ipv4(1, &[0, 0, 0, 0, 0x12, 0x34, 0, 1]);
        assert_eq!(classify(echo), Classes::ICMPV4);
    }

    #[test]
    fn test_other() {
        let tcp = ipv4(6, &[0u8; 20]);
        assert!(classify(tcp).is_other());
        assert!(classify(vec![0x60; 40]).is_other());
        assert!(classify(Vec::new()).is_other());
    }

    #[test]
    fn test_nat_t() {
        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&NAT_T_PORT.to_be_bytes());
        udp[2..4].copy_from_slice(&NAT_T_PORT.to_be_bytes());
        udp[4..6].copy_from_slice(&16u16.to_be_bytes());
        let mut esp = udp.clone();
        esp.extend_from_slice(&[0, 0, 0x10, 0x01, 0, 0, 0, 7]);
        assert_eq!(classify(ipv4(17, &esp)), Classes::ESP);

        // IKE non-ESP marker
        let mut ike = udp.clone();
        ike.extend_from_slice(&[0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(classify(ipv4(17, &ike)).is_other());

        // Keepalive
        let mut keepalive = udp;
        keepalive.push(0xFF);
        assert!(classify(ipv4(17, &keepalive)).is_other());
    }

    #[test]
    fn test_icmp_error_quoting_esp_fans_out() {
        let quoted = ipv4(50, &[0, 0, 0x10, 0x01, 0, 0, 0, 1]);
        let mut icmp = vec![3, 4, 0, 0, 0, 0, 0x05, 0x78];
        icmp.extend_from_slice(&quoted);
        assert_eq!(classify(ipv4(1, &icmp)), Classes::ESP | Classes::ICMPV4);
    }

    #[test]
    fn test_later_fragment_ignored() {
        let mut esp = ipv4(50, &[0u8; 16]);
        // Fragment offset 185 (1480 bytes)
        esp[6..8].copy_from_slice(&185u16.to_be_bytes());
        assert!(classify(esp).is_other());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn proptest_classify_no_panic(data in prop::collection::vec(0u8..=255, 0..1500)) {
                let _ = classify(data.clone());
                let _ = LayerClassifier.classify(&Frame::new(LinkType::Ethernet, data.clone()));
                let _ = LayerClassifier.classify(&Frame::new(LinkType::LinuxSll, data.clone()));
                let _ = LayerClassifier.classify(&Frame::new(LinkType::Null, data));
            }

            #[test]
            fn proptest_esp_never_icmp(payload in prop::collection::vec(0u8..=255, 8..200)) {
                prop_assert_eq!(classify(ipv4(50, &payload)), Classes::ESP);
            }
        }
    }
}
