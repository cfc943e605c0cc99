//! Captured frames and link-layer stripping.

use pcap_file::DataLink;
use pnet::packet::ipv4::Ipv4Packet;
use std::time::Instant;

/// Ethernet header size (no VLAN tag)
const ETHERNET_HEADER_SIZE: usize = 14;
/// 802.1Q tag size
const VLAN_TAG_SIZE: usize = 4;
/// Linux cooked capture (SLL) header size
const LINUX_SLL_HEADER_SIZE: usize = 16;
/// BSD loopback header size (address family, host byte order)
const NULL_HEADER_SIZE: usize = 4;
/// Minimum IPv4 header size
pub const IPV4_HEADER_SIZE: usize = 20;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;
const AF_INET: u32 = 2;

/// Link layer framing of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II, optionally 802.1Q tagged
    Ethernet,
    /// Linux cooked capture (the "any" pseudo-device)
    LinuxSll,
    /// No link header, frame starts with the IP header
    RawIp,
    /// BSD null/loopback encapsulation
    Null,
}

impl LinkType {
    /// Map a pcap link type to one we can strip, None if unsupported
    pub fn from_datalink(datalink: DataLink) -> Option<Self> {
        match datalink {
            DataLink::ETHERNET => Some(Self::Ethernet),
            DataLink::LINUX_SLL => Some(Self::LinuxSll),
            DataLink::RAW | DataLink::IPV4 => Some(Self::RawIp),
            DataLink::NULL | DataLink::LOOP => Some(Self::Null),
            _ => None,
        }
    }
}

/// A captured packet
#[derive(Debug, Clone)]
pub struct Frame {
    pub link: LinkType,
    pub data: Vec<u8>,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(link: LinkType, data: Vec<u8>) -> Self {
        Self {
            link,
            data,
            captured_at: Instant::now(),
        }
    }

    /// Bytes of the network layer if the frame carries IPv4
    pub fn ipv4_bytes(&self) -> Option<&[u8]> {
        let data = self.data.as_slice();
        let network = match self.link {
            LinkType::Ethernet => {
                let mut offset = ETHERNET_HEADER_SIZE;
                let mut ethertype = read_u16(data, 12)?;
                // Skip up to two VLAN tags
                for _ in 0..2 {
                    if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_QINQ {
                        break;
                    }
                    ethertype = read_u16(data, offset + 2)?;
                    offset += VLAN_TAG_SIZE;
                }
                if ethertype != ETHERTYPE_IPV4 {
                    return None;
                }
                data.get(offset..)?
            }
            LinkType::LinuxSll => {
                if read_u16(data, 14)? != ETHERTYPE_IPV4 {
                    return None;
                }
                data.get(LINUX_SLL_HEADER_SIZE..)?
            }
            LinkType::RawIp => data,
            LinkType::Null => {
                let family = data.get(..NULL_HEADER_SIZE)?;
                let family = [family[0], family[1], family[2], family[3]];
                // Written in the capturing host's byte order
                if u32::from_le_bytes(family) != AF_INET && u32::from_be_bytes(family) != AF_INET {
                    return None;
                }
                &data[NULL_HEADER_SIZE..]
            }
        };

        if network.len() < IPV4_HEADER_SIZE || network[0] >> 4 != 4 {
            return None;
        }
        Some(network)
    }

    /// Parsed IPv4 header and the payload it covers
    pub fn ipv4(&self) -> Option<(Ipv4Packet<'_>, &[u8])> {
        split_ipv4(self.ipv4_bytes()?)
    }
}

/// Split an IPv4 datagram into header and payload.
///
/// The payload is bounded by both the total length field and the captured
/// bytes, so truncated snapshots and quoted headers inside ICMP errors work.
pub fn split_ipv4(bytes: &[u8]) -> Option<(Ipv4Packet<'_>, &[u8])> {
    let packet = Ipv4Packet::new(bytes)?;
    if packet.get_version() != 4 {
        return None;
    }
    let header_len = packet.get_header_length() as usize * 4;
    if header_len < IPV4_HEADER_SIZE || bytes.len() < header_len {
        return None;
    }
    let total_len = (packet.get_total_length() as usize).max(header_len);
    let end = total_len.min(bytes.len());
    Some((packet, &bytes[header_len..end]))
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_header(protocol: u8) -> Vec<u8> {
        let mut ip = vec![0u8; 28];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&28u16.to_be_bytes());
        ip[9] = protocol;
        ip
    }

    #[test]
    fn test_raw_ip() {
        let frame = Frame::new(LinkType::RawIp, ipv4_header(1));
        let (ip, payload) = frame.ipv4().unwrap();
        assert_eq!(ip.get_next_level_protocol().0, 1);
        assert_eq!(payload.len(), 8);
    }

    #[test]
    fn test_ethernet_with_vlan() {
        let mut data = vec![0u8; 12];
        data.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x64]);
        data.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        data.extend(ipv4_header(50));
        let frame = Frame::new(LinkType::Ethernet, data);
        let (ip, _) = frame.ipv4().unwrap();
        assert_eq!(ip.get_next_level_protocol().0, 50);
    }

    #[test]
    fn test_ethernet_non_ipv4() {
        let mut data = vec![0u8; 12];
        data.extend_from_slice(&0x0806u16.to_be_bytes()); // ARP
        data.extend(vec![0u8; 28]);
        assert!(Frame::new(LinkType::Ethernet, data).ipv4().is_none());
    }

    #[test]
    fn test_linux_sll() {
        let mut data = vec![0u8; 14];
        data.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        data.extend(ipv4_header(1));
        assert!(Frame::new(LinkType::LinuxSll, data).ipv4().is_some());
    }

    #[test]
    fn test_null_either_byte_order() {
        let mut le = 2u32.to_le_bytes().to_vec();
        le.extend(ipv4_header(1));
        assert!(Frame::new(LinkType::Null, le).ipv4().is_some());

        let mut be = 2u32.to_be_bytes().to_vec();
        be.extend(ipv4_header(1));
        assert!(Frame::new(LinkType::Null, be).ipv4().is_some());
    }

    #[test]
    fn test_ipv6_rejected() {
        let mut data = vec![0u8; 40];
        data[0] = 0x60;
        assert!(Frame::new(LinkType::RawIp, data).ipv4().is_none());
    }

    #[test]
    fn test_truncated_payload_bounded_by_capture() {
        let mut ip = ipv4_header(1);
        // Claims 1500 bytes but only 28 were captured
        ip[2..4].copy_from_slice(&1500u16.to_be_bytes());
        let (_, payload) = split_ipv4(&ip).unwrap();
        assert_eq!(payload.len(), 8);
    }
}
