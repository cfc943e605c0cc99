//! Complete IPv4 probe datagrams of an exact size.

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Flags, MutableIpv4Packet, checksum};
use std::net::Ipv4Addr;

use crate::config::ProbeProtocol;
use crate::probe::icmp::{ICMP_HEADER_SIZE, write_echo_request};
use crate::probe::udp::{UDP_HEADER_SIZE, UDP_SRC_PORT, write_udp_datagram};

/// IPv4 header size (no options)
pub const IPV4_HEADER_SIZE: usize = 20;
/// Smallest probe we can build: IPv4 header plus an 8-byte ICMP/UDP header
pub const MIN_PROBE_SIZE: usize = IPV4_HEADER_SIZE + 8;
/// Written at the start of every probe payload
pub const PROBE_MARKER: &[u8; 4] = b"MTU?";
/// TTL of outgoing probes
const PROBE_TTL: u8 = 64;

/// Everything needed to build one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSpec {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub port: u16,
    /// Total IPv4 datagram length in octets
    pub size: u16,
    /// Carried in the IPv4 identification (and ICMP sequence) field
    pub sequence: u16,
    /// ICMP identifier
    pub identifier: u16,
    pub protocol: ProbeProtocol,
}

impl ProbeSpec {
    /// Length of the datagram on the wire
    pub fn wire_len(&self) -> usize {
        (self.size as usize).max(MIN_PROBE_SIZE)
    }
}

/// Fill a payload with the probe marker followed by a byte pattern
pub fn fill_payload(payload: &mut [u8]) {
    let marker_len = PROBE_MARKER.len().min(payload.len());
    payload[..marker_len].copy_from_slice(&PROBE_MARKER[..marker_len]);
    for (i, byte) in payload[marker_len..].iter_mut().enumerate() {
        *byte = (i & 0xFF) as u8;
    }
}

/// Build the full probe datagram: IPv4 header with DF set, then ICMP Echo
/// Request or UDP, then payload. Sizes below `MIN_PROBE_SIZE` are raised.
pub fn build_probe(spec: &ProbeSpec) -> Vec<u8> {
    let len = spec.wire_len();
    let mut buffer = vec![0u8; len];

    let protocol = match spec.protocol {
        ProbeProtocol::Icmp => IpNextHeaderProtocols::Icmp,
        ProbeProtocol::Udp => IpNextHeaderProtocols::Udp,
    };

    let transport = &mut buffer[IPV4_HEADER_SIZE..];
    match spec.protocol {
        ProbeProtocol::Icmp => {
            debug_assert!(transport.len() >= ICMP_HEADER_SIZE);
            write_echo_request(transport, spec.identifier, spec.sequence);
        }
        ProbeProtocol::Udp => {
            debug_assert!(transport.len() >= UDP_HEADER_SIZE);
            write_udp_datagram(
                transport,
                spec.source,
                spec.destination,
                UDP_SRC_PORT,
                spec.port,
            );
        }
    }

    if let Some(mut ip) = MutableIpv4Packet::new(&mut buffer) {
        ip.set_version(4);
        ip.set_header_length((IPV4_HEADER_SIZE / 4) as u8);
        ip.set_total_length(len as u16);
        ip.set_identification(spec.sequence);
        ip.set_flags(Ipv4Flags::DontFragment);
        ip.set_fragment_offset(0);
        ip.set_ttl(PROBE_TTL);
        ip.set_next_level_protocol(protocol);
        ip.set_source(spec.source);
        ip.set_destination(spec.destination);
        let cksum = checksum(&ip.to_immutable());
        ip.set_checksum(cksum);
    }

    buffer
}
