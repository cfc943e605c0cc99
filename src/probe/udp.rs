use pnet::packet::MutablePacket;
use pnet::packet::udp::{MutableUdpPacket, UdpPacket, ipv4_checksum};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{Error, IoOperation, Result};
use crate::probe::packet::fill_payload;

/// UDP header size
pub const UDP_HEADER_SIZE: usize = 8;

/// Source port of UDP probes
pub const UDP_SRC_PORT: u16 = 50000;

/// Write a UDP datagram into `buffer`, the payload being everything past the
/// UDP header. `buffer` must hold at least the header.
pub fn write_udp_datagram(
    buffer: &mut [u8],
    source: Ipv4Addr,
    destination: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
) {
    debug_assert!(buffer.len() >= UDP_HEADER_SIZE);
    let length = buffer.len() as u16;
    let Some(mut packet) = MutableUdpPacket::new(buffer) else {
        return;
    };
    packet.set_source(src_port);
    packet.set_destination(dst_port);
    packet.set_length(length);
    packet.set_checksum(0);
    fill_payload(packet.payload_mut());

    let cksum = UdpPacket::new(buffer)
        .map(|p| ipv4_checksum(&p, &source, &destination))
        .unwrap_or(0);
    if let Some(mut packet) = MutableUdpPacket::new(buffer) {
        packet.set_checksum(cksum);
    }
}

/// Detect the local source IP the kernel would use to reach a given target.
/// Creates a temporary UDP socket, connects to the target, and reads back
/// the source address via getsockname.
pub fn detect_source_ip(target: Ipv4Addr) -> Result<Ipv4Addr> {
    let local_addr = |e: std::io::Error| Error::Socket(IoOperation::LocalAddr, e);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(local_addr)?;
    // Connect to target on a dummy port, no packets are sent for UDP
    let addr = SocketAddr::new(IpAddr::V4(target), 80);
    socket.connect(&SockAddr::from(addr)).map_err(local_addr)?;
    let local = socket.local_addr().map_err(local_addr)?;
    match local.as_socket() {
        Some(SocketAddr::V4(addr)) => Ok(*addr.ip()),
        _ => Err(local_addr(std::io::Error::other("no IPv4 local address"))),
    }
}
