use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{Error, IoOperation, Result};

/// Create a raw IPv4 socket for sending complete datagrams.
///
/// IPPROTO_RAW implies IP_HDRINCL: the kernel sends our header as built,
/// including the DF bit and identification field.
pub fn create_raw_send_socket() -> Result<Socket> {
    let socket = Socket::new(
        Domain::IPV4,
        Type::RAW,
        Some(Protocol::from(libc::IPPROTO_RAW)),
    )
    .map_err(|e| Error::Socket(IoOperation::NewSocket, e))?;
    Ok(socket)
}

/// Check that both probing and capture are permitted
pub fn check_permissions() -> anyhow::Result<()> {
    if create_raw_send_socket().is_ok() {
        return Ok(());
    }

    let binary_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "ipsecmtu".to_string());

    Err(anyhow::anyhow!(
        "Insufficient permissions for raw sockets.\n\n\
         Fix options:\n\
         \u{2022} Run with sudo: sudo ipsecmtu <destination>\n\
         \u{2022} Add capability: sudo setcap cap_net_raw+ep {}\n\
         \u{2022} Replay a capture instead: ipsecmtu --replay <file.pcap> <destination>",
        binary_path
    ))
}

/// Send a complete IPv4 datagram
pub fn send_datagram(socket: &Socket, packet: &[u8], destination: Ipv4Addr) -> Result<usize> {
    let addr = SockAddr::from(SocketAddr::new(IpAddr::V4(destination), 0));
    socket
        .send_to(packet, &addr)
        .map_err(|e| Error::ProbeSend {
            size: packet.len(),
            destination,
            source: e,
        })
}
