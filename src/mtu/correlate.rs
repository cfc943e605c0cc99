//! Matches captured frames against the in-flight probe.

use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::udp::UdpPacket;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capture::frame::{Frame, split_ipv4};
use crate::config::ProbeProtocol;
use crate::mtu::search::ProbeTarget;
use crate::mtu::signal::{Acknowledger, InFlight};

// Destination unreachable codes
const PORT_UNREACHABLE: u8 = 3;
const FRAGMENTATION_NEEDED: u8 = 4;

/// ICMP header preceding the quoted datagram in error messages
const ICMP_ERROR_HEADER_SIZE: usize = 8;

/// What a captured frame says about the in-flight probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The probe reached the destination
    Delivered,
    /// A hop reported the probe larger than its next-hop MTU
    FragmentationNeeded { responder: Ipv4Addr, next_hop_mtu: u16 },
    Unrelated,
}

/// Consumes both classified queues and acknowledges the in-flight probe
pub struct Correlator {
    destination: Ipv4Addr,
    port: u16,
    identifier: u16,
    protocol: ProbeProtocol,
    esp_ack: bool,
    acknowledger: Acknowledger,
}

impl Correlator {
    pub fn new(target: &ProbeTarget, esp_ack: bool, acknowledger: Acknowledger) -> Self {
        Self {
            destination: target.destination,
            port: target.port,
            identifier: target.identifier,
            protocol: target.protocol,
            esp_ack,
            acknowledger,
        }
    }

    /// Run until cancelled or both queues close
    pub async fn run(
        mut self,
        mut icmp: mpsc::Receiver<Frame>,
        mut esp: mpsc::Receiver<Frame>,
        cancel: CancellationToken,
    ) {
        let mut icmp_open = true;
        let mut esp_open = true;

        while icmp_open || esp_open {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = icmp.recv(), if icmp_open => match frame {
                    Some(frame) => {
                        self.handle_icmp(&frame);
                    }
                    None => icmp_open = false,
                },
                frame = esp.recv(), if esp_open => match frame {
                    Some(frame) => {
                        self.handle_esp(&frame);
                    }
                    None => esp_open = false,
                },
            }
        }
        tracing::debug!("correlator stopped");
    }

    /// Returns true if the frame acknowledged the in-flight probe
    pub fn handle_icmp(&mut self, frame: &Frame) -> bool {
        let Some(probe) = self.acknowledger.in_flight() else {
            return false;
        };
        let verdict = self.inspect_icmp(frame, probe);
        self.apply(verdict, probe)
    }

    /// Returns true if the frame acknowledged the in-flight probe
    pub fn handle_esp(&mut self, frame: &Frame) -> bool {
        let Some(probe) = self.acknowledger.in_flight() else {
            return false;
        };
        let verdict = self.inspect_esp(frame, probe);
        self.apply(verdict, probe)
    }

    fn apply(&mut self, verdict: Verdict, probe: InFlight) -> bool {
        match verdict {
            Verdict::Delivered => {
                let acked = self.acknowledger.acknowledge(probe.sequence);
                if acked {
                    tracing::debug!(sequence = probe.sequence, size = probe.size, "probe delivered");
                }
                acked
            }
            Verdict::FragmentationNeeded {
                responder,
                next_hop_mtu,
            } => {
                tracing::debug!(
                    %responder,
                    next_hop_mtu,
                    size = probe.size,
                    "fragmentation needed for probe"
                );
                false
            }
            Verdict::Unrelated => false,
        }
    }

    /// Judge an ICMPv4 frame against `probe`
    pub fn inspect_icmp(&self, frame: &Frame, probe: InFlight) -> Verdict {
        let Some((ip, payload)) = frame.ipv4() else {
            return Verdict::Unrelated;
        };
        if ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
            return Verdict::Unrelated;
        }
        let Some(icmp) = IcmpPacket::new(payload) else {
            return Verdict::Unrelated;
        };
        let responder = ip.get_source();

        match icmp.get_icmp_type() {
            IcmpTypes::EchoReply => {
                if self.protocol != ProbeProtocol::Icmp || responder != self.destination {
                    return Verdict::Unrelated;
                }
                match EchoReplyPacket::new(payload) {
                    Some(reply)
                        if reply.get_identifier() == self.identifier
                            && reply.get_sequence_number() == probe.sequence =>
                    {
                        Verdict::Delivered
                    }
                    _ => Verdict::Unrelated,
                }
            }
            IcmpTypes::DestinationUnreachable => {
                if !self.quotes_probe(payload, probe) {
                    return Verdict::Unrelated;
                }
                match icmp.get_icmp_code().0 {
                    PORT_UNREACHABLE
                        if self.protocol == ProbeProtocol::Udp && responder == self.destination =>
                    {
                        Verdict::Delivered
                    }
                    FRAGMENTATION_NEEDED => Verdict::FragmentationNeeded {
                        responder,
                        next_hop_mtu: u16::from_be_bytes([payload[6], payload[7]]),
                    },
                    _ => Verdict::Unrelated,
                }
            }
            _ => Verdict::Unrelated,
        }
    }

    /// Judge an ESP frame against `probe`. Only counts when ESP
    /// acknowledgement is enabled.
    pub fn inspect_esp(&self, frame: &Frame, probe: InFlight) -> Verdict {
        if !self.esp_ack {
            return Verdict::Unrelated;
        }
        match frame.ipv4() {
            Some((ip, _))
                if ip.get_source() == self.destination && ip.get_total_length() >= probe.size =>
            {
                Verdict::Delivered
            }
            _ => Verdict::Unrelated,
        }
    }

    /// The ICMP error quotes our probe: sent to the destination, carrying the
    /// in-flight sequence as its identification, with a matching transport.
    fn quotes_probe(&self, icmp_payload: &[u8], probe: InFlight) -> bool {
        let Some(quoted) = icmp_payload.get(ICMP_ERROR_HEADER_SIZE..) else {
            return false;
        };
        let Some((ip, transport)) = split_ipv4(quoted) else {
            return false;
        };
        if ip.get_destination() != self.destination || ip.get_identification() != probe.sequence {
            return false;
        }

        match self.protocol {
            ProbeProtocol::Icmp => ip.get_next_level_protocol() == IpNextHeaderProtocols::Icmp,
            ProbeProtocol::Udp => {
                ip.get_next_level_protocol() == IpNextHeaderProtocols::Udp
                    && UdpPacket::new(transport).is_some_and(|udp| udp.get_destination() == self.port)
            }
        }
    }
}
