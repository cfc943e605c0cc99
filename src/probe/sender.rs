use socket2::Socket;

use crate::error::Result;
use crate::probe::packet::{ProbeSpec, build_probe};
use crate::probe::socket::{create_raw_send_socket, send_datagram};

/// Emits a single probe. A successful send only confirms local transmission.
pub trait ProbeSender: Send {
    fn send(&mut self, spec: &ProbeSpec) -> Result<usize>;
}

impl<T: ProbeSender + ?Sized> ProbeSender for Box<T> {
    fn send(&mut self, spec: &ProbeSpec) -> Result<usize> {
        (**self).send(spec)
    }
}

/// Sends probes through a raw header-included socket
pub struct RawProbeSender {
    socket: Socket,
}

impl RawProbeSender {
    pub fn open() -> Result<Self> {
        Ok(Self {
            socket: create_raw_send_socket()?,
        })
    }
}

impl ProbeSender for RawProbeSender {
    fn send(&mut self, spec: &ProbeSpec) -> Result<usize> {
        let packet = build_probe(spec);
        let sent = send_datagram(&self.socket, &packet, spec.destination)?;
        tracing::debug!(size = packet.len(), sequence = spec.sequence, "probe sent");
        Ok(sent)
    }
}
