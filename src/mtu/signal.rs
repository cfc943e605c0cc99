//! Success and timeout signalling between the correlator and the search.
//!
//! The search publishes the probe it is waiting on through a `watch` channel.
//! The correlator reads it, and when a captured frame confirms that probe it
//! sends a `ProbeAck` back. Each wait races that acknowledgement against a
//! per-probe timer task.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Acknowledgements that can be buffered before the search reads them
const ACK_CAPACITY: usize = 16;

/// The probe currently awaiting a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub sequence: u16,
    /// Total IPv4 length of the probe
    pub size: u16,
}

/// Confirmation that a probe reached its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeAck {
    pub sequence: u16,
}

/// How a wait for a probe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Success,
    Timeout,
}

/// Search side of the signals
pub struct SignalCoordinator {
    in_flight: watch::Sender<Option<InFlight>>,
    acks: mpsc::Receiver<ProbeAck>,
}

impl SignalCoordinator {
    /// Create the coordinator and the acknowledger handed to the correlator
    pub fn new() -> (Self, Acknowledger) {
        let (in_flight_tx, in_flight_rx) = watch::channel(None);
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CAPACITY);
        (
            Self {
                in_flight: in_flight_tx,
                acks: ack_rx,
            },
            Acknowledger {
                in_flight: in_flight_rx,
                acks: ack_tx,
                acked: None,
            },
        )
    }

    /// Publish a probe as in flight. Leftover acknowledgements are discarded.
    pub fn begin(&mut self, probe: InFlight) {
        while let Ok(stale) = self.acks.try_recv() {
            tracing::debug!(sequence = stale.sequence, "discarding stale acknowledgement");
        }
        self.in_flight.send_replace(Some(probe));
    }

    /// Clear the in-flight probe
    pub fn finish(&mut self) {
        self.in_flight.send_replace(None);
    }

    /// Wait for `sequence` to be acknowledged, or for `timeout` to elapse
    pub async fn wait(&mut self, sequence: u16, timeout: Duration) -> WaitOutcome {
        let mut timer = spawn_timeout(timeout);
        let mut acks_open = true;

        loop {
            tokio::select! {
                biased;

                ack = self.acks.recv(), if acks_open => match ack {
                    Some(ack) if ack.sequence == sequence => return WaitOutcome::Success,
                    Some(ack) => {
                        tracing::debug!(
                            sequence = ack.sequence,
                            expected = sequence,
                            "ignoring stale acknowledgement"
                        );
                    }
                    None => acks_open = false,
                },
                _ = &mut timer => return WaitOutcome::Timeout,
            }
        }
    }
}

/// Correlator side of the signals
#[derive(Debug)]
pub struct Acknowledger {
    in_flight: watch::Receiver<Option<InFlight>>,
    acks: mpsc::Sender<ProbeAck>,
    acked: Option<InFlight>,
}

impl Acknowledger {
    /// The probe the search is currently waiting on
    pub fn in_flight(&self) -> Option<InFlight> {
        *self.in_flight.borrow()
    }

    /// Signal success for `sequence`.
    ///
    /// Fires at most once per in-flight probe and only if `sequence` is the
    /// one in flight. Returns true if the acknowledgement was sent.
    pub fn acknowledge(&mut self, sequence: u16) -> bool {
        let Some(current) = self.in_flight() else {
            return false;
        };
        if current.sequence != sequence || self.acked == Some(current) {
            return false;
        }
        if self.acks.try_send(ProbeAck { sequence }).is_err() {
            return false;
        }
        self.acked = Some(current);
        true
    }
}

/// Spawn a one-shot timer. The receiver resolves once `duration` has elapsed;
/// if it has already been dropped the firing is ignored.
pub fn spawn_timeout(duration: Duration) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        let _ = tx.send(());
    });
    rx
}
