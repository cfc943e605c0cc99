use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::instrument;

use crate::config::{Config, ProbeProtocol};
use crate::mtu::signal::{InFlight, SignalCoordinator, WaitOutcome};
use crate::probe::packet::{MIN_PROBE_SIZE, ProbeSpec};
use crate::probe::sender::ProbeSender;

/// Where probes go and how they are built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTarget {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub port: u16,
    pub protocol: ProbeProtocol,
    /// ICMP echo identifier
    pub identifier: u16,
}

impl ProbeTarget {
    /// Describe the probe of `size` octets carrying `sequence`
    pub fn probe(&self, size: u16, sequence: u16) -> ProbeSpec {
        ProbeSpec {
            source: self.source,
            destination: self.destination,
            port: self.port,
            size,
            sequence,
            identifier: self.identifier,
            protocol: self.protocol,
        }
    }
}

/// Probe timeout and the pause after each confirmed probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub probe_timeout: Duration,
    pub settle_delay: Duration,
}

impl From<&Config> for Timing {
    fn from(config: &Config) -> Self {
        Self {
            probe_timeout: config.probe_timeout,
            settle_delay: config.settle_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchPhase {
    #[default]
    Probing,
    AwaitingResult,
    Converged,
}

/// Progress of one pass. `good_mtu <= next_mtu` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchState {
    /// Largest size confirmed so far (0 = none)
    pub good_mtu: u16,
    /// Size of the next probe
    pub next_mtu: u16,
    pub increment: u16,
}

impl SearchState {
    /// Sizes below the smallest buildable probe start at that size, so a
    /// confirmed probe is never recorded as 0.
    pub fn new(start_mtu: u16, increment: u16) -> Self {
        Self {
            good_mtu: 0,
            next_mtu: start_mtu.max(MIN_PROBE_SIZE as u16),
            increment,
        }
    }

    /// Record the current probe as confirmed and step forward.
    ///
    /// Returns false if the next size would not fit in 16 bits; `next_mtu`
    /// then stays at the confirmed size.
    pub fn confirm(&mut self) -> bool {
        self.good_mtu = self.next_mtu;
        match self.next_mtu.checked_add(self.increment) {
            Some(next) => {
                self.next_mtu = next;
                true
            }
            None => false,
        }
    }
}

/// One probe as seen by the search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeRecord {
    pub sequence: u16,
    pub size: u16,
    pub acknowledged: bool,
    /// The probe never left the host
    pub send_failed: bool,
}

/// Result of one refinement pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub pass: u8,
    pub start_mtu: u16,
    pub increment: u16,
    pub mtu: u16,
    pub probes: Vec<ProbeRecord>,
}

/// The adaptive MTU search.
///
/// Owns the probe sender and the search side of the signals. Each pass probes
/// upward from a start size until a probe goes unanswered.
pub struct MtuSearch<S> {
    sender: S,
    signals: SignalCoordinator,
    timing: Timing,
    sequence: u16,
    phase: SearchPhase,
    probes: Vec<ProbeRecord>,
}

impl<S: ProbeSender> MtuSearch<S> {
    pub fn new(sender: S, signals: SignalCoordinator, timing: Timing) -> Self {
        Self {
            sender,
            signals,
            timing,
            sequence: 0,
            phase: SearchPhase::default(),
            probes: Vec::new(),
        }
    }

    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    /// Probes sent since the last call
    pub fn take_probes(&mut self) -> Vec<ProbeRecord> {
        std::mem::take(&mut self.probes)
    }

    /// Run one pass: probe at `start_mtu`, then `start_mtu + increment`, and
    /// so on until a probe times out. Returns the largest confirmed size, or 0
    /// if even the first probe went unanswered.
    #[instrument(skip(self, target), fields(destination = %target.destination))]
    pub async fn find_mtu(&mut self, target: &ProbeTarget, start_mtu: u16, increment: u16) -> u16 {
        let mut state = SearchState::new(start_mtu, increment);
        self.phase = SearchPhase::Probing;

        while self.phase != SearchPhase::Converged {
            let size = state.next_mtu;
            let sequence = self.next_sequence();
            self.signals.begin(InFlight { sequence, size });

            if let Err(e) = self.sender.send(&target.probe(size, sequence)) {
                if e.is_message_too_long() {
                    tracing::warn!(size, "probe exceeds the local interface MTU, treating as timeout");
                } else {
                    tracing::warn!(size, error = %e, "probe send failed, treating as timeout");
                }
                self.signals.finish();
                self.probes.push(ProbeRecord {
                    sequence,
                    size,
                    acknowledged: false,
                    send_failed: true,
                });
                self.phase = SearchPhase::Converged;
                break;
            }

            self.phase = SearchPhase::AwaitingResult;
            let outcome = self.signals.wait(sequence, self.timing.probe_timeout).await;
            self.signals.finish();
            self.probes.push(ProbeRecord {
                sequence,
                size,
                acknowledged: outcome == WaitOutcome::Success,
                send_failed: false,
            });

            match outcome {
                WaitOutcome::Success => {
                    tracing::debug!(size, "probe acknowledged");
                    if state.confirm() {
                        tokio::time::sleep(self.timing.settle_delay).await;
                        self.phase = SearchPhase::Probing;
                    } else {
                        tracing::debug!(size, "next probe size out of range");
                        self.phase = SearchPhase::Converged;
                    }
                }
                WaitOutcome::Timeout => {
                    tracing::debug!(size, "probe timed out");
                    self.phase = SearchPhase::Converged;
                }
            }
        }

        tracing::debug!(mtu = state.good_mtu, "pass converged");
        state.good_mtu
    }

    /// Run up to `passes` passes, each starting from the previous result with
    /// half the previous increment. Stops early once the increment reaches 0
    /// or a pass confirms nothing.
    pub async fn refine(
        &mut self,
        target: &ProbeTarget,
        start_mtu: u16,
        increment: u16,
        passes: u8,
    ) -> Vec<PassReport> {
        let mut reports = Vec::with_capacity(passes as usize);
        let mut start = start_mtu;
        let mut increment = increment;

        for pass in 1..=passes {
            if increment == 0 {
                tracing::debug!(pass, "increment exhausted, stopping refinement");
                break;
            }

            let mtu = self.find_mtu(target, start, increment).await;
            tracing::info!(pass, start_mtu = start, increment, mtu, "pass complete");
            reports.push(PassReport {
                pass,
                start_mtu: start,
                increment,
                mtu,
                probes: self.take_probes(),
            });

            if mtu == 0 {
                break;
            }
            start = mtu;
            increment /= 2;
        }

        reports
    }
}
