//! MTU discovery: the search, its signals and the correlator tying captured
//! frames back to probes.

pub mod correlate;
pub mod search;
pub mod signal;

pub use correlate::*;
pub use search::*;
pub use signal::*;

use serde::Serialize;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capture::{self, CaptureHandle, CaptureQueues, CaptureStats, Frame, LayerClassifier, PacketSource};
use crate::config::{Config, ProbeProtocol};
use crate::error::{Error, Result};
use crate::probe::{ProbeSender, RawProbeSender, detect_source_ip, get_identifier};

/// Outcome of a full analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MtuReport {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: ProbeProtocol,
    /// Result of the last pass run (0 = nothing confirmed)
    pub mtu: u16,
    pub passes: Vec<PassReport>,
    pub capture: CaptureStats,
}

/// Run the full analysis against the configured destination, capturing live
/// or from the replay file.
///
/// Cancelling `cancel` abandons the search, still shuts the capture down and
/// returns `Error::Interrupted`.
pub async fn analyze(config: &Config, cancel: CancellationToken) -> Result<MtuReport> {
    let target = resolve_target(config)?;
    let sender = RawProbeSender::open()?;
    let (queues, icmp_rx, esp_rx) = frame_queues(config.queue_capacity);

    let capture_config = config.clone();
    let capture = tokio::task::spawn_blocking(move || {
        capture::start(&capture_config, queues.icmp, queues.esp)
    })
    .await
    .map_err(|_| Error::CaptureExited)??;

    drive(config, target, capture, icmp_rx, esp_rx, sender, cancel).await
}

/// Run the analysis with an already opened packet source and probe sender
pub async fn run_analysis<P, S>(
    config: &Config,
    source: P,
    sender: S,
    cancel: CancellationToken,
) -> Result<MtuReport>
where
    P: PacketSource + 'static,
    S: ProbeSender,
{
    let target = resolve_target(config)?;
    let (queues, icmp_rx, esp_rx) = frame_queues(config.queue_capacity);

    let capture =
        tokio::task::spawn_blocking(move || capture::start_with(source, LayerClassifier, queues))
            .await
            .map_err(|_| Error::CaptureExited)??;

    drive(config, target, capture, icmp_rx, esp_rx, sender, cancel).await
}

fn frame_queues(capacity: usize) -> (CaptureQueues, mpsc::Receiver<Frame>, mpsc::Receiver<Frame>) {
    let (icmp_tx, icmp_rx) = mpsc::channel(capacity);
    let (esp_tx, esp_rx) = mpsc::channel(capacity);
    (
        CaptureQueues {
            icmp: icmp_tx,
            esp: esp_tx,
        },
        icmp_rx,
        esp_rx,
    )
}

fn resolve_target(config: &Config) -> Result<ProbeTarget> {
    let source = match config.source_ip {
        Some(ip) => ip,
        None => {
            let ip = detect_source_ip(config.destination_ip)?;
            tracing::debug!(source = %ip, "detected source address");
            ip
        }
    };
    Ok(ProbeTarget {
        source,
        destination: config.destination_ip,
        port: config.port,
        protocol: config.protocol,
        identifier: get_identifier(),
    })
}

async fn drive<S: ProbeSender>(
    config: &Config,
    target: ProbeTarget,
    capture: CaptureHandle,
    icmp_rx: mpsc::Receiver<Frame>,
    esp_rx: mpsc::Receiver<Frame>,
    sender: S,
    cancel: CancellationToken,
) -> Result<MtuReport> {
    let (signals, acknowledger) = SignalCoordinator::new();
    let stop = cancel.child_token();
    let correlator = Correlator::new(&target, config.esp_ack, acknowledger);
    let correlator_task = tokio::spawn(correlator.run(icmp_rx, esp_rx, stop.clone()));

    tracing::info!(
        source = %target.source,
        destination = %target.destination,
        protocol = ?target.protocol,
        "starting MTU search"
    );

    let mut search = MtuSearch::new(sender, signals, Timing::from(config));
    let searched = tokio::select! {
        _ = cancel.cancelled() => None,
        passes = async {
            if target.destination.is_loopback() {
                tokio::time::sleep(config.settle_delay).await;
            }
            search
                .refine(&target, config.start_mtu, config.increment, config.passes)
                .await
        } => Some(passes),
    };

    stop.cancel();
    if correlator_task.await.is_err() {
        tracing::warn!("correlator task failed");
    }

    let snapshot = capture.stats();
    let capture_stats = match tokio::task::spawn_blocking(move || capture.quit()).await {
        Ok(Ok(stats)) => stats,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "capture loop failed");
            snapshot
        }
        Err(_) => {
            tracing::warn!("capture shutdown panicked");
            snapshot
        }
    };

    let Some(passes) = searched else {
        tracing::info!(frames = capture_stats.frames, "interrupted");
        return Err(Error::Interrupted);
    };
    let mtu = passes.last().map_or(0, |pass| pass.mtu);
    tracing::info!(mtu, destination = %target.destination, "MTU found");

    Ok(MtuReport {
        source: target.source,
        destination: target.destination,
        protocol: target.protocol,
        mtu,
        passes,
        capture: capture_stats,
    })
}
