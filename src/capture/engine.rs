use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::capture::classify::{Classes, Classify, LayerClassifier};
use crate::capture::frame::Frame;
use crate::capture::source::{NextFrame, PacketSource, READ_TIMEOUT, open_source};
use crate::config::Config;
use crate::error::{Error, Result};

/// Maximum consecutive read errors before stopping the capture loop
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Sending halves of the two classified frame queues
#[derive(Clone)]
pub struct CaptureQueues {
    pub icmp: mpsc::Sender<Frame>,
    pub esp: mpsc::Sender<Frame>,
}

/// Counters kept by the capture loop
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub frames: u64,
    pub esp: u64,
    pub icmp: u64,
    pub other: u64,
    pub dropped_esp: u64,
    pub dropped_icmp: u64,
    pub read_errors: u64,
    /// The source ran out of frames (replay files only)
    pub exhausted: bool,
}

/// The capture engine pulls frames, classifies them and routes them to the
/// ESP and ICMPv4 queues without ever blocking on a full queue.
pub struct CaptureEngine<S, C> {
    source: S,
    classifier: C,
    queues: CaptureQueues,
    cancel: CancellationToken,
    stats: Arc<Mutex<CaptureStats>>,
    consecutive_errors: u32,
}

impl<S: PacketSource, C: Classify> CaptureEngine<S, C> {
    pub fn new(source: S, classifier: C, queues: CaptureQueues, cancel: CancellationToken) -> Self {
        Self {
            source,
            classifier,
            queues,
            cancel,
            stats: Arc::new(Mutex::new(CaptureStats::default())),
            consecutive_errors: 0,
        }
    }

    /// Shared view of the counters
    pub fn stats(&self) -> Arc<Mutex<CaptureStats>> {
        Arc::clone(&self.stats)
    }

    /// Classify one frame and deliver it to every queue its class names
    pub fn route(&mut self, frame: Frame) {
        let classes = self.classifier.classify(&frame);
        let mut stats = self.stats.lock();
        stats.frames += 1;

        if classes.is_other() {
            stats.other += 1;
            return;
        }

        let (esp_frame, icmp_frame) = match (
            classes.contains(Classes::ESP),
            classes.contains(Classes::ICMPV4),
        ) {
            (true, true) => (Some(frame.clone()), Some(frame)),
            (true, false) => (Some(frame), None),
            (false, _) => (None, Some(frame)),
        };

        if let Some(frame) = esp_frame {
            stats.esp += 1;
            if !deliver(&self.queues.esp, frame, "esp") {
                stats.dropped_esp += 1;
            }
        }

        if let Some(frame) = icmp_frame {
            stats.icmp += 1;
            if !deliver(&self.queues.icmp, frame, "icmpv4") {
                stats.dropped_icmp += 1;
            }
        }
    }

    /// Run the capture loop until quit (blocking).
    ///
    /// `ready` fires once the loop is about to read its first frame. The source
    /// is dropped when this returns.
    pub fn run_blocking(mut self, ready: std_mpsc::SyncSender<()>) -> Result<CaptureStats> {
        tracing::info!(source = %self.source.describe(), "capture started");
        let _ = ready.send(());
        drop(ready);

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("received quit, stopping capture");
                break;
            }

            if self.stats.lock().exhausted {
                std::thread::sleep(READ_TIMEOUT);
                continue;
            }

            match self.source.next_frame() {
                Ok(NextFrame::Frame(frame)) => {
                    self.consecutive_errors = 0;
                    self.route(frame);
                }
                Ok(NextFrame::Idle) => {
                    self.consecutive_errors = 0;
                }
                Ok(NextFrame::Exhausted) => {
                    let stats = {
                        let mut stats = self.stats.lock();
                        stats.exhausted = true;
                        *stats
                    };
                    tracing::info!(frames = stats.frames, "capture source exhausted");
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    self.stats.lock().read_errors += 1;
                    tracing::warn!(
                        "capture read error ({}/{}): {}",
                        self.consecutive_errors,
                        MAX_CONSECUTIVE_ERRORS,
                        e
                    );
                    if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(Error::CaptureRead {
                            errors: self.consecutive_errors,
                            last: e,
                        });
                    }
                }
            }
        }

        let stats = *self.stats.lock();
        Ok(stats)
    }
}

/// Non-blocking delivery. Returns false if the frame was dropped.
fn deliver(queue: &mpsc::Sender<Frame>, frame: Frame, kind: &'static str) -> bool {
    match queue.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::debug!(queue = kind, "queue full, discarding frame");
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(queue = kind, "queue closed, discarding frame");
            false
        }
    }
}

/// Handle to a running capture thread.
///
/// `quit` consumes the handle, so quit can be requested at most once. A handle
/// dropped without `quit` still cancels the loop.
pub struct CaptureHandle {
    cancel: CancellationToken,
    stats: Arc<Mutex<CaptureStats>>,
    thread: Option<JoinHandle<Result<CaptureStats>>>,
}

impl CaptureHandle {
    /// Snapshot of the capture counters
    pub fn stats(&self) -> CaptureStats {
        *self.stats.lock()
    }

    /// True once the capture thread has returned
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Wait until the source is exhausted or `timeout` elapses
    pub fn wait_exhausted(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.stats.lock().exhausted {
                return true;
            }
            if self.is_finished() || std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Stop the capture loop and wait for it to release its source (blocking)
    pub fn quit(mut self) -> Result<CaptureStats> {
        self.cancel.cancel();
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| Error::CaptureExited)?,
            None => Err(Error::CaptureExited),
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.cancel.cancel();
        }
    }
}

/// Open the configured source and start capturing.
///
/// Blocks until the capture loop is running. Open failures are returned here
/// and no thread is started.
pub fn start(
    config: &Config,
    icmp: mpsc::Sender<Frame>,
    esp: mpsc::Sender<Frame>,
) -> Result<CaptureHandle> {
    let source = open_source(config)?;
    let handle = start_with(source, LayerClassifier, CaptureQueues { icmp, esp })?;
    tracing::debug!(queue_capacity = config.queue_capacity, "capture thread ready");
    Ok(handle)
}

/// Start capturing from an already opened source
pub fn start_with<S, C>(source: S, classifier: C, queues: CaptureQueues) -> Result<CaptureHandle>
where
    S: PacketSource + 'static,
    C: Classify + 'static,
{
    let cancel = CancellationToken::new();
    let engine = CaptureEngine::new(source, classifier, queues, cancel.clone());
    let stats = engine.stats();
    let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

    let thread = std::thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || engine.run_blocking(ready_tx))
        .map_err(|_| Error::CaptureExited)?;

    // The sender is dropped without firing only if the thread died first
    if ready_rx.recv().is_err() {
        return match thread.join() {
            Ok(Err(e)) => Err(e),
            _ => Err(Error::CaptureExited),
        };
    }

    Ok(CaptureHandle {
        cancel,
        stats,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::LinkType;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn ipv4(protocol: u8) -> Vec<u8> {
        let mut ip = vec![0u8; 36];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&36u16.to_be_bytes());
        ip[9] = protocol;
        ip
    }

    fn esp_frame() -> Frame {
        Frame::new(LinkType::RawIp, ipv4(50))
    }

    fn icmp_frame() -> Frame {
        Frame::new(LinkType::RawIp, ipv4(1))
    }

    /// In-memory source that counts how often it is released
    struct ScriptedSource {
        frames: VecDeque<Frame>,
        idle_when_empty: bool,
        released: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(frames: Vec<Frame>, idle_when_empty: bool) -> (Self, Arc<AtomicUsize>) {
            let released = Arc::new(AtomicUsize::new(0));
            let source = Self {
                frames: frames.into(),
                idle_when_empty,
                released: Arc::clone(&released),
            };
            (source, released)
        }
    }

    impl PacketSource for ScriptedSource {
        fn next_frame(&mut self) -> std::io::Result<NextFrame> {
            match self.frames.pop_front() {
                Some(frame) => Ok(NextFrame::Frame(frame)),
                None if self.idle_when_empty => {
                    std::thread::sleep(Duration::from_millis(10));
                    Ok(NextFrame::Idle)
                }
                None => Ok(NextFrame::Exhausted),
            }
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingSource;

    impl PacketSource for FailingSource {
        fn next_frame(&mut self) -> std::io::Result<NextFrame> {
            Err(std::io::Error::other("device went away"))
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    fn queues(capacity: usize) -> (CaptureQueues, mpsc::Receiver<Frame>, mpsc::Receiver<Frame>) {
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

    fn engine(queues: CaptureQueues) -> CaptureEngine<ScriptedSource, LayerClassifier> {
        let (source, _) = ScriptedSource::new(Vec::new(), false);
        CaptureEngine::new(source, LayerClassifier, queues, CancellationToken::new())
    }

    #[test]
    fn test_esp_only_goes_to_esp_queue() {
        let (queues, mut icmp_rx, mut esp_rx) = queues(4);
        let mut engine = engine(queues);

        engine.route(esp_frame());
        assert!(esp_rx.try_recv().is_ok());
        assert!(icmp_rx.try_recv().is_err());

        engine.route(icmp_frame());
        assert!(icmp_rx.try_recv().is_ok());
        assert!(esp_rx.try_recv().is_err());
    }

    /// ICMP destination unreachable quoting an ESP datagram
    fn icmp_quoting_esp_frame() -> Frame {
        let mut quoted = ipv4(50);
        quoted.truncate(28);
        let mut icmp = vec![3u8, 4, 0, 0, 0, 0, 0x05, 0x78];
        icmp.extend_from_slice(&quoted);

        let total = 20 + icmp.len();
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        ip[9] = 1;
        ip.extend_from_slice(&icmp);
        Frame::new(LinkType::RawIp, ip)
    }

    #[test]
    fn test_icmp_quoting_esp_goes_to_both_queues() {
        let (queues, mut icmp_rx, mut esp_rx) = queues(4);
        let mut engine = engine(queues);
        let frame = icmp_quoting_esp_frame();

        engine.route(frame.clone());

        assert_eq!(esp_rx.try_recv().unwrap().data, frame.data);
        assert_eq!(icmp_rx.try_recv().unwrap().data, frame.data);
        assert!(esp_rx.try_recv().is_err());
        assert!(icmp_rx.try_recv().is_err());

        let stats = *engine.stats().lock();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.esp, 1);
        assert_eq!(stats.icmp, 1);
        assert_eq!(stats.other, 0);
    }

    #[test]
    fn test_fan_out_drop_on_one_queue_keeps_the_other() {
        let (queues, mut icmp_rx, mut esp_rx) = queues(1);
        queues.esp.try_send(esp_frame()).unwrap();
        let mut engine = engine(queues);

        engine.route(icmp_quoting_esp_frame());

        let stats = *engine.stats().lock();
        assert_eq!(stats.dropped_esp, 1);
        assert_eq!(stats.dropped_icmp, 0);
        assert!(icmp_rx.try_recv().is_ok());
        assert!(esp_rx.try_recv().is_ok());
        assert!(esp_rx.try_recv().is_err());
    }

    #[test]
    fn test_other_is_not_routed() {
        let (queues, mut icmp_rx, mut esp_rx) = queues(4);
        let mut engine = engine(queues);
        engine.route(Frame::new(LinkType::RawIp, ipv4(6)));

        assert!(icmp_rx.try_recv().is_err());
        assert!(esp_rx.try_recv().is_err());
        assert_eq!(engine.stats().lock().other, 1);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (queues, mut icmp_rx, _esp_rx) = queues(1);
        queues.icmp.try_send(icmp_frame()).unwrap();
        let mut engine = engine(queues);

        let started = Instant::now();
        for _ in 0..100 {
            engine.route(icmp_frame());
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        let stats = *engine.stats().lock();
        assert_eq!(stats.icmp, 100);
        assert_eq!(stats.dropped_icmp, 100);
        assert_eq!(stats.dropped_esp, 0);

        // Only the frame that filled the queue is there
        assert!(icmp_rx.try_recv().is_ok());
        assert!(icmp_rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_queue_counts_as_drop() {
        let (queues, _icmp_rx, esp_rx) = queues(4);
        drop(esp_rx);
        let mut engine = engine(queues);
        engine.route(esp_frame());
        assert_eq!(engine.stats().lock().dropped_esp, 1);
    }

    #[test]
    fn test_quit_after_ready_releases_source_once() {
        let (queues, _icmp_rx, _esp_rx) = queues(4);
        let (source, released) = ScriptedSource::new(Vec::new(), true);

        let handle = start_with(source, LayerClassifier, queues).unwrap();
        assert!(!handle.is_finished());
        assert_eq!(released.load(Ordering::SeqCst), 0);

        let started = Instant::now();
        let stats = handle.quit().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stats.frames, 0);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_handle_stops_loop() {
        let (queues, _icmp_rx, _esp_rx) = queues(4);
        let (source, released) = ScriptedSource::new(Vec::new(), true);

        let handle = start_with(source, LayerClassifier, queues).unwrap();
        drop(handle);

        let deadline = Instant::now() + Duration::from_secs(2);
        while released.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhausted_source_waits_for_quit() {
        let (queues, mut icmp_rx, mut esp_rx) = queues(4);
        let (source, released) = ScriptedSource::new(vec![esp_frame(), icmp_frame()], false);

        let handle = start_with(source, LayerClassifier, queues).unwrap();
        assert!(handle.wait_exhausted(Duration::from_secs(2)));
        assert!(!handle.is_finished());
        assert_eq!(released.load(Ordering::SeqCst), 0);

        let stats = handle.quit().unwrap();
        assert_eq!(stats.frames, 2);
        assert!(stats.exhausted);
        assert!(esp_rx.try_recv().is_ok());
        assert!(icmp_rx.try_recv().is_ok());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_persistent_read_errors_stop_loop() {
        let (queues, _icmp_rx, _esp_rx) = queues(4);
        let handle = start_with(FailingSource, LayerClassifier, queues).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let err = handle.quit().unwrap_err();
        assert!(matches!(err, Error::CaptureRead { errors: 50, .. }));
    }
}
