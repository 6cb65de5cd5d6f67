//! Frame ingestion from a pub/sub subscriber.
//!
//! `FrameIngestor` owns one subscriber connection and turns inbound messages
//! into normalized `Frame`s. The receive loop is responsible for:
//! - Polling without blocking so a stop request is seen promptly
//! - Dropping payloads that do not decode as an image
//! - Counting receive failures, backing off, and reconnecting
//! - Numbering yielded frames without gaps
//!
//! The receive loop MUST NOT:
//! - Surface transient transport errors to the consumer
//! - Advance the sequence number for idle, dropped, skipped or failed polls

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod backoff;
pub mod normalize;
mod undistort;

pub use backoff::{ErrorState, Recovery, RetryPolicy};
pub use normalize::{ChannelOrder, Normalizer};

use crate::calibration::CalibrationProfile;
use crate::frame::Frame;
use crate::transport::{Connect, Endpoint, Multipart, Subscriber, TransportError};

/// Construction-time settings for an ingestor.
#[derive(Clone, Debug)]
pub struct IngestSettings {
    /// Yield every `stride`-th decoded frame. Must be at least 1.
    pub stride: u32,
    pub retry: RetryPolicy,
    pub channel_order: ChannelOrder,
    /// Log receive health this often, including while no frames arrive.
    pub health_interval: Option<Duration>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            stride: 1,
            retry: RetryPolicy::default(),
            channel_order: ChannelOrder::default(),
            health_interval: None,
        }
    }
}

/// Counters for health logging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub frames_yielded: u64,
    pub frames_dropped: u64,
    pub frames_skipped: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub health_reports: u64,
}

/// Interval timer for health lines.
#[derive(Debug)]
struct HealthTimer {
    interval: Duration,
    last: Instant,
}

impl HealthTimer {
    fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last: now,
        }
    }

    fn due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

/// Cloneable handle that stops an ingestor from another thread
/// (e.g. a Ctrl-C handler).
#[derive(Clone, Debug)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Why a poll counted as a failure.
#[derive(Debug)]
enum Fault {
    Transport(TransportError),
    Frame(anyhow::Error),
}

/// Outcome of one pass through the receive loop.
enum Step {
    Idle,
    Dropped,
    Skipped,
    Ready(Frame),
    Failed(Fault),
}

/// Subscriber-side frame source with backoff and reconnect.
pub struct FrameIngestor<C: Connect = Endpoint> {
    connector: C,
    connection: Option<C::Subscriber>,
    normalizer: Normalizer,
    errors: ErrorState,
    stride: u64,
    running: Arc<AtomicBool>,
    next_sequence: u64,
    decoded: u64,
    stats: IngestStats,
    health: Option<HealthTimer>,
}

impl FrameIngestor<Endpoint> {
    /// Connect to `endpoint` using the calibration row in `calibration_path`.
    ///
    /// Calibration and endpoint problems are configuration errors and are
    /// returned, never retried.
    pub fn open(endpoint: &str, calibration_path: &Path, stride: u32) -> Result<Self> {
        let calibration = CalibrationProfile::load(calibration_path)?;
        let settings = IngestSettings {
            stride,
            ..IngestSettings::default()
        };
        let connector = Endpoint::subscriber(endpoint, settings.retry.recv_timeout)?;
        Self::with_connector(connector, calibration, settings)
    }
}

impl<C: Connect> FrameIngestor<C> {
    pub fn with_connector(
        mut connector: C,
        calibration: CalibrationProfile,
        settings: IngestSettings,
    ) -> Result<Self> {
        if settings.stride == 0 {
            return Err(anyhow!("stride must be at least 1"));
        }
        let connection = connector
            .connect()
            .with_context(|| format!("connect subscriber to {}", connector.endpoint()))?;
        log::info!("listening for images on {}", connector.endpoint());

        Ok(Self {
            connector,
            connection: Some(connection),
            normalizer: Normalizer::new(calibration).with_channel_order(settings.channel_order),
            errors: ErrorState::new(settings.retry),
            stride: u64::from(settings.stride),
            running: Arc::new(AtomicBool::new(true)),
            next_sequence: 0,
            decoded: 0,
            stats: IngestStats::default(),
            health: settings
                .health_interval
                .map(|interval| HealthTimer::new(interval, Instant::now())),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop iterating and close the connection. Close errors are ignored.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close() {
                log::debug!("ignoring close error on {}: {}", self.connector.endpoint(), e);
            }
            log::info!("stopped listening on {}", self.connector.endpoint());
        }
    }

    /// Lazy sequence of normalized frames. Ends only when stopped.
    ///
    /// Sequence numbers continue across calls.
    pub fn frames(&mut self) -> Frames<'_, C> {
        Frames { ingestor: self }
    }

    pub fn error_state(&self) -> &ErrorState {
        &self.errors
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn calibration(&self) -> &CalibrationProfile {
        self.normalizer.calibration()
    }

    pub fn endpoint(&self) -> &str {
        self.connector.endpoint()
    }

    fn report_health(&mut self) {
        let Some(timer) = self.health.as_mut() else {
            return;
        };
        if !timer.due(Instant::now()) {
            return;
        }
        self.stats.health_reports += 1;
        let stats = &self.stats;
        log::info!(
            "ingest health on {}: connected={} yielded={} dropped={} skipped={} errors={} consecutive_errors={} reconnects={}",
            self.connector.endpoint(),
            self.connection.is_some(),
            stats.frames_yielded,
            stats.frames_dropped,
            stats.frames_skipped,
            stats.errors,
            self.errors.consecutive_errors(),
            stats.reconnects
        );
    }

    fn receive(&mut self) -> Result<Option<Multipart>, TransportError> {
        match self.connection.as_mut() {
            Some(connection) => connection.try_recv(),
            None => Err(TransportError::Disconnected),
        }
    }

    fn poll(&mut self) -> Step {
        let parts = match self.receive() {
            Ok(Some(parts)) => parts,
            Ok(None) => return Step::Idle,
            Err(e) => return Step::Failed(Fault::Transport(e)),
        };
        self.errors.reset();

        let Some(payload) = image_part(parts) else {
            return Step::Failed(Fault::Frame(anyhow!("received a message with no parts")));
        };
        let Some(image) = normalize::decode_color(&payload) else {
            return Step::Dropped;
        };

        let index = self.decoded;
        self.decoded += 1;
        if index % self.stride != 0 {
            return Step::Skipped;
        }

        match self.normalizer.normalize(image) {
            Ok((image, intrinsics)) => {
                let frame = Frame {
                    sequence: self.next_sequence,
                    image,
                    intrinsics,
                };
                self.next_sequence += 1;
                Step::Ready(frame)
            }
            Err(e) => Step::Failed(Fault::Frame(e)),
        }
    }

    fn recover(&mut self, fault: Fault) {
        self.stats.errors += 1;
        let recovery = self.errors.record_error();
        let attempt = self.errors.consecutive_errors();
        match &fault {
            Fault::Transport(e) => log::warn!("receive error (attempt {}): {}", attempt, e),
            Fault::Frame(e) => {
                log::warn!("error receiving image (attempt {}): {:#}", attempt, e)
            }
        }

        match recovery {
            Recovery::Reconnect => self.reconnect(),
            Recovery::Backoff(delay) => std::thread::sleep(delay),
        }
    }

    fn reconnect(&mut self) {
        log::warn!("attempting reconnect to {}", self.connector.endpoint());
        self.stats.reconnects += 1;
        if let Some(mut old) = self.connection.take() {
            let _ = old.close();
        }
        match self.connector.connect() {
            Ok(connection) => {
                self.connection = Some(connection);
                self.errors.reset();
                log::info!("reconnected to {}", self.connector.endpoint());
            }
            Err(e) => {
                log::warn!("reconnect to {} failed: {}", self.connector.endpoint(), e);
                std::thread::sleep(self.errors.next_delay());
            }
        }
    }
}

impl<C: Connect> Drop for FrameIngestor<C> {
    fn drop(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.close();
        }
    }
}

/// Payload selection: the second part of a multipart message, else the first.
/// Leading metadata parts are not interpreted.
fn image_part(mut parts: Multipart) -> Option<Vec<u8>> {
    if parts.len() >= 2 {
        Some(parts.swap_remove(1))
    } else {
        parts.pop()
    }
}

/// Iterator over normalized frames, borrowed from a `FrameIngestor`.
pub struct Frames<'a, C: Connect> {
    ingestor: &'a mut FrameIngestor<C>,
}

impl<C: Connect> Frames<'_, C> {
    pub fn stats(&self) -> &IngestStats {
        self.ingestor.stats()
    }

    pub fn error_state(&self) -> &ErrorState {
        self.ingestor.error_state()
    }
}

impl<C: Connect> Iterator for Frames<'_, C> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            if !self.ingestor.is_running() {
                self.ingestor.stop();
                return None;
            }
            self.ingestor.report_health();

            match self.ingestor.poll() {
                Step::Idle => std::thread::sleep(self.ingestor.errors.policy().idle_tick),
                Step::Dropped => {
                    self.ingestor.stats.frames_dropped += 1;
                    log::debug!("dropping payload that did not decode as an image");
                }
                Step::Skipped => {
                    self.ingestor.stats.frames_skipped += 1;
                    log::debug!("skipping frame (stride {})", self.ingestor.stride);
                }
                Step::Ready(frame) => {
                    self.ingestor.stats.frames_yielded += 1;
                    return Some(frame);
                }
                Step::Failed(fault) => self.ingestor.recover(fault),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_uses_second_part() {
        let parts = vec![b"{\"frame_id\":1}".to_vec(), b"jpeg".to_vec()];
        assert_eq!(image_part(parts), Some(b"jpeg".to_vec()));
    }

    #[test]
    fn single_part_is_the_image() {
        assert_eq!(image_part(vec![b"jpeg".to_vec()]), Some(b"jpeg".to_vec()));
        assert_eq!(image_part(Vec::new()), None);
    }

    #[test]
    fn health_timer_fires_once_per_interval() {
        let start = Instant::now();
        let mut timer = HealthTimer::new(Duration::from_secs(5), start);
        assert!(!timer.due(start + Duration::from_secs(4)));
        assert!(timer.due(start + Duration::from_secs(5)));
        assert!(!timer.due(start + Duration::from_secs(9)));
        assert!(timer.due(start + Duration::from_secs(10)));
    }

    #[test]
    fn stop_handle_shares_running_flag() {
        let running = Arc::new(AtomicBool::new(true));
        let handle = StopHandle {
            running: running.clone(),
        };
        let clone = handle.clone();
        clone.stop();
        assert!(!handle.is_running());
        assert!(!running.load(Ordering::SeqCst));
    }
}
