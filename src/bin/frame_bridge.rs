//! frame_bridge - Receive camera frames from a pub/sub bus and normalize them.
//!
//! This process:
//! 1. Subscribes to compressed camera frames (MQTT, or ZeroMQ with transport-zmq)
//! 2. Decodes, undistorts and resizes each frame to the SLAM input budget
//! 3. Logs shapes, intrinsics and periodic receive health (also while the
//!    bus is stalled or reconnecting)
//! 4. Optionally publishes a loopback geometry buffer built from the received
//!    frames, to check the publish path end to end without a SLAM back end
//!
//! Ctrl-C stops the receive loop cleanly.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use slam_bridge::config::BridgeConfig;
use slam_bridge::geometry::{GeometryEntry, POSE_LEN};
use slam_bridge::{
    CalibrationProfile, ChannelOrder, Endpoint, Frame, FrameIngestor, GeometryPublisher,
    PublishOutcome, SharedGeometryBuffer,
};

/// Keyframes the loopback buffer holds before it stops recording.
const LOOPBACK_CAPACITY: usize = 1024;

/// Loopback disparities and intrinsics are stored at 1/8 of the frame size.
const LOOPBACK_DOWNSCALE: usize = 8;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

const IDENTITY_POSE: [f32; POSE_LEN] = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Receive and normalize camera frames for a SLAM pipeline"
)]
struct Args {
    /// Subscriber endpoint (e.g. mqtt://127.0.0.1:1883/camera, or tcp://localhost:5555
    /// with transport-zmq).
    /// Overrides the config file.
    #[arg(long)]
    subscribe: Option<String>,

    /// Calibration file: one row "fx fy cx cy [distortion...]".
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Yield every Nth decoded frame.
    #[arg(long)]
    stride: Option<u32>,

    /// Publish a loopback geometry buffer to this endpoint.
    #[arg(long)]
    publish: Option<String>,

    /// Loopback publish interval in milliseconds.
    #[arg(long)]
    publish_interval_ms: Option<u64>,

    /// Output channel order: 'bgr' (default) or 'rgb'.
    #[arg(long, env = "SLAM_BRIDGE_CHANNEL_ORDER", default_value = "bgr")]
    channel_order: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = BridgeConfig::load()?;
    if let Some(endpoint) = args.subscribe {
        cfg.subscribe.endpoint = endpoint;
    }
    if let Some(path) = args.calibration {
        cfg.subscribe.calibration_path = path;
    }
    if let Some(stride) = args.stride {
        cfg.subscribe.stride = stride;
    }
    if let Some(endpoint) = args.publish {
        cfg.publish.endpoint = Some(endpoint);
    }
    if let Some(millis) = args.publish_interval_ms {
        cfg.publish.interval = Duration::from_millis(millis);
    }
    cfg.validate()?;

    let channel_order = parse_channel_order(&args.channel_order)?;

    log::info!("frame bridge starting");
    log::info!("  Subscribe: {}", cfg.subscribe.endpoint);
    log::info!("  Calibration: {}", cfg.subscribe.calibration_path.display());
    log::info!("  Stride: {}", cfg.subscribe.stride);
    log::info!(
        "  Publish: {}",
        cfg.publish.endpoint.as_deref().unwrap_or("disabled")
    );

    let calibration = CalibrationProfile::load(&cfg.subscribe.calibration_path)?;
    let connector = Endpoint::subscriber(&cfg.subscribe.endpoint, cfg.retry.recv_timeout)?;
    let mut settings = cfg.ingest_settings();
    settings.channel_order = channel_order;
    settings.health_interval = Some(HEALTH_LOG_INTERVAL);
    let mut ingestor = FrameIngestor::with_connector(connector, calibration, settings)?;

    let stop = ingestor.stop_handle();
    ctrlc::set_handler(move || stop.stop()).context("error setting Ctrl-C handler")?;

    let mut loopback = match cfg.publish.endpoint.as_deref() {
        Some(endpoint) => Some(Loopback::open(endpoint, cfg.publish.interval)?),
        None => None,
    };

    for frame in ingestor.frames() {
        log::debug!(
            "frame #{}: shape={:?} intrinsics=[{:.2}, {:.2}, {:.2}, {:.2}]",
            frame.sequence,
            frame.image.shape(),
            frame.intrinsics[0],
            frame.intrinsics[1],
            frame.intrinsics[2],
            frame.intrinsics[3]
        );

        if let Some(loopback) = loopback.as_mut() {
            loopback.record(&frame);
            loopback.publish_if_due();
        }
    }

    let stats = ingestor.stats().clone();
    log::info!(
        "frame bridge stopped: yielded={} dropped={} errors={} reconnects={}",
        stats.frames_yielded,
        stats.frames_dropped,
        stats.errors,
        stats.reconnects
    );
    if let Some(mut loopback) = loopback {
        loopback.publisher.close();
    }
    Ok(())
}

fn parse_channel_order(value: &str) -> Result<ChannelOrder> {
    match value.to_lowercase().as_str() {
        "bgr" => Ok(ChannelOrder::Bgr),
        "rgb" => Ok(ChannelOrder::Rgb),
        other => Err(anyhow!(
            "unknown channel order '{}': expected 'bgr' or 'rgb'",
            other
        )),
    }
}

/// Geometry buffer fed from received frames instead of a SLAM back end.
struct Loopback {
    publisher: GeometryPublisher,
    buffer: Option<SharedGeometryBuffer>,
    interval: Duration,
    last_publish: Instant,
    full_logged: bool,
}

impl Loopback {
    fn open(endpoint: &str, interval: Duration) -> Result<Self> {
        Ok(Self {
            publisher: GeometryPublisher::open(endpoint)?,
            buffer: None,
            interval,
            last_publish: Instant::now(),
            full_logged: false,
        })
    }

    fn record(&mut self, frame: &Frame) {
        let height = frame.image.height() / LOOPBACK_DOWNSCALE;
        let width = frame.image.width() / LOOPBACK_DOWNSCALE;
        let buffer = self
            .buffer
            .get_or_insert_with(|| SharedGeometryBuffer::new(LOOPBACK_CAPACITY, height, width));

        let scale = LOOPBACK_DOWNSCALE as f64;
        let entry = GeometryEntry {
            tstamp: frame.sequence as f64,
            pose: IDENTITY_POSE,
            disp: vec![1.0; height * width],
            intrinsics: frame.intrinsics.map(|v| (v / scale) as f32),
        };
        if let Err(e) = buffer.push(entry) {
            if !self.full_logged {
                log::warn!("loopback geometry not recorded: {:#}", e);
                self.full_logged = true;
            }
        }
    }

    fn publish_if_due(&mut self) {
        if self.last_publish.elapsed() < self.interval {
            return;
        }
        self.last_publish = Instant::now();
        if let Some(buffer) = self.buffer.as_ref() {
            if let PublishOutcome::Sent { frames, bytes } = self.publisher.publish(buffer) {
                log::info!("published loopback geometry: {} frames, {} bytes", frames, bytes);
            }
        }
    }
}
