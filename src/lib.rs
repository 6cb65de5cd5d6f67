//! SLAM pub/sub bridge
//!
//! This crate connects a real-time SLAM pipeline to a message bus in both
//! directions.
//!
//! # Architecture
//!
//! - **Receive side**: `FrameIngestor` subscribes to compressed camera frames,
//!   decodes them, removes lens distortion, resizes them to a fixed pixel
//!   budget with 8-aligned dimensions and yields `[1, 3, H, W]` tensors with
//!   matching intrinsics. Transport faults are absorbed with exponential
//!   backoff and reconnects; the consumer only ever sees frames.
//! - **Publish side**: `GeometryPublisher` snapshots a shared, growing
//!   geometry buffer (timestamps, poses, disparities, intrinsics) under one
//!   lock acquisition and sends it as a single message. Publishing is
//!   best-effort and never returns an error to the caller.
//!
//! # Module Structure
//!
//! - `calibration`: pinhole calibration rows and the distortion model
//! - `frame`: normalized frame and tensor types
//! - `ingest`: receive loop, backoff state, normalization pipeline
//! - `geometry`: shared geometry buffer, snapshots, wire arrays
//! - `publish`: geometry publisher
//! - `transport`: MQTT and ZeroMQ adapters behind common traits
//! - `config`: file + environment configuration

pub mod calibration;
pub mod config;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod publish;
pub mod transport;

pub use calibration::{CalibrationProfile, Distortion};
pub use frame::{Frame, ImageTensor, Intrinsics};
pub use geometry::{
    GeometryEntry, GeometryFrames, GeometrySnapshot, GeometrySource, GeometryView, NumericArray,
    SharedGeometryBuffer,
};
pub use ingest::{
    ChannelOrder, ErrorState, FrameIngestor, Frames, IngestSettings, IngestStats, Normalizer,
    Recovery, RetryPolicy, StopHandle,
};
pub use publish::{GeometryPublisher, PublishOutcome};
pub use transport::{
    Connect, Endpoint, Multipart, PublishEndpoint, Publisher, Subscriber, Subscription,
    TransportError,
};
