//! Best-effort geometry publishing.
//!
//! `GeometryPublisher::publish` copies a snapshot out of the shared buffer
//! under a single lock acquisition, then serializes and sends it with the
//! lock released. Nothing that happens after `open` is reported as an
//! error: the caller is a live perception loop.

use anyhow::Result;

use crate::geometry::{GeometrySnapshot, GeometrySource};
use crate::transport::{PublishEndpoint, Publisher};

/// Result of one publish call, for logging and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent { frames: usize, bytes: usize },
    Dropped,
}

pub struct GeometryPublisher<P: Publisher = PublishEndpoint> {
    publisher: P,
    sent: u64,
    dropped: u64,
}

impl GeometryPublisher<PublishEndpoint> {
    /// Bind the publish endpoint. Failure is a configuration error.
    pub fn open(endpoint: &str) -> Result<Self> {
        Ok(Self::new(PublishEndpoint::bind(endpoint)?))
    }
}

impl<P: Publisher> GeometryPublisher<P> {
    pub fn new(publisher: P) -> Self {
        Self {
            publisher,
            sent: 0,
            dropped: 0,
        }
    }

    /// Snapshot `source` and send it. Never fails; failures are logged.
    pub fn publish<S: GeometrySource>(&mut self, source: &S) -> PublishOutcome {
        let snapshot = match source.with_read_lock(|view| GeometrySnapshot::capture(view)) {
            Ok(snapshot) => snapshot,
            Err(e) => return self.drop_with(format_args!("error reading geometry: {:#}", e)),
        };

        let payload = match snapshot.to_bytes() {
            Ok(payload) => payload,
            Err(e) => return self.drop_with(format_args!("error serializing geometry: {:#}", e)),
        };

        let frames = snapshot.len();
        let bytes = payload.len();
        match self.publisher.send(payload) {
            Ok(()) => {
                self.sent += 1;
                log::debug!("published geometry: {} frames, {} bytes", frames, bytes);
                PublishOutcome::Sent { frames, bytes }
            }
            Err(e) => self.drop_with(format_args!("error sending geometry: {}", e)),
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn close(&mut self) {
        if let Err(e) = self.publisher.close() {
            log::debug!("ignoring publisher close error: {}", e);
        }
    }

    fn drop_with(&mut self, message: std::fmt::Arguments<'_>) -> PublishOutcome {
        self.dropped += 1;
        log::error!("{}", message);
        PublishOutcome::Dropped
    }
}
