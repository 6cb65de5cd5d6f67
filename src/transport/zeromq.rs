//! ZeroMQ SUB/PUB backend (feature: transport-zmq).

use anyhow::{Context as _, Result};
use std::time::Duration;
use zmq::{Context, Socket};

use super::{Connect, Multipart, Publisher, Subscriber, TransportError};

/// Opens SUB sockets connected to one endpoint, subscribed to everything.
pub struct ZmqConnector {
    context: Context,
    endpoint: String,
    recv_timeout: Duration,
}

impl ZmqConnector {
    pub fn new(endpoint: &str, recv_timeout: Duration) -> Self {
        Self {
            context: Context::new(),
            endpoint: endpoint.to_string(),
            recv_timeout,
        }
    }
}

impl Connect for ZmqConnector {
    type Subscriber = ZmqSubscriber;

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect(&mut self) -> Result<ZmqSubscriber, TransportError> {
        let socket = self.context.socket(zmq::SUB)?;
        let timeout_ms = i32::try_from(self.recv_timeout.as_millis()).unwrap_or(i32::MAX);
        socket.set_rcvtimeo(timeout_ms)?;
        socket.set_linger(0)?;
        socket.set_subscribe(b"")?;
        socket.connect(&self.endpoint)?;
        Ok(ZmqSubscriber {
            socket: Some(socket),
        })
    }
}

pub struct ZmqSubscriber {
    socket: Option<Socket>,
}

impl Subscriber for ZmqSubscriber {
    fn try_recv(&mut self) -> Result<Option<Multipart>, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::Disconnected)?;
        match socket.recv_multipart(zmq::DONTWAIT) {
            Ok(parts) => Ok(Some(parts)),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the socket closes it; linger is 0 so nothing is held back.
        self.socket.take();
        Ok(())
    }
}

/// Bound PUB socket.
pub struct ZmqPublisher {
    _context: Context,
    socket: Option<Socket>,
}

impl ZmqPublisher {
    pub fn bind(endpoint: &str) -> Result<Self> {
        let context = Context::new();
        let socket = context.socket(zmq::PUB).context("create zmq PUB socket")?;
        socket.set_linger(0).context("set zmq linger")?;
        socket
            .bind(endpoint)
            .with_context(|| format!("bind zmq publisher on {}", endpoint))?;
        log::info!("publishing geometry on {}", endpoint);
        Ok(Self {
            _context: context,
            socket: Some(socket),
        })
    }
}

impl Publisher for ZmqPublisher {
    fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::Disconnected)?;
        socket.send(payload, 0)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.socket.take();
        Ok(())
    }
}
