//! Pub/sub transport adapters.
//!
//! The ingest and publish sides only see the `Connect`, `Subscriber` and
//! `Publisher` traits. Concrete backends are picked from the endpoint scheme:
//!
//! - `mqtt://host:port/topic`, `mqtts://host:port/topic`: MQTT v5 via rumqttc
//! - `tcp://`, `ipc://`, `inproc://`: ZeroMQ SUB/PUB (feature: transport-zmq)

use anyhow::{anyhow, Result};
use std::time::Duration;

pub mod mqtt;
#[cfg(feature = "transport-zmq")]
pub mod zeromq;

pub use mqtt::{parse_mqtt_endpoint, MqttConnector, MqttEndpoint, MqttPublisher, MqttSubscriber};
#[cfg(feature = "transport-zmq")]
pub use zeromq::{ZmqConnector, ZmqPublisher, ZmqSubscriber};

/// One received message: `[image]` or `[metadata, image]`.
pub type Multipart = Vec<Vec<u8>>;

/// Failures reported by a transport backend.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("mqtt client error: {0}")]
    MqttClient(#[from] rumqttc::v5::ClientError),

    #[error("mqtt connection error: {0}")]
    MqttConnection(#[from] rumqttc::v5::ConnectionError),

    #[cfg(feature = "transport-zmq")]
    #[error("zmq error: {0}")]
    Zmq(#[from] ::zmq::Error),

    #[error("connection closed")]
    Disconnected,

    #[error("{0}")]
    Other(String),
}

/// A live subscriber connection.
pub trait Subscriber {
    /// Receive one message if one is waiting.
    ///
    /// `Ok(None)` means nothing is available yet and is not a failure.
    fn try_recv(&mut self) -> Result<Option<Multipart>, TransportError>;

    /// Close the connection. Callers treat errors as best-effort.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens subscriber connections to one fixed endpoint.
pub trait Connect {
    type Subscriber: Subscriber;

    fn endpoint(&self) -> &str;

    fn connect(&mut self) -> Result<Self::Subscriber, TransportError>;
}

/// A bound publish socket.
pub trait Publisher {
    fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scheme {
    Mqtt,
    Zmq,
}

fn scheme_of(endpoint: &str) -> Result<Scheme> {
    let (scheme, _) = endpoint
        .split_once("://")
        .ok_or_else(|| anyhow!("endpoint '{}' has no scheme", endpoint))?;
    match scheme {
        "mqtt" | "mqtts" => Ok(Scheme::Mqtt),
        "tcp" | "ipc" | "inproc" => Ok(Scheme::Zmq),
        other => Err(anyhow!(
            "unsupported endpoint scheme '{}'; expected mqtt, mqtts, tcp, ipc or inproc",
            other
        )),
    }
}

#[cfg(not(feature = "transport-zmq"))]
fn zmq_unavailable(endpoint: &str) -> anyhow::Error {
    anyhow!(
        "endpoint '{}' needs ZeroMQ: recompile with --features transport-zmq",
        endpoint
    )
}

/// Subscriber endpoint selected by scheme.
pub enum Endpoint {
    Mqtt(MqttConnector),
    #[cfg(feature = "transport-zmq")]
    Zmq(ZmqConnector),
}

impl Endpoint {
    pub fn subscriber(endpoint: &str, recv_timeout: Duration) -> Result<Self> {
        match scheme_of(endpoint)? {
            Scheme::Mqtt => Ok(Self::Mqtt(MqttConnector::new(endpoint, recv_timeout)?)),
            #[cfg(feature = "transport-zmq")]
            Scheme::Zmq => Ok(Self::Zmq(ZmqConnector::new(endpoint, recv_timeout))),
            #[cfg(not(feature = "transport-zmq"))]
            Scheme::Zmq => Err(zmq_unavailable(endpoint)),
        }
    }
}

/// Live connection produced by `Endpoint`.
pub enum Subscription {
    Mqtt(MqttSubscriber),
    #[cfg(feature = "transport-zmq")]
    Zmq(ZmqSubscriber),
}

impl Connect for Endpoint {
    type Subscriber = Subscription;

    fn endpoint(&self) -> &str {
        match self {
            Self::Mqtt(connector) => connector.endpoint(),
            #[cfg(feature = "transport-zmq")]
            Self::Zmq(connector) => connector.endpoint(),
        }
    }

    fn connect(&mut self) -> Result<Subscription, TransportError> {
        match self {
            Self::Mqtt(connector) => connector.connect().map(Subscription::Mqtt),
            #[cfg(feature = "transport-zmq")]
            Self::Zmq(connector) => connector.connect().map(Subscription::Zmq),
        }
    }
}

impl Subscriber for Subscription {
    fn try_recv(&mut self) -> Result<Option<Multipart>, TransportError> {
        match self {
            Self::Mqtt(sub) => sub.try_recv(),
            #[cfg(feature = "transport-zmq")]
            Self::Zmq(sub) => sub.try_recv(),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Mqtt(sub) => sub.close(),
            #[cfg(feature = "transport-zmq")]
            Self::Zmq(sub) => sub.close(),
        }
    }
}

/// Publish endpoint selected by scheme.
pub enum PublishEndpoint {
    Mqtt(MqttPublisher),
    #[cfg(feature = "transport-zmq")]
    Zmq(ZmqPublisher),
}

impl PublishEndpoint {
    /// Bind (ZeroMQ) or connect (MQTT) a publisher. Failure here is fatal.
    pub fn bind(endpoint: &str) -> Result<Self> {
        match scheme_of(endpoint)? {
            Scheme::Mqtt => Ok(Self::Mqtt(MqttPublisher::connect(endpoint)?)),
            #[cfg(feature = "transport-zmq")]
            Scheme::Zmq => Ok(Self::Zmq(ZmqPublisher::bind(endpoint)?)),
            #[cfg(not(feature = "transport-zmq"))]
            Scheme::Zmq => Err(zmq_unavailable(endpoint)),
        }
    }
}

impl Publisher for PublishEndpoint {
    fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        match self {
            Self::Mqtt(publisher) => publisher.send(payload),
            #[cfg(feature = "transport-zmq")]
            Self::Zmq(publisher) => publisher.send(payload),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Mqtt(publisher) => publisher.close(),
            #[cfg(feature = "transport-zmq")]
            Self::Zmq(publisher) => publisher.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_dispatch() {
        assert_eq!(scheme_of("mqtt://127.0.0.1:1883/cam").unwrap(), Scheme::Mqtt);
        assert_eq!(scheme_of("mqtts://broker:8883/cam").unwrap(), Scheme::Mqtt);
        assert_eq!(scheme_of("tcp://localhost:5555").unwrap(), Scheme::Zmq);
        assert_eq!(scheme_of("ipc:///tmp/frames").unwrap(), Scheme::Zmq);
        assert!(scheme_of("http://camera/stream").is_err());
        assert!(scheme_of("localhost:5555").is_err());
    }

    #[test]
    #[cfg(not(feature = "transport-zmq"))]
    fn zmq_endpoint_requires_feature() {
        let err = Endpoint::subscriber("tcp://localhost:5555", Duration::from_secs(1))
            .err()
            .expect("zmq endpoint rejected");
        assert!(err.to_string().contains("transport-zmq"));
    }
}
