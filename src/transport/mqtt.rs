//! MQTT v5 backend.
//!
//! Endpoints carry the topic in the path: `mqtt://host:port/camera/front`.
//! A `#` wildcard survives URL parsing as the fragment and is re-attached.
//! MQTT messages are single-part, so the publish payload is the image.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, ConnectionError, Event, Incoming, MqttOptions};
use rumqttc::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use url::{Host, Url};

use super::{Connect, Multipart, Publisher, Subscriber, TransportError};

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;

/// Parsed MQTT endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub topic: String,
}

/// Parse `mqtt[s]://host[:port]/topic`.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let url = Url::parse(addr.trim()).with_context(|| format!("parse mqtt endpoint {}", addr))?;
    let use_tls = match url.scheme() {
        "mqtt" => false,
        "mqtts" => true,
        other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
    };
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => return Err(anyhow!("missing MQTT host in {}", addr)),
    };
    let port = url
        .port()
        .unwrap_or(if use_tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

    let mut topic = url.path().trim_start_matches('/').to_string();
    if let Some(fragment) = url.fragment() {
        topic.push('#');
        topic.push_str(fragment);
    }
    if topic.is_empty() {
        return Err(anyhow!("missing MQTT topic in {}", addr));
    }

    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
        topic,
    })
}

fn mqtt_options(endpoint: &MqttEndpoint, role: &str) -> MqttOptions {
    let client_id = format!("slam-bridge-{}-{}", role, std::process::id());
    let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_start(true);
    if endpoint.use_tls {
        options.set_transport(Transport::tls_with_default_config());
    } else {
        options.set_transport(Transport::tcp());
    }
    options
}

/// Opens MQTT subscriptions to one endpoint.
pub struct MqttConnector {
    raw: String,
    endpoint: MqttEndpoint,
    recv_timeout: Duration,
}

impl MqttConnector {
    pub fn new(addr: &str, recv_timeout: Duration) -> Result<Self> {
        Ok(Self {
            raw: addr.to_string(),
            endpoint: parse_mqtt_endpoint(addr)?,
            recv_timeout,
        })
    }
}

impl Connect for MqttConnector {
    type Subscriber = MqttSubscriber;

    fn endpoint(&self) -> &str {
        &self.raw
    }

    fn connect(&mut self) -> Result<MqttSubscriber, TransportError> {
        let options = mqtt_options(&self.endpoint, "sub");
        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        client.subscribe(self.endpoint.topic.clone(), QoS::AtMostOnce)?;

        let (tx, events) = mpsc::channel();
        let closing = Arc::new(AtomicBool::new(false));
        spawn_subscriber_loop(connection, tx, closing.clone())
            .map_err(|e| TransportError::Other(format!("spawn mqtt subscriber thread: {}", e)))?;
        log::debug!(
            "mqtt subscription queued: {}:{} topic={} (TLS: {})",
            self.endpoint.host,
            self.endpoint.port,
            self.endpoint.topic,
            self.endpoint.use_tls
        );
        Ok(MqttSubscriber {
            client,
            events,
            closing,
            recv_timeout: self.recv_timeout,
        })
    }
}

/// Inbound publish payload, or the error that ended the connection.
type Delivery = std::result::Result<Vec<u8>, ConnectionError>;

/// Drain the connection into `tx`. The thread ends on the first connection
/// error, on close, or when the receiver is gone; the ingestor reconnects.
fn spawn_subscriber_loop(
    mut connection: Connection,
    tx: Sender<Delivery>,
    closing: Arc<AtomicBool>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("mqtt-subscriber".to_string())
        .spawn(move || {
            for event in connection.iter() {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if tx.send(Ok(publish.payload.to_vec())).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        })
        .map(drop)
}

/// Wait up to `timeout` for the next delivery.
fn receive(
    events: &Receiver<Delivery>,
    timeout: Duration,
) -> Result<Option<Multipart>, TransportError> {
    match events.recv_timeout(timeout) {
        Ok(Ok(payload)) => Ok(Some(vec![payload])),
        Ok(Err(e)) => Err(e.into()),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
    }
}

pub struct MqttSubscriber {
    client: Client,
    events: Receiver<Delivery>,
    closing: Arc<AtomicBool>,
    recv_timeout: Duration,
}

impl Subscriber for MqttSubscriber {
    fn try_recv(&mut self) -> Result<Option<Multipart>, TransportError> {
        receive(&self.events, self.recv_timeout)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        Ok(())
    }
}

/// MQTT publisher with a background thread driving the event loop.
pub struct MqttPublisher {
    client: Client,
    topic: String,
    closing: Arc<AtomicBool>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttPublisher {
    pub fn connect(addr: &str) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(addr)?;
        let options = mqtt_options(&endpoint, "pub");
        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let closing = Arc::new(AtomicBool::new(false));
        let handle = spawn_event_loop(connection, closing.clone())
            .context("spawn mqtt publisher event loop")?;
        log::info!(
            "publishing geometry to {}:{} topic={} (TLS: {})",
            endpoint.host,
            endpoint.port,
            endpoint.topic,
            endpoint.use_tls
        );
        Ok(Self {
            client,
            topic: endpoint.topic,
            closing,
            event_loop: Some(handle),
        })
    }
}

fn spawn_event_loop(
    mut connection: Connection,
    closing: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-publisher".to_string())
        .spawn(move || {
            for event in connection.iter() {
                if let Err(e) = event {
                    if closing.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!("MQTT publisher connection error: {}", e);
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        })
}

impl Publisher for MqttPublisher {
    fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        // try_publish never blocks the caller when the request queue is full.
        self.client
            .try_publish(self.topic.clone(), QoS::AtMostOnce, false, payload)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        let result = self.client.disconnect();
        if let Some(handle) = self.event_loop.take() {
            let _ = handle.join();
        }
        result.map_err(TransportError::from)
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        if self.event_loop.is_some() {
            let _ = self.close();
        }
    }
}
