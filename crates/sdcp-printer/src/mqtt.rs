//! MQTT channel for firmware that prefers a broker workflow.
//!
//! The rumqttc blocking connection runs on its own OS thread. The only thing
//! that crosses from that thread into async code is [`BrokerEvent`], sent over
//! an unbounded tokio channel; an async bridge task then feeds frames into the
//! connection's [`FrameRouter`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Result, SdcpError};
use crate::protocol::{request_topic, response_topic, status_topic};
use crate::router::{FrameRouter, InboundFrame};
use crate::transport::{Connection, Transport};

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Broker host.
    pub broker_host: String,
    /// Broker port.
    pub broker_port: u16,
    /// Mainboard id used to build topics.
    pub mainboard_id: String,
    /// Client id; generated when `None`.
    pub client_id: Option<String>,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Time allowed for the CONNACK.
    pub connect_timeout: Duration,
}

impl MqttSettings {
    /// Settings with the default keep-alive (30 s) and connect timeout (5 s).
    pub fn new(
        broker_host: impl Into<String>,
        broker_port: u16,
        mainboard_id: impl Into<String>,
    ) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port,
            mainboard_id: mainboard_id.into(),
            client_id: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Tell the printer which broker port to use (`M66666 <port>`).
pub async fn register_broker(printer: SocketAddr, broker_port: u16) -> Result<()> {
    let bind: SocketAddr = if printer.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    let message = format!("M66666 {broker_port}");
    socket.send_to(message.as_bytes(), printer).await?;
    tracing::info!(%printer, broker_port, "registered MQTT broker with printer");
    Ok(())
}

/// Messages sent from the network thread.
enum BrokerEvent {
    Started(Client),
    Connected,
    Failed(String),
    Frame(InboundFrame),
}

/// MQTT variant of [`Transport`].
pub struct MqttTransport {
    client: Client,
    endpoint: String,
    request_topic: String,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

#[async_trait]
impl Transport for MqttTransport {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn send_frame(&self, text: String) -> Result<()> {
        self.client
            .try_publish(&self.request_topic, QoS::AtMostOnce, false, text)
            .map_err(|e| SdcpError::Mqtt(e.to_string()))
    }

    async fn shutdown(&self) {
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("MQTT disconnect request failed: {e}");
        }
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        let join = tokio::task::spawn_blocking(move || handle.join());
        if tokio::time::timeout(Duration::from_secs(2), join).await.is_err() {
            tracing::warn!(endpoint = %self.endpoint, "MQTT network thread did not stop in time");
        }
    }
}

/// Connect to the broker, subscribe to the response and status topics and start the bridge.
pub async fn connect(settings: MqttSettings) -> Result<Connection> {
    let client_id = settings.client_id.clone().unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("sdcp-{}", &id[..8])
    });
    let endpoint = format!("mqtt://{}:{}", settings.broker_host, settings.broker_port);

    let mut options = MqttOptions::new(client_id, settings.broker_host.clone(), settings.broker_port);
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);

    let topics = vec![
        response_topic(&settings.mainboard_id),
        status_topic(&settings.mainboard_id),
    ];
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let thread = thread::Builder::new()
        .name("sdcp-mqtt".into())
        .spawn(move || network_loop(options, topics, events_tx))?;

    let deadline = Instant::now() + settings.connect_timeout;
    let mut client = None;
    loop {
        match tokio::time::timeout_at(deadline, events_rx.recv()).await {
            Ok(Some(BrokerEvent::Started(started))) => client = Some(started),
            Ok(Some(BrokerEvent::Connected)) => break,
            Ok(Some(BrokerEvent::Failed(reason))) => return Err(SdcpError::Mqtt(reason)),
            Ok(Some(BrokerEvent::Frame(_))) => {}
            Ok(None) => return Err(SdcpError::Mqtt("network thread exited".into())),
            Err(_) => {
                if let Some(client) = &client {
                    let _ = client.try_disconnect();
                }
                return Err(SdcpError::Mqtt(format!(
                    "connection to {endpoint} timed out"
                )));
            }
        }
    }
    let client = client.ok_or_else(|| SdcpError::Mqtt("client handle missing".into()))?;
    tracing::info!(%endpoint, "MQTT connected");

    let router = FrameRouter::new();
    let bridge = tokio::spawn(bridge_events(events_rx, Arc::clone(&router)));

    let transport = MqttTransport {
        client,
        endpoint,
        request_topic: request_topic(&settings.mainboard_id),
        thread: Mutex::new(Some(thread)),
    };
    Ok(Connection::new(Box::new(transport), router, vec![bridge]))
}

/// Feed broker frames into `router` until the network thread goes away, then shut it down.
async fn bridge_events(
    mut events: mpsc::UnboundedReceiver<BrokerEvent>,
    router: Arc<FrameRouter>,
) {
    while let Some(event) = events.recv().await {
        match event {
            BrokerEvent::Frame(frame) => {
                router.route(frame);
            }
            BrokerEvent::Failed(reason) => {
                tracing::warn!("MQTT connection lost: {reason}");
            }
            BrokerEvent::Started(_) | BrokerEvent::Connected => {}
        }
    }
    tracing::debug!("MQTT bridge stopped");
    router.shutdown();
}

/// Runs on the dedicated network thread until the connection ends or the receiver is gone.
fn network_loop(
    options: MqttOptions,
    topics: Vec<String>,
    events: mpsc::UnboundedSender<BrokerEvent>,
) {
    let (client, mut connection) = Client::new(options, 10);
    if events.send(BrokerEvent::Started(client.clone())).is_err() {
        return;
    }

    for notification in connection.iter() {
        let event = match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                for topic in &topics {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                        let _ = events.send(BrokerEvent::Failed(e.to_string()));
                        return;
                    }
                }
                BrokerEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => BrokerEvent::Frame(InboundFrame {
                topic: Some(publish.topic.clone()),
                text: String::from_utf8_lossy(&publish.payload).into_owned(),
            }),
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => break,
            Ok(_) => continue,
            Err(e) => {
                let _ = events.send(BrokerEvent::Failed(e.to_string()));
                break;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
}
