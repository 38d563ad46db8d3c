//! Pub/sub client seam. [`PahoTransport`] talks to a real MQTT broker,
//! [`MemoryTransport`] keeps everything in process.

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use paho_mqtt::{AsyncClient, ConnectOptionsBuilder, CreateOptionsBuilder, Message, SslOptions, SslOptionsBuilder};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::constants;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("mqtt: {0}")]
    Mqtt(#[from] paho_mqtt::Error),

    #[error("transport is closed")]
    Closed,

    #[error("transport rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub qos: i32,
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: constants::DEFAULT_MQTT_SERVER.to_string(),
            username: None,
            password: None,
            ca_cert: None,
            tls_cert: None,
            tls_key: None,
            qos: 0,
            keep_alive: constants::MQTT_KEEP_ALIVE,
        }
    }
}

/// Something the transport hands to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message { topic: String, payload: Vec<u8> },
    /// The session was (re)established; subscriptions may have been lost.
    Connected,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

pub struct PahoTransport {
    client: AsyncClient,
    qos: i32,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl PahoTransport {
    pub async fn connect(config: &MqttConfig) -> Result<(Self, mpsc::Receiver<Inbound>), TransportError> {
        let client_id = format!("lora-gateway-bridge-{:08x}", rand::random::<u32>());
        let create = CreateOptionsBuilder::new()
            .server_uri(&config.server)
            .client_id(&client_id)
            .finalize();
        let mut client = AsyncClient::new(create)?;
        let stream = client.get_stream(constants::EVENT_CHANNEL_CAPACITY);

        let (inbound_tx, inbound) = mpsc::channel(constants::EVENT_CHANNEL_CAPACITY);
        let connected = inbound_tx.clone();
        client.set_connected_callback(move |_| {
            if connected.try_send(Inbound::Connected).is_err() {
                warn!("could not report mqtt (re)connect, inbound queue full");
            }
        });

        let options = {
            let mut builder = ConnectOptionsBuilder::new();
            builder
                .keep_alive_interval(config.keep_alive)
                .clean_session(true)
                .automatic_reconnect(constants::MQTT_RECONNECT_MIN, constants::MQTT_RECONNECT_MAX);
            if let Some(username) = &config.username {
                builder.user_name(username.as_str());
            }
            if let Some(password) = &config.password {
                builder.password(password.as_str());
            }
            if let Some(ssl) = ssl_options(config)? {
                builder.ssl_options(ssl);
            }
            builder.finalize()
        };

        client.connect(options).await?;
        info!(server = %config.server, client_id = %client_id, "connected to mqtt broker");

        let forwarder = tokio::spawn(async move {
            while let Ok(item) = stream.recv().await {
                match item {
                    Some(msg) => {
                        let inbound = Inbound::Message {
                            topic: msg.topic().to_string(),
                            payload: msg.payload().to_vec(),
                        };
                        if inbound_tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                    None => warn!("mqtt connection lost, waiting for reconnect"),
                }
            }
            debug!("mqtt message stream ended");
        });

        let transport = Self {
            client,
            qos: config.qos,
            forwarder: Mutex::new(Some(forwarder)),
        };
        Ok((transport, inbound))
    }
}

fn ssl_options(config: &MqttConfig) -> Result<Option<SslOptions>, TransportError> {
    if config.ca_cert.is_none() && config.tls_cert.is_none() {
        return Ok(None);
    }

    let mut builder = SslOptionsBuilder::new();
    if let Some(ca_cert) = &config.ca_cert {
        builder.trust_store(ca_cert)?;
    }
    if let Some(tls_cert) = &config.tls_cert {
        builder.key_store(tls_cert)?;
    }
    if let Some(tls_key) = &config.tls_key {
        builder.private_key(tls_key)?;
    }
    Ok(Some(builder.finalize()))
}

#[async_trait]
impl Transport for PahoTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client.publish(Message::new(topic, payload, self.qos)).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client.subscribe(topic, self.qos).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let forwarder = self.forwarder.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(forwarder) = forwarder else {
            return Ok(());
        };

        let result = if self.client.is_connected() {
            self.client.disconnect(None).await.map(|_| ())
        } else {
            Ok(())
        };
        self.client.stop_stream();
        forwarder.abort();
        info!("disconnected from mqtt broker");
        result.map_err(TransportError::from)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    published: Vec<Published>,
    subscriptions: BTreeSet<String>,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
    fail_publish: bool,
    fail_subscribe: bool,
    closed: bool,
}

/// In-process transport. Records every call and lets the owner inject
/// inbound messages and failures.
#[derive(Debug)]
pub struct MemoryTransport {
    inbound: mpsc::Sender<Inbound>,
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Inbound>) {
        let (inbound, rx) = mpsc::channel(constants::EVENT_CHANNEL_CAPACITY);
        let transport = Self {
            inbound,
            state: Mutex::default(),
        };
        (Arc::new(transport), rx)
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let msg = Inbound::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        };
        let _ = self.inbound.send(msg).await;
    }

    /// Simulates the session coming back after a drop.
    pub async fn reconnect(&self) {
        let _ = self.inbound.send(Inbound::Connected).await;
    }

    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.iter().cloned().collect()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.state().unsubscribe_calls
    }

    pub fn fail_publish(&self, fail: bool) {
        self.state().fail_publish = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state().fail_subscribe = fail;
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.fail_publish {
            return Err(TransportError::Rejected(format!("publish to {topic}")));
        }
        state.published.push(Published {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.subscribe_calls += 1;
        if state.fail_subscribe {
            return Err(TransportError::Rejected(format!("subscribe to {topic}")));
        }
        state.subscriptions.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.unsubscribe_calls += 1;
        state.subscriptions.remove(topic);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state().closed = true;
        Ok(())
    }
}
