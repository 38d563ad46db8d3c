use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::{
    topics::{self, Category},
    transport::{Inbound, MqttConfig, PahoTransport, Transport, TransportError},
};
use crate::{
    constants,
    eui::Eui64,
    models::{GatewayStats, RxPacket, TxAck, TxPacket},
    shutdown,
};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("could not encode message: {0}")]
    Json(#[from] serde_json::Error),
}

type Subscriptions = Arc<AsyncMutex<HashSet<Eui64>>>;

/// MQTT side of the bridge. Publishes gateway events and turns downlink
/// commands on the subscribed `gateway/<mac>/tx` topics into [`TxPacket`]s.
pub struct MqttBackend {
    transport: Arc<dyn Transport>,
    gateways: Subscriptions,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBackend {
    pub async fn connect(config: &MqttConfig) -> Result<(Self, mpsc::Receiver<TxPacket>), BridgeError> {
        let (transport, inbound) = PahoTransport::connect(config).await?;
        Ok(Self::new(Arc::new(transport), inbound))
    }

    pub fn new(transport: Arc<dyn Transport>, inbound: mpsc::Receiver<Inbound>) -> (Self, mpsc::Receiver<TxPacket>) {
        let gateways = Subscriptions::default();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tx_packets, tx_packets_rx) = mpsc::channel(constants::EVENT_CHANNEL_CAPACITY);

        let listener = Listener {
            transport: Arc::clone(&transport),
            gateways: Arc::clone(&gateways),
            tx_packets,
        };
        let listener = tokio::spawn(listener.run(inbound, shutdown_rx));

        let backend = Self {
            transport,
            gateways,
            shutdown,
            listener: Mutex::new(Some(listener)),
        };
        (backend, tx_packets_rx)
    }

    pub async fn subscribe_gateway(&self, gateway: Eui64) -> Result<(), BridgeError> {
        let mut gateways = self.gateways.lock().await;
        if gateways.contains(&gateway) {
            return Ok(());
        }

        let topic = topics::topic(gateway, Category::Tx);
        self.transport.subscribe(&topic).await?;
        gateways.insert(gateway);
        info!(gateway = %gateway, topic = %topic, "subscribed to gateway topic");
        Ok(())
    }

    pub async fn unsubscribe_gateway(&self, gateway: Eui64) -> Result<(), BridgeError> {
        let mut gateways = self.gateways.lock().await;
        if !gateways.contains(&gateway) {
            return Ok(());
        }

        // forget it even if the broker call fails, a later reconnect must not restore it
        gateways.remove(&gateway);
        let topic = topics::topic(gateway, Category::Tx);
        self.transport.unsubscribe(&topic).await?;
        info!(gateway = %gateway, topic = %topic, "unsubscribed from gateway topic");
        Ok(())
    }

    pub async fn is_subscribed(&self, gateway: Eui64) -> bool {
        self.gateways.lock().await.contains(&gateway)
    }

    pub async fn publish_rx(&self, packet: &RxPacket) -> Result<(), BridgeError> {
        self.publish(packet.rx_info.mac, Category::Rx, packet).await
    }

    pub async fn publish_stats(&self, stats: &GatewayStats) -> Result<(), BridgeError> {
        self.publish(stats.mac, Category::Stats, stats).await
    }

    pub async fn publish_tx_ack(&self, ack: &TxAck) -> Result<(), BridgeError> {
        self.publish(ack.mac, Category::Ack, ack).await
    }

    async fn publish<T: Serialize>(&self, gateway: Eui64, category: Category, value: &T) -> Result<(), BridgeError> {
        let topic = topics::topic(gateway, category);
        let payload = serde_json::to_vec(value)?;
        self.transport.publish(&topic, payload).await?;
        debug!(gateway = %gateway, topic = %topic, "published");
        Ok(())
    }

    /// Stops the listener and closes the transport. Safe to call more than once.
    pub async fn close(&self) -> Result<(), BridgeError> {
        self.shutdown.send_replace(true);
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(listener) = listener else {
            return Ok(());
        };

        if let Err(e) = listener.await {
            error!(error = %e, "mqtt listener task failed");
        }
        self.transport.close().await?;
        Ok(())
    }
}

struct Listener {
    transport: Arc<dyn Transport>,
    gateways: Subscriptions,
    tx_packets: mpsc::Sender<TxPacket>,
}

impl Listener {
    async fn run(self, mut inbound: mpsc::Receiver<Inbound>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => break,
                event = inbound.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                Inbound::Message { topic, payload } => self.handle_message(&topic, &payload).await,
                Inbound::Connected => self.resubscribe().await,
            }
        }
        debug!("mqtt listener stopped");
    }

    async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let gateway = match topics::parse(topic) {
            Some((gateway, Category::Tx)) => gateway,
            _ => {
                debug!(topic, "ignoring message on unexpected topic");
                return;
            }
        };
        if !self.gateways.lock().await.contains(&gateway) {
            debug!(gateway = %gateway, "ignoring downlink for gateway without subscription");
            return;
        }

        let packet: TxPacket = match serde_json::from_slice(payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(gateway = %gateway, error = %e, "could not decode downlink command");
                return;
            }
        };
        if packet.tx_info.mac != gateway {
            warn!(topic = %gateway, payload = %packet.tx_info.mac, "downlink gateway does not match topic");
            return;
        }

        if self.tx_packets.send(packet).await.is_err() {
            debug!(gateway = %gateway, "downlink dropped, channel closed");
        }
    }

    async fn resubscribe(&self) {
        let gateways = self.gateways.lock().await;
        if gateways.is_empty() {
            return;
        }

        info!(count = gateways.len(), "restoring gateway subscriptions");
        for gateway in gateways.iter() {
            let topic = topics::topic(*gateway, Category::Tx);
            if let Err(e) = self.transport.subscribe(&topic).await {
                error!(gateway = %gateway, error = %e, "could not restore subscription");
            }
        }
    }
}
