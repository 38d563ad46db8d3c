//! UDP side of the bridge: receives packet_forwarder datagrams, keeps the
//! gateway registry current and turns frames into typed events.

use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use super::{
    packets::{Frame, Payload},
    registry::{GatewayRegistry, Sighting},
    structs::{ConversionError, PullRespPayload, PushDataPayload, TxAckPayload, Txpk},
};
use crate::{
    constants,
    eui::Eui64,
    models::{CrcStatus, GatewayStats, Outcome, RxPacket, TxAck, TxPacket},
    shutdown,
};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("could not bind UDP socket to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("gateway {0} is unknown")]
    UnknownGateway(Eui64),

    #[error("could not write to {addr}: {source}")]
    SocketWrite {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid downlink: {0}")]
    Conversion(#[from] ConversionError),

    #[error("gateway backend is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub bind: String,
    pub skip_crc_check: bool,
    pub gateway_timeout: Duration,
    pub sweep_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bind: constants::DEFAULT_UDP_BIND.to_string(),
            skip_crc_check: false,
            gateway_timeout: constants::GATEWAY_TIMEOUT,
            sweep_interval: constants::SWEEP_INTERVAL,
            channel_capacity: constants::EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Told about gateways appearing and disappearing.
#[async_trait]
pub trait GatewayPresence: Send + Sync {
    async fn on_add(&self, gateway: Eui64) -> crate::Result<()>;

    async fn on_delete(&self, gateway: Eui64) -> crate::Result<()>;
}

/// Event streams of an open backend. They close once the backend is closed.
#[derive(Debug)]
pub struct GatewayEvents {
    pub rx_packets: mpsc::Receiver<RxPacket>,
    pub stats: mpsc::Receiver<GatewayStats>,
    pub tx_acks: mpsc::Receiver<TxAck>,
}

// Registry changes and their callbacks run under `gate` so that an eviction's
// on_delete cannot overtake a later on_add for the same gateway.
struct Presence {
    handler: Arc<dyn GatewayPresence>,
    gate: AsyncMutex<()>,
}

pub struct UdpBackend {
    socket: Arc<UdpSocket>,
    registry: Arc<GatewayRegistry>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpBackend {
    pub async fn open(
        config: &BackendConfig,
        presence: Arc<dyn GatewayPresence>,
    ) -> Result<(Self, GatewayEvents), BackendError> {
        let socket = UdpSocket::bind(config.bind.as_str())
            .await
            .map_err(|source| BackendError::Bind {
                addr: config.bind.clone(),
                source,
            })?;
        let socket = Arc::new(socket);
        if let Ok(addr) = socket.local_addr() {
            info!(addr = %addr, "starting gateway udp listener");
        }

        let registry = Arc::new(GatewayRegistry::new());
        let presence = Arc::new(Presence {
            handler: presence,
            gate: AsyncMutex::new(()),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (rx_packets_tx, rx_packets) = mpsc::channel(config.channel_capacity);
        let (stats_tx, stats) = mpsc::channel(config.channel_capacity);
        let (tx_acks_tx, tx_acks) = mpsc::channel(config.channel_capacity);

        let listener = Listener {
            socket: Arc::clone(&socket),
            registry: Arc::clone(&registry),
            presence: Arc::clone(&presence),
            skip_crc_check: config.skip_crc_check,
            rx_packets: rx_packets_tx,
            stats: stats_tx,
            tx_acks: tx_acks_tx,
        };
        let sweeper = Sweeper {
            registry: Arc::clone(&registry),
            presence,
            timeout: config.gateway_timeout,
            interval: config.sweep_interval,
        };

        let tasks = vec![
            tokio::spawn(listener.run(shutdown_rx.clone())),
            tokio::spawn(sweeper.run(shutdown_rx)),
        ];

        let backend = Self {
            socket,
            registry,
            shutdown,
            tasks: Mutex::new(tasks),
        };
        let events = GatewayEvents {
            rx_packets,
            stats,
            tx_acks,
        };
        Ok((backend, events))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> &GatewayRegistry {
        &self.registry
    }

    /// Sends a downlink as PULL_RESP to the gateway's last known address.
    /// Returns the token the gateway will echo in its TX_ACK.
    pub async fn send(&self, packet: &TxPacket) -> Result<u16, BackendError> {
        if *self.shutdown.borrow() {
            return Err(BackendError::Closed);
        }

        let gateway = packet.tx_info.mac;
        let endpoint = self
            .registry
            .resolve(gateway)
            .ok_or(BackendError::UnknownGateway(gateway))?;
        let txpk = Txpk::from_tx_packet(packet)?;

        let token: u16 = rand::random();
        let frame = Frame::new(
            endpoint.version,
            token,
            Payload::PullResp {
                body: PullRespPayload { txpk },
            },
        );

        self.registry.track_token(gateway, token, Instant::now());
        if let Err(source) = self.socket.send_to(&frame.encode(), endpoint.addr).await {
            self.registry.acknowledge(gateway, token);
            return Err(BackendError::SocketWrite {
                addr: endpoint.addr,
                source,
            });
        }

        debug!(gateway = %gateway, addr = %endpoint.addr, token, "sent PULL_RESP");
        Ok(token)
    }

    /// Stops the listener and sweeper. Safe to call more than once.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "gateway backend task failed");
            }
        }
        info!("gateway udp listener closed");
    }
}

impl Presence {
    async fn register(&self, registry: &GatewayRegistry, gateway: Eui64, sighting: Sighting) {
        let _gate = self.gate.lock().await;
        if !registry.touch(gateway, sighting, Instant::now()) {
            return;
        }

        info!(gateway = %gateway, addr = %sighting.addr, "gateway registered");
        if let Err(e) = self.handler.on_add(gateway).await {
            error!(gateway = %gateway, error = %e, "handling new gateway failed");
        }
    }
}

struct Listener {
    socket: Arc<UdpSocket>,
    registry: Arc<GatewayRegistry>,
    presence: Arc<Presence>,
    skip_crc_check: bool,
    rx_packets: mpsc::Sender<RxPacket>,
    stats: mpsc::Sender<GatewayStats>,
    tx_acks: mpsc::Sender<TxAck>,
}

impl Listener {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; constants::UDP_READ_BUFFER_SIZE];

        loop {
            let (len, src) = tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "udp read error");
                        continue;
                    }
                },
            };
            // handling awaits presence callbacks and bounded channels
            tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => break,
                _ = self.handle(&buf[..len], src) => {}
            }
        }

        debug!("gateway udp listener stopped");
    }

    async fn handle(&self, data: &[u8], src: SocketAddr) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(addr = %src, error = %e, "could not decode datagram");
                return;
            }
        };

        let kind = frame.kind();
        let (version, token) = (frame.version, frame.token);
        debug!(addr = %src, kind = ?kind, token, "received frame");

        match frame.payload {
            Payload::PushData { gateway, body } => {
                self.presence
                    .register(&self.registry, gateway, Sighting::push(src, version))
                    .await;
                self.reply(src, Frame::new(version, token, Payload::PushAck)).await;
                self.handle_push_data(gateway, body).await;
            }
            Payload::PullData { gateway } => {
                self.presence
                    .register(&self.registry, gateway, Sighting::pull(src, version))
                    .await;
                self.reply(src, Frame::new(version, token, Payload::PullAck)).await;
            }
            Payload::TxAck { gateway, body } => {
                self.presence
                    .register(&self.registry, gateway, Sighting::pull(src, version))
                    .await;
                self.handle_tx_ack(gateway, token, body).await;
            }
            Payload::PushAck | Payload::PullResp { .. } | Payload::PullAck => {
                warn!(addr = %src, kind = ?kind, "ignoring frame a gateway should not send");
            }
        }
    }

    async fn handle_push_data(&self, gateway: Eui64, body: PushDataPayload) {
        for rxpk in &body.rxpk {
            if rxpk.crc_status() == CrcStatus::Invalid && !self.skip_crc_check {
                debug!(gateway = %gateway, "dropping rx packet with invalid CRC");
                continue;
            }
            match rxpk.to_rx_packet(gateway) {
                Ok(packet) => {
                    if self.rx_packets.send(packet).await.is_err() {
                        debug!(gateway = %gateway, "rx packet dropped, channel closed");
                    }
                }
                Err(e) => warn!(gateway = %gateway, error = %e, "could not convert rxpk"),
            }
        }

        if let Some(stat) = body.stat {
            if self.stats.send(stat.to_gateway_stats(gateway)).await.is_err() {
                debug!(gateway = %gateway, "stats dropped, channel closed");
            }
        }
    }

    async fn handle_tx_ack(&self, gateway: Eui64, token: u16, body: Option<TxAckPayload>) {
        let code = body.as_ref().map_or("NONE", |b| b.error_code());
        let outcome = Outcome::from_code(code).unwrap_or_else(|| {
            warn!(gateway = %gateway, token, code, "unknown tx ack error code");
            Outcome::InternalError
        });

        if !self.registry.acknowledge(gateway, token) {
            debug!(gateway = %gateway, token, "tx ack does not match a pending downlink");
        }

        let ack = TxAck {
            mac: gateway,
            token,
            outcome,
        };
        if self.tx_acks.send(ack).await.is_err() {
            debug!(gateway = %gateway, token, "tx ack dropped, channel closed");
        }
    }

    async fn reply(&self, addr: SocketAddr, frame: Frame) {
        if let Err(e) = self.socket.send_to(&frame.encode(), addr).await {
            error!(addr = %addr, kind = ?frame.kind(), token = frame.token, error = %e, "could not send ack");
        }
    }
}

struct Sweeper {
    registry: Arc<GatewayRegistry>,
    presence: Arc<Presence>,
    timeout: Duration,
    interval: Duration,
}

impl Sweeper {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => break,
                _ = self.sweep() => {}
            }
        }
    }

    async fn sweep(&self) {
        let _gate = self.presence.gate.lock().await;
        for gateway in self.registry.sweep(Instant::now(), self.timeout) {
            info!(gateway = %gateway, "gateway timed out, removing");
            if let Err(e) = self.presence.handler.on_delete(gateway).await {
                error!(gateway = %gateway, error = %e, "handling removed gateway failed");
            }
        }
    }
}
