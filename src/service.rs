//! Wires the gateway UDP backend to the MQTT backend and keeps both running
//! until shutdown.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{BridgeError, MqttBackend, MqttConfig},
    config::Config,
    constants,
    eui::Eui64,
    gateway::{BackendConfig, BackendError, GatewayEvents, GatewayPresence, UdpBackend},
    models::{GatewayStats, RxPacket, TxAck, TxPacket},
    shutdown, Result,
};

/// Fixed-interval retry schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    interval: Duration,
    attempt: u32,
    next_retry: Option<Instant>,
}

impl Backoff {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            attempt: 0,
            next_retry: None,
        }
    }

    /// Records a failed attempt at `now` and returns when to try again.
    pub fn failed(&mut self, now: Instant) -> Instant {
        self.attempt += 1;
        let at = now + self.interval;
        self.next_retry = Some(at);
        at
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.next_retry.map_or(true, |at| now >= at)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_retry(&self) -> Option<Instant> {
        self.next_retry
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Running,
    Draining,
    Stopped,
}

pub struct Service {
    backend: BackendConfig,
    mqtt: MqttConfig,
    retry_interval: Duration,
    state: watch::Sender<State>,
}

struct BridgePresence(Arc<MqttBackend>);

#[async_trait]
impl GatewayPresence for BridgePresence {
    async fn on_add(&self, gateway: Eui64) -> Result<()> {
        self.0.subscribe_gateway(gateway).await?;
        Ok(())
    }

    async fn on_delete(&self, gateway: Eui64) -> Result<()> {
        self.0.unsubscribe_gateway(gateway).await?;
        Ok(())
    }
}

impl Service {
    pub fn new(backend: BackendConfig, mqtt: MqttConfig) -> Self {
        let (state, _) = watch::channel(State::Connecting);
        Self {
            backend,
            mqtt,
            retry_interval: constants::CONNECT_RETRY_INTERVAL,
            state,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.backend_config(), config.mqtt_config())
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    fn transition(&self, state: State) {
        info!(state = ?state, "service state changed");
        self.state.send_replace(state);
    }

    /// Runs against the configured MQTT broker until `shutdown` fires.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mqtt = self.mqtt.clone();
        self.run_with(move || {
            let mqtt = mqtt.clone();
            async move { MqttBackend::connect(&mqtt).await }
        }, shutdown)
        .await
    }

    /// Like [`Service::run`] with a custom way of reaching the MQTT side.
    pub async fn run_with<F, Fut>(self, mut connect: F, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(MqttBackend, mpsc::Receiver<TxPacket>), BridgeError>>,
    {
        self.transition(State::Connecting);
        let Some((bridge, tx_packets)) = self.connect(&mut connect, &mut shutdown).await else {
            self.transition(State::Stopped);
            return Ok(());
        };
        let bridge = Arc::new(bridge);

        let presence = Arc::new(BridgePresence(Arc::clone(&bridge)));
        let (backend, events) = match UdpBackend::open(&self.backend, presence).await {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(e) = bridge.close().await {
                    warn!(error = %e, "closing mqtt backend failed");
                }
                self.transition(State::Stopped);
                return Err(e.into());
            }
        };

        self.transition(State::Running);
        self.drive(bridge, Arc::new(backend), events, tx_packets, shutdown).await;
        self.transition(State::Stopped);
        Ok(())
    }

    async fn connect<F, Fut>(
        &self,
        connect: &mut F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<(MqttBackend, mpsc::Receiver<TxPacket>)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(MqttBackend, mpsc::Receiver<TxPacket>), BridgeError>>,
    {
        let mut backoff = Backoff::new(self.retry_interval);
        loop {
            let attempt = tokio::select! {
                _ = shutdown::signalled(shutdown) => return None,
                attempt = connect() => attempt,
            };
            match attempt {
                Ok(connected) => return Some(connected),
                Err(e) => {
                    let retry_at = backoff.failed(Instant::now());
                    warn!(attempt = backoff.attempt(), retry_in = ?self.retry_interval, error = %e, "could not connect to mqtt broker");
                    tokio::select! {
                        _ = shutdown::signalled(shutdown) => return None,
                        _ = time::sleep_until(retry_at) => {}
                    }
                }
            }
        }
    }

    async fn drive(
        &self,
        bridge: Arc<MqttBackend>,
        backend: Arc<UdpBackend>,
        events: GatewayEvents,
        tx_packets: mpsc::Receiver<TxPacket>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let GatewayEvents {
            rx_packets,
            stats,
            tx_acks,
        } = events;

        let loops = vec![
            tokio::spawn(forward("rx", rx_packets, shutdown.clone(), {
                let bridge = Arc::clone(&bridge);
                move |packet: RxPacket| {
                    let bridge = Arc::clone(&bridge);
                    async move {
                        if let Err(e) = bridge.publish_rx(&packet).await {
                            error!(gateway = %packet.rx_info.mac, error = %e, "could not publish rx packet");
                        }
                    }
                }
            })),
            tokio::spawn(forward("stats", stats, shutdown.clone(), {
                let bridge = Arc::clone(&bridge);
                move |stats: GatewayStats| {
                    let bridge = Arc::clone(&bridge);
                    async move {
                        if let Err(e) = bridge.publish_stats(&stats).await {
                            error!(gateway = %stats.mac, error = %e, "could not publish stats");
                        }
                    }
                }
            })),
            tokio::spawn(forward("ack", tx_acks, shutdown.clone(), {
                let bridge = Arc::clone(&bridge);
                move |ack: TxAck| {
                    let bridge = Arc::clone(&bridge);
                    async move {
                        if let Err(e) = bridge.publish_tx_ack(&ack).await {
                            error!(gateway = %ack.mac, token = ack.token, error = %e, "could not publish tx ack");
                        }
                    }
                }
            })),
            tokio::spawn(forward("tx", tx_packets, shutdown.clone(), {
                let backend = Arc::clone(&backend);
                move |packet: TxPacket| {
                    let backend = Arc::clone(&backend);
                    async move {
                        let gateway = packet.tx_info.mac;
                        match backend.send(&packet).await {
                            Ok(token) => debug!(gateway = %gateway, token, "downlink sent"),
                            Err(BackendError::UnknownGateway(_)) => {
                                warn!(gateway = %gateway, "dropping downlink for unknown gateway");
                            }
                            Err(e) => error!(gateway = %gateway, error = %e, "could not send downlink"),
                        }
                    }
                }
            })),
        ];

        shutdown::signalled(&mut shutdown).await;
        self.transition(State::Draining);

        backend.close().await;
        if let Err(e) = bridge.close().await {
            warn!(error = %e, "closing mqtt backend failed");
        }
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "forwarding task failed");
            }
        }
    }
}

async fn forward<T, F, Fut>(stream: &'static str, mut source: mpsc::Receiver<T>, mut shutdown: watch::Receiver<bool>, mut sink: F)
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let item = tokio::select! {
            _ = shutdown::signalled(&mut shutdown) => break,
            item = source.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        sink(item).await;
    }
    debug!(stream, "forwarding loop stopped");
}
