//! Bridge between Semtech packet_forwarder gateways (UDP) and an MQTT broker.

pub mod backend;
pub mod config;
pub mod error;
pub mod eui;
pub mod gateway;
pub mod logger;
pub mod models;
pub mod service;
pub mod shutdown;

pub use error::{Error, Result};

pub mod constants {
    use std::time::Duration;

    pub const DEFAULT_UDP_BIND: &str = "0.0.0.0:1700";
    pub const DEFAULT_MQTT_SERVER: &str = "tcp://127.0.0.1:1883";
    pub const CONFIG_FILE_NAME: &str = "lora-gateway-bridge.toml";

    pub const GATEWAY_TIMEOUT: Duration = Duration::from_secs(60);
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
    pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

    pub const EVENT_CHANNEL_CAPACITY: usize = 100;
    pub const UDP_READ_BUFFER_SIZE: usize = 65_535;

    pub const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);
    pub const MQTT_RECONNECT_MIN: Duration = Duration::from_secs(1);
    pub const MQTT_RECONNECT_MAX: Duration = Duration::from_secs(60);
}
