pub mod mqtt;
pub mod topics;
pub mod transport;

pub use mqtt::{BridgeError, MqttBackend};
pub use transport::{Inbound, MemoryTransport, MqttConfig, PahoTransport, Transport, TransportError};
