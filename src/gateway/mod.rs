pub mod backend;
pub mod packets;
pub mod registry;
pub mod structs;

pub use backend::{BackendConfig, BackendError, GatewayEvents, GatewayPresence, UdpBackend};
