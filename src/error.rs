use thiserror::Error;

use crate::{backend::mqtt::BridgeError, config::ConfigError, gateway::backend::BackendError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("gateway backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("mqtt backend error: {0}")]
    Bridge(#[from] BridgeError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
