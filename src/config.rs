//! Bridge configuration.
//!
//! Values come from built-in defaults, then a TOML file, then environment
//! variables and command-line flags.

use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{backend::MqttConfig, constants, gateway::BackendConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub backend: BackendSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub udp_bind: String,
    /// 0 = panic, 1 = fatal, 2 = error, 3 = warning, 4 = info, 5 = debug.
    pub log_level: u8,
    pub skip_crc_check: bool,
    pub gateway_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            udp_bind: constants::DEFAULT_UDP_BIND.to_string(),
            log_level: 4,
            skip_crc_check: false,
            gateway_timeout_secs: constants::GATEWAY_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub mqtt: MqttSection,
}

/// Empty strings mean "not set".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub server: String,
    pub username: String,
    pub password: String,
    pub ca_cert: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub qos: u8,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            server: constants::DEFAULT_MQTT_SERVER.to_string(),
            username: String::new(),
            password: String::new(),
            ca_cert: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
            qos: 0,
        }
    }
}

/// Values given through the environment or on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub udp_bind: Option<String>,
    pub log_level: Option<u8>,
    pub skip_crc_check: Option<bool>,
    pub mqtt_server: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_ca_cert: Option<String>,
    pub mqtt_tls_cert: Option<String>,
    pub mqtt_tls_key: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

fn optional_path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Places searched for `lora-gateway-bridge.toml` when no file is given.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut dirs = vec![PathBuf::from("/etc/lora-gateway-bridge")];
        if let Some(home) = env::var_os("HOME") {
            dirs.push(PathBuf::from(home).join(".config").join("lora-gateway-bridge"));
        }
        dirs.push(PathBuf::from("."));
        dirs.into_iter().map(|dir| dir.join(constants::CONFIG_FILE_NAME)).collect()
    }

    /// Loads `explicit` if given, otherwise the first file found in
    /// `candidates`. Returns the defaults and `None` when nothing was found.
    pub fn load(explicit: Option<&Path>, candidates: &[PathBuf]) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }
        match candidates.iter().find(|path| path.is_file()) {
            Some(path) => Ok((Self::from_file(path)?, Some(path.clone()))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(udp_bind) = non_empty(overrides.udp_bind.as_ref()) {
            self.general.udp_bind = udp_bind;
        }
        if let Some(log_level) = overrides.log_level {
            self.general.log_level = log_level;
        }
        if let Some(skip_crc_check) = overrides.skip_crc_check {
            self.general.skip_crc_check = skip_crc_check;
        }

        let mqtt = &mut self.backend.mqtt;
        let fields = [
            (&overrides.mqtt_server, &mut mqtt.server),
            (&overrides.mqtt_username, &mut mqtt.username),
            (&overrides.mqtt_password, &mut mqtt.password),
            (&overrides.mqtt_ca_cert, &mut mqtt.ca_cert),
            (&overrides.mqtt_tls_cert, &mut mqtt.tls_cert),
            (&overrides.mqtt_tls_key, &mut mqtt.tls_key),
        ];
        for (value, field) in fields {
            if let Some(value) = non_empty(value.as_ref()) {
                *field = value;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.udp_bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "udp_bind {:?} is not a socket address",
                self.general.udp_bind
            )));
        }
        if self.general.log_level > 5 {
            return Err(ConfigError::Invalid(format!(
                "log_level {} is out of range 0..=5",
                self.general.log_level
            )));
        }
        if self.general.gateway_timeout_secs == 0 {
            return Err(ConfigError::Invalid("gateway_timeout_secs must be positive".into()));
        }

        let mqtt = &self.backend.mqtt;
        if mqtt.server.is_empty() {
            return Err(ConfigError::Invalid("backend.mqtt.server is empty".into()));
        }
        if mqtt.qos > 2 {
            return Err(ConfigError::Invalid(format!("qos {} is out of range 0..=2", mqtt.qos)));
        }
        if mqtt.tls_cert.is_empty() != mqtt.tls_key.is_empty() {
            return Err(ConfigError::Invalid(
                "tls_cert and tls_key must be given together".into(),
            ));
        }
        Ok(())
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            bind: self.general.udp_bind.clone(),
            skip_crc_check: self.general.skip_crc_check,
            gateway_timeout: Duration::from_secs(self.general.gateway_timeout_secs),
            ..Default::default()
        }
    }

    pub fn mqtt_config(&self) -> MqttConfig {
        let mqtt = &self.backend.mqtt;
        MqttConfig {
            server: mqtt.server.clone(),
            username: non_empty(Some(&mqtt.username)),
            password: non_empty(Some(&mqtt.password)),
            ca_cert: optional_path(&mqtt.ca_cert),
            tls_cert: optional_path(&mqtt.tls_cert),
            tls_key: optional_path(&mqtt.tls_key),
            qos: i32::from(mqtt.qos),
            ..Default::default()
        }
    }

    /// The configuration as a commented TOML file.
    pub fn render_template(&self) -> String {
        let general = &self.general;
        let mqtt = &self.backend.mqtt;
        format!(
            r#"[general]
# UDP address the packet forwarders send to.
udp_bind = {udp_bind:?}

# debug=5, info=4, warning=3, error=2, fatal=1, panic=0
log_level = {log_level}

# Forward frames with a failed CRC as well.
skip_crc_check = {skip_crc_check}

# Seconds without traffic after which a gateway is forgotten.
gateway_timeout_secs = {gateway_timeout_secs}


[backend.mqtt]
# MQTT broker, e.g. tcp://127.0.0.1:1883 or ssl://broker:8883
server = {server:?}

# Leave empty when the broker needs no credentials.
username = {username:?}
password = {password:?}

# PEM files for TLS. Leave empty to disable.
ca_cert = {ca_cert:?}
tls_cert = {tls_cert:?}
tls_key = {tls_key:?}

# 0 = at most once, 1 = at least once, 2 = exactly once
qos = {qos}
"#,
            udp_bind = general.udp_bind,
            log_level = general.log_level,
            skip_crc_check = general.skip_crc_check,
            gateway_timeout_secs = general.gateway_timeout_secs,
            server = mqtt.server,
            username = mqtt.username,
            password = mqtt.password,
            ca_cert = mqtt.ca_cert,
            tls_cert = mqtt.tls_cert,
            tls_key = mqtt.tls_key,
            qos = mqtt.qos,
        )
    }
}
