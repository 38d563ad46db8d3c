//! lora-gateway-bridge
//!
//! ```bash
//! # run with the first lora-gateway-bridge.toml found
//! lora-gateway-bridge
//!
//! # explicit file, overriding the broker
//! MQTT_SERVER=ssl://broker:8883 lora-gateway-bridge --config bridge.toml
//!
//! # print the resolved configuration
//! lora-gateway-bridge config > lora-gateway-bridge.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use lora_gateway_bridge::{
    config::{Config, Overrides},
    logger,
    service::Service,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Forwards Semtech packet_forwarder traffic to an MQTT broker and back.
#[derive(Parser, Debug)]
#[command(name = "lora-gateway-bridge")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP address to listen on for gateways
    #[arg(long, env = "UDP_BIND")]
    udp_bind: Option<String>,

    /// debug=5, info=4, warning=3, error=2, fatal=1, panic=0
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<u8>,

    /// Forward frames with a failed CRC
    #[arg(long, env = "SKIP_CRC_CHECK")]
    skip_crc_check: Option<bool>,

    /// MQTT broker URI
    #[arg(long, env = "MQTT_SERVER")]
    mqtt_server: Option<String>,

    /// MQTT username
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    /// CA certificate (PEM)
    #[arg(long, env = "MQTT_CA_CERT")]
    mqtt_ca_cert: Option<String>,

    /// Client certificate (PEM)
    #[arg(long, env = "MQTT_TLS_CERT")]
    mqtt_tls_cert: Option<String>,

    /// Client key (PEM)
    #[arg(long, env = "MQTT_TLS_KEY")]
    mqtt_tls_key: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the version
    Version,

    /// Print the resolved configuration as a TOML file
    Config,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            udp_bind: self.udp_bind.clone(),
            log_level: self.log_level,
            skip_crc_check: self.skip_crc_check,
            mqtt_server: self.mqtt_server.clone(),
            mqtt_username: self.mqtt_username.clone(),
            mqtt_password: self.mqtt_password.clone(),
            mqtt_ca_cert: self.mqtt_ca_cert.clone(),
            mqtt_tls_cert: self.mqtt_tls_cert.clone(),
            mqtt_tls_key: self.mqtt_tls_key.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(Commands::Version) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let (mut config, source) = Config::load(args.config.as_deref(), &Config::search_paths())?;
    config.apply(&args.overrides());
    config.validate()?;

    if let Some(Commands::Config) = args.command {
        print!("{}", config.render_template());
        return Ok(());
    }

    logger::init(config.general.log_level);
    match source {
        Some(path) => info!(path = %path.display(), "loaded configuration file"),
        None => warn!("no configuration file found, using defaults and environment"),
    }
    info!(version = env!("CARGO_PKG_VERSION"), "starting lora-gateway-bridge");

    let (shutdown_tx, shutdown) = watch::channel(false);
    ctrlc::set_handler(move || {
        shutdown_tx.send_replace(true);
    })?;

    if let Err(e) = Service::from_config(&config).run(shutdown).await {
        error!(error = %e, "bridge stopped");
        return Err(e.into());
    }
    info!("bridge stopped");
    Ok(())
}
