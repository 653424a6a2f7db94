//! mqttd - standalone MQTT broker
//!
//! Reads its settings from `MQTTD_*` environment variables and serves until
//! interrupted.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mqttd::config::parse_bool;
use mqttd::{BrokerConfig, Result, Server};

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if parse_bool("MQTTD_DEBUG", false) {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        error!("Fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = BrokerConfig::from_env()?;
    info!(
        "max QoS {}, queue capacity {}, max packet size {}",
        config.max_qos, config.queue_capacity, config.max_packet_size
    );

    let server = Server::bind(config).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    info!("mqttd stopped");
    Ok(())
}
