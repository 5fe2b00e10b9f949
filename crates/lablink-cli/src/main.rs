//! LabLink coordinator binary.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lablink_api::serve;
use lablink_coordinator::{Coordinator, MqttTransport, PassthroughHandler};
use lablink_core::CoordinatorConfig;

/// Actions the stock NDI passthrough capability forwards to devices.
const NDI_ACTIONS: [&str; 5] = ["start", "stop", "set_input", "record_start", "record_stop"];

#[derive(Parser)]
#[command(name = "lablink", version, about = "Device fleet coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator and its HTTP API.
    Serve {
        /// MQTT broker host.
        #[arg(long, env = "MQTT_HOST")]
        mqtt_host: Option<String>,

        /// MQTT broker port.
        #[arg(long, env = "MQTT_PORT")]
        mqtt_port: Option<u16>,

        /// Topic namespace root.
        #[arg(long, env = "LABLINK_ROOT")]
        root: Option<String>,

        /// HTTP API bind address.
        #[arg(long, env = "LABLINK_API_ADDR")]
        api_addr: Option<String>,

        /// Extra passthrough capabilities to register, on top of `ndi`.
        #[arg(long = "passthrough")]
        passthrough: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            mqtt_host,
            mqtt_port,
            root,
            api_addr,
            passthrough,
        } => {
            let mut config = CoordinatorConfig::from_env().context("loading configuration")?;
            if let Some(host) = mqtt_host {
                config.mqtt.host = host;
            }
            if let Some(port) = mqtt_port {
                config.mqtt.port = port;
            }
            if let Some(root) = root {
                config.root = root;
            }
            if let Some(addr) = api_addr {
                config.api_addr = addr;
            }
            run(config, passthrough).await
        }
    }
}

async fn run(config: CoordinatorConfig, passthrough: Vec<String>) -> anyhow::Result<()> {
    info!(
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        root = %config.root,
        "starting lablink coordinator v{}",
        lablink_core::VERSION
    );

    let transport =
        Arc::new(MqttTransport::connect(&config.mqtt).context("connecting to broker")?);
    let coordinator = Coordinator::new(config.clone(), transport);

    coordinator
        .register_capability("ndi", Arc::new(PassthroughHandler::new(NDI_ACTIONS)))
        .await;
    for capability in passthrough {
        coordinator
            .register_capability(&capability, Arc::new(PassthroughHandler::new(NDI_ACTIONS)))
            .await;
    }

    coordinator.start().await.context("starting coordinator")?;

    let api = coordinator.clone();
    let api_addr = config.api_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(api, &api_addr).await {
            tracing::error!(error = %e, "api server exited");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    Ok(())
}
