// src/main.rs - Controller host entry point
use clap::Parser;
use krusty_ctrl::communication::serial::{self, DevicePort};
use krusty_ctrl::config::{self, Config};
use krusty_ctrl::ctrl::Ctrl;
use krusty_ctrl::hardware::i2c;
use krusty_ctrl::planner::ScriptedPlanner;
use krusty_ctrl::simulator::{EmulatedBus, Emulator};
use krusty_ctrl::web::{self, ctrl_channel::CtrlRequest};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

/// CNC controller host
#[derive(Parser, Debug)]
#[command(name = "krusty-ctrl", version, about = "Host control plane for a CNC motion controller.")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(default_value = "ctrl.toml")]
    config: PathBuf,

    /// Serial device, overriding the configuration
    #[arg(short, long)]
    port: Option<String>,

    /// Run against the built-in controller emulator instead of a serial device
    #[arg(long)]
    emulate: bool,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!("Starting krusty-ctrl {}", env!("CARGO_PKG_VERSION"));

    let config_path = cli.config.to_string_lossy().into_owned();
    let mut config = if cli.config.exists() {
        tracing::info!("Loading configuration from: {}", config_path);
        config::load_config(&config_path).map_err(|e| {
            tracing::error!("Failed to load config from '{}': {}", config_path, e);
            Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
        })?
    } else {
        tracing::warn!("No configuration at '{}', using defaults", config_path);
        Config::default()
    };
    if let Some(port) = cli.port {
        config.serial.port = port;
    }

    // Create a LocalSet for !Send tasks.
    let local = LocalSet::new();

    let (port, bus): (Option<DevicePort>, _) = if cli.emulate {
        let (host, device) = tokio::io::duplex(4096);
        let (bus, i2c_rx) = EmulatedBus::new(config.i2c.avr_address, config.i2c.power_address);
        local.spawn_local(async move {
            if let Err(e) = Emulator::new().run(device, i2c_rx).await {
                tracing::error!("Emulator failed: {}", e);
            }
        });
        tracing::info!("Using controller emulator");
        let port: DevicePort = Box::new(host);
        (Some(port), Some(i2c::shared(bus)))
    } else {
        tracing::info!("Controller: {} @ {} baud", config.serial.port, config.serial.baud);
        let bus = if config.i2c.enabled {
            i2c::open_or_degraded(&config.i2c.device)
        } else {
            None
        };
        (serial::open_or_degraded(&config.serial), bus)
    };

    let web_config = config.web.clone();
    let ctrl = Ctrl::new(config, Box::new(ScriptedPlanner::new()), bus)?;

    // Set up a channel for communication between Axum handlers and the controller task.
    let (ctrl_tx, ctrl_rx) = mpsc::channel::<CtrlRequest>(16);

    if web_config.enabled {
        let app = web::api::create_router(ctrl_tx.clone());
        let listener = tokio::net::TcpListener::bind(web_config.bind.as_str()).await?;
        tracing::info!("Web API listening on http://{}", listener.local_addr()?);
        local.spawn_local(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Web server failed: {}", e);
            }
        });
    }

    local
        .run_until(async move {
            tokio::select! {
                result = ctrl.run(port, ctrl_rx) => result,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                    Ok(())
                }
            }
        })
        .await?;

    drop(ctrl_tx);
    Ok(())
}
