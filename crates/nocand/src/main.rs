// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NoCAN daemon entry point.
//!
//! # Usage
//!
//! ```bash
//! # Launch the network manager and event server
//! nocand server --bind 0.0.0.0:4242 --auth-token secret
//!
//! # Toggle bus power without running the daemon
//! nocand power-on
//! nocand power-off
//!
//! # Report build information
//! nocand version
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nocand::config::Config;
use nocand::controller::NetworkController;
use nocand::driver::{CanLink, PiMaster};
use nocand::registry::NodeIdCache;
use nocand::server::EventServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// NoCAN network manager and event server
#[derive(Parser, Debug)]
#[command(name = "nocand")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON format)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch the NoCAN network manager and event server
    Server(ServerOpts),
    /// Power on the NoCAN bus and exit
    PowerOn(BusOpts),
    /// Power off the NoCAN bus and exit
    PowerOff(BusOpts),
    /// Display the version
    Version,
}

#[derive(Args, Debug, Clone)]
struct BusOpts {
    /// Reset the driver at startup
    #[arg(long)]
    driver_reset: Option<bool>,

    /// SPI communication speed in bits per second (use with caution)
    #[arg(long)]
    spi_speed: Option<u32>,

    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Current limit level (0 = don't change)
    #[arg(long)]
    current_limit: Option<u16>,

    /// Enable the CAN bus 120 ohm termination resistor
    #[arg(long)]
    can_termination: Option<bool>,
}

#[derive(Args, Debug, Clone)]
struct ServerOpts {
    #[command(flatten)]
    bus: BusOpts,

    /// Address to bind the event server to
    #[arg(short, long)]
    bind: Option<String>,

    /// Authentication token shared with clients
    #[arg(short, long)]
    auth_token: Option<String>,

    /// Bus power monitoring interval in seconds (0 disables)
    #[arg(long)]
    power_monitoring_interval: Option<u64>,

    /// Node ping interval in milliseconds (0 disables)
    #[arg(long)]
    ping_interval: Option<u64>,

    /// Node cache file name; empty disables node caching
    #[arg(long)]
    node_cache: Option<String>,
}

impl BusOpts {
    fn apply(&self, config: &mut Config) {
        if let Some(value) = self.driver_reset {
            config.driver_reset = value;
        }
        if let Some(value) = self.spi_speed {
            config.spi_speed = value;
        }
        if let Some(value) = &self.log_level {
            config.log_level = value.clone();
        }
        if let Some(value) = self.current_limit {
            config.current_limit = value;
        }
        if let Some(value) = self.can_termination {
            config.can_termination = value;
        }
    }
}

impl ServerOpts {
    fn apply(&self, config: &mut Config) {
        self.bus.apply(config);
        if let Some(value) = &self.bind {
            config.bind = value.clone();
        }
        if let Some(value) = &self.auth_token {
            config.auth_token = value.clone();
        }
        if let Some(value) = self.power_monitoring_interval {
            config.power_monitoring_interval_secs = value;
        }
        if let Some(value) = self.ping_interval {
            config.ping_interval_ms = value;
        }
        if let Some(value) = &self.node_cache {
            config.node_cache_file = value.clone();
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let config = Config::from_file(path)
                .with_context(|| format!("could not load configuration file {:?}", path))?;
            info!("Loaded configuration from {:?}", path);
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let level = match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn open_driver(config: &Config) -> Result<Arc<PiMaster>> {
    #[cfg(feature = "rpi")]
    {
        let port = nocand::driver::rpi::RpiPort::open(config.spi_speed)
            .context("could not open the SPI device")?;
        info!(
            "Connected to driver using SPI interface at {} bps",
            config.spi_speed
        );
        Ok(Arc::new(PiMaster::new(Box::new(port))))
    }
    #[cfg(not(feature = "rpi"))]
    {
        let _ = config;
        Err(anyhow::anyhow!(
            "this build has no PiMaster port (compile with the 'rpi' feature)"
        ))
    }
}

fn init_pimaster(controller: &NetworkController, config: &Config) -> Result<()> {
    controller
        .initialize(config.driver_reset, config.current_limit, config.can_termination)
        .context("failed to connect to PiMaster")?;
    info!("Successfully connected to PiMaster");
    Ok(())
}

async fn server_cmd(config: Config) -> Result<()> {
    let cache = match config.node_cache_path() {
        Some(path) => NodeIdCache::new(path),
        None => NodeIdCache::disabled(),
    };
    if let Err(e) = cache.load() {
        warn!("Could not read node cache: {}", e);
    }

    let driver = open_driver(&config)?;
    let link = CanLink::start(driver.clone());

    let server = EventServer::new(&config.auth_token);
    let controller = NetworkController::new(driver, server.clone(), cache.clone(), link.tx.clone());
    controller.properties_mut(|props| {
        props.add_string(
            "nocand_full_version",
            &format!(
                "{}-{}-{}",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
        );
        let started_at = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        props.add_uint32("started_at", started_at as u32);
    });

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to launch server on {}", config.bind))?;
    {
        let server = server.clone();
        let controller = controller.clone();
        tokio::spawn(async move {
            server.serve(listener, controller).await;
        });
    }

    init_pimaster(&controller, &config)?;
    controller.set_power(true).await;
    controller.run_power_monitor(config.power_monitoring_interval());
    controller.run_pinger(config.ping_interval());

    let serve_controller = controller.clone();
    let serve = tokio::spawn(async move {
        serve_controller.serve(link.rx).await;
    });

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received, stopping daemon");
    if let Err(e) = cache.save() {
        warn!("Could not write node cache: {}", e);
    }
    serve.abort();
    Ok(())
}

fn power_cmd(config: Config, on: bool) -> Result<()> {
    let driver = open_driver(&config)?;
    driver
        .initialize(config.driver_reset)
        .context("failed to connect to PiMaster")?;
    info!("Successfully connected to PiMaster");

    if config.current_limit > 0 {
        driver.set_current_limit(config.current_limit)?;
    }
    driver.set_can_termination(config.can_termination)?;
    driver.set_power(on)?;
    info!("Bus power is now {}", if on { "on" } else { "off" });
    Ok(())
}

fn version_cmd() {
    println!(
        "nocand version {}-{}-{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Server(opts) => {
            opts.apply(&mut config);
            config.validate()?;
            init_logging(&config.log_level)?;
            info!("nocand version {}", env!("CARGO_PKG_VERSION"));
            server_cmd(config).await
        }
        Command::PowerOn(opts) => {
            opts.apply(&mut config);
            config.validate()?;
            init_logging(&config.log_level)?;
            power_cmd(config, true)
        }
        Command::PowerOff(opts) => {
            opts.apply(&mut config);
            config.validate()?;
            init_logging(&config.log_level)?;
            power_cmd(config, false)
        }
        Command::Version => {
            version_cmd();
            Ok(())
        }
    }
}
