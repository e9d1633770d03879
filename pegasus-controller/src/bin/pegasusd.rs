//! `pegasusd`: the control-plane daemon. Loads `--config`, bootstraps the
//! forwarding tables, and serves UDP control traffic until signalled.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pegasus_controller::{Config, Controller, PegasusError};
use pegasus_switch::NullDriver;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pegasusd", about = "Pegasus control-plane daemon")]
struct Args {
    /// Path to the JSON config document (spec §6).
    #[arg(long)]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("pegasusd exiting: {err:#}");
            ExitCode::FAILURE
        }
    }
}

// Typed errors (`ConfigError`, `ControllerError`, ...) stay inside the
// library crates; `anyhow` only shows up here, at the process boundary,
// to attach the extra context a typed error doesn't carry (mirrors the
// teacher's `run(&mut self, options: Options) -> anyhow::Result<()>`).
async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config: Config =
        Config::load(&args.config).with_context(|| format!("loading config {}", args.config))?;
    let tick_interval = Duration::from_millis(config.tick_interval_ms);

    // No real switch-ASIC transport ships in this repository (spec §1's
    // non-goal); `NullDriver` is the only concrete `SwitchDriver`. A real
    // deployment swaps this for a transport built behind the `switch-rpc`
    // feature in `pegasus-switch`.
    let driver = NullDriver::new();
    let controller = Arc::new(Mutex::new(
        Controller::bootstrap(&config, driver).map_err(PegasusError::from)?,
    ));

    let socket = UdpSocket::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding udp socket at {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "pegasusd listening");

    let shutdown = CancellationToken::new();

    let ingress_handle = tokio::spawn(pegasus_controller::ingress::run(
        socket,
        controller.clone(),
        shutdown.clone(),
    ));
    let reconcile_handle = tokio::spawn(pegasus_controller::reconcile::run(
        tick_interval,
        controller.clone(),
        shutdown.clone(),
    ));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = ingress_handle.await;
    let _ = reconcile_handle.await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
