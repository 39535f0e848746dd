//! Host binary: build a stack from a TOML config and run until shutdown.

mod builder;
mod config;
mod error;
mod ip;
mod logging;

use std::path::PathBuf;

use clap::Parser;

use crate::config::HostConfig;
use crate::error::HostError;

#[derive(Debug, Parser)]
#[command(name = "netstack-host", about = "Run a userspace network stack")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short, default_value = "netstack.toml")]
    config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.json {
        logging::init_json();
    } else {
        logging::init();
    }

    if let Err(e) = run(&args).await {
        tracing::error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(args: &Args) -> Result<(), HostError> {
    let config = HostConfig::load(&args.config)?;
    let built = builder::build(&config)?;

    for (id, info) in built.stack.nic_info() {
        tracing::info!(
            nic = id.0,
            name = %info.name,
            mtu = info.mtu,
            running = info.flags.running,
            addresses = info.protocol_addresses.len(),
            "interface ready"
        );
    }
    tracing::info!(
        routes = built.stack.get_route_table().len(),
        seed = built.stack.seed(),
        "stack running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    built.stack.destroy();
    Ok(())
}
