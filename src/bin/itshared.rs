use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::Duration;

use itshare::cli::ServerOpts;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = ServerOpts::parse();

    if opts.heartbeat_secs == 0 {
        anyhow::bail!("Error: --heartbeat-secs must be at least 1");
    }

    let bind = opts.bind_addr();
    println!("Starting ItShare server:");
    println!("  Bind: {}", bind);
    println!("  Heartbeat: every {}s", opts.heartbeat_secs);

    if bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: listening on all interfaces; traffic is not encrypted");
        eprintln!("   Only use on trusted networks (LAN)");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(itshare::server::serve(
        &bind,
        Duration::from_secs(opts.heartbeat_secs),
    ))
}
