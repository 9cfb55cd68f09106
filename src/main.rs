//! ItShare client
//!
//! Connects to a relay server, registers (or is recognised on reconnect) and
//! then runs the chat and transfer command loop.

use anyhow::{Context, Result};
use clap::Parser;

use itshare::cli::ClientOpts;

fn main() -> Result<()> {
    env_logger::init();
    let opts = ClientOpts::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let result = rt.block_on(itshare::client::run(opts));
    // Stdin reads sit on a blocking thread; do not wait for them on exit
    rt.shutdown_background();
    result
}
