//! Shared CLI option structs for the client and server binaries

use clap::Parser;
use std::path::PathBuf;

use crate::protocol::timeouts::HEARTBEAT_SECS;

/// Relay server options
#[derive(Clone, Debug, Parser)]
#[command(name = "itshared", version, about = "ItShare relay server")]
pub struct ServerOpts {
    /// Port to listen on
    #[arg(long, default_value = "8080")]
    pub port: String,

    /// Seconds between liveness probes
    #[arg(long, default_value_t = HEARTBEAT_SECS)]
    pub heartbeat_secs: u64,
}

impl ServerOpts {
    /// `0.0.0.0:<port>`; a leading ':' in the port is tolerated
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port.trim_start_matches(':'))
    }
}

/// Client options
#[derive(Clone, Debug, Parser)]
#[command(name = "itshare", version, about = "ItShare client: chat, share files and folders")]
pub struct ClientOpts {
    /// Server address (host:port); prompted for when omitted
    #[arg(long)]
    pub server: Option<String>,

    /// Append transfer events to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}
