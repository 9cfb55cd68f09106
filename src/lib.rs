//! ItShare library
//!
//! Chat, file and folder sharing between peers through a relay server over
//! a line-oriented TCP protocol.

pub mod archive;
pub mod checkpoint;
pub mod checksum;
pub mod cli;
pub mod client;
pub mod codec;
pub mod files;
pub mod heartbeat;
pub mod logger;
pub mod lookup;
pub mod paths;
pub mod progress;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod setup;
pub mod transfer;
