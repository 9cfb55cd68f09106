//! Shared protocol constants for the ItShare line protocol

// Maximum length of one control line (1MB) - anything longer is treated as a
// broken connection rather than buffered forever
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

// Payload pump chunk size (32KB)
pub const CHUNK_SIZE: usize = 32 * 1024;

// Separator inside the name|checksum|transferId argument
pub const TAG_SEPARATOR: char = '|';

// Separator between entries of a LOOK_RESPONSE listing
pub const LISTING_SEPARATOR: char = '\t';

// Keywords (case-sensitive)
pub mod keyword {
    pub const FILE_REQUEST: &str = "FILE_REQUEST";
    pub const FOLDER_REQUEST: &str = "FOLDER_REQUEST";
    pub const FILE_RESPONSE: &str = "FILE_RESPONSE";
    pub const FOLDER_RESPONSE: &str = "FOLDER_RESPONSE";
    pub const LOOK: &str = "LOOK";
    pub const LOOK_REQUEST: &str = "LOOK_REQUEST";
    pub const LOOK_RESPONSE: &str = "LOOK_RESPONSE";
    pub const DOWNLOAD_REQUEST: &str = "DOWNLOAD_REQUEST";
    pub const USERS: &str = "USERS";
    pub const USERS_BLOCK: &str = "USERS:";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const RECONNECT: &str = "RECONNECT";
    pub const EXIT: &str = "EXIT";
}

// Listing layout
pub mod listing {
    pub const FOLDERS_HEADER: &str = "=== FOLDERS ===";
    pub const FILES_HEADER: &str = "=== FILES ===";
    pub const EMPTY: &str = "Directory is empty";
}

// Centralized timeout constants
pub mod timeouts {
    // Bounded read used to detect a RECONNECT before prompting (ms)
    pub const RECONNECT_PROBE_MS: u64 = 2_000;

    // Bounded read for the USERS: roster block (ms)
    pub const ROSTER_READ_MS: u64 = 2_000;

    // Delay before a paused stream call returns (ms)
    pub const PAUSE_BACKOFF_MS: u64 = 500;

    // Server availability probe (ms)
    pub const CONNECT_PROBE_MS: u64 = 3_000;

    // Bound for chat, roster and PING writes (ms)
    pub const WRITE_MS: u64 = 5_000;

    // Heartbeat interval used when none is configured (s)
    pub const HEARTBEAT_SECS: u64 = 100;
}
