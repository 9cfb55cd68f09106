//! Client startup: address, connection, identity, reconnect detection
//!
//! Startup is a small state machine. A `RECONNECT` seen before an identity
//! prompt jumps straight to `Ready`.

use anyhow::{Context, Result};
use log::{debug, info};
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, Duration};

use crate::codec::{read_line_timed, shared_writer, write_all_timed, Frame, SharedWriter};
use crate::protocol::timeouts::{CONNECT_PROBE_MS, WRITE_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupState {
    AwaitAddress,
    Connecting(String),
    AwaitIdentity,
    AwaitSharedPath,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupEvent {
    Address(String),
    Connected,
    /// Connecting failed and the user asked to retry.
    Retry,
    Reconnected,
    Identity,
    SharedPath,
}

/// Next state, or `None` if `event` makes no sense in `state`.
pub fn advance(state: &SetupState, event: &SetupEvent) -> Option<SetupState> {
    use SetupEvent as E;
    use SetupState as S;
    match (state, event) {
        (S::AwaitAddress, E::Address(addr)) => Some(S::Connecting(addr.clone())),
        (S::Connecting(_), E::Connected) => Some(S::AwaitIdentity),
        (S::Connecting(_), E::Retry) => Some(S::AwaitAddress),
        (S::AwaitIdentity, E::Reconnected) | (S::AwaitSharedPath, E::Reconnected) => Some(S::Ready),
        (S::AwaitIdentity, E::Identity) => Some(S::AwaitSharedPath),
        (S::AwaitSharedPath, E::SharedPath) => Some(S::Ready),
        _ => None,
    }
}

/// Why the server could not be reached.
#[derive(Debug, Error)]
pub enum Unreachable {
    #[error("Connection refused - no server running at this address")]
    Refused,
    #[error("Host not found - check if the hostname is correct")]
    UnknownHost,
    #[error("Connection timed out - server might be behind a firewall")]
    TimedOut,
    #[error("{0}")]
    Other(String),
}

pub fn classify(err: &io::Error) -> Unreachable {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => Unreachable::Refused,
        io::ErrorKind::TimedOut => Unreachable::TimedOut,
        _ => Unreachable::Other(err.to_string()),
    }
}

/// Dial `addr` with a bounded timeout. The returned stream is the session
/// connection; it is not closed and re-dialed.
pub async fn check_server_availability(addr: &str) -> Result<TcpStream, Unreachable> {
    let targets: Vec<_> = match lookup_host(addr).await {
        Ok(it) => it.collect(),
        Err(e) => {
            debug!("resolve {}: {}", addr, e);
            return Err(Unreachable::UnknownHost);
        }
    };
    let target = targets.first().copied().ok_or(Unreachable::UnknownHost)?;
    match timeout(Duration::from_millis(CONNECT_PROBE_MS), TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(classify(&e)),
        Err(_) => Err(Unreachable::TimedOut),
    }
}

/// Wait briefly for a `RECONNECT <username> <token>` line. Returns the
/// username if one arrived; anything else means "prompt as usual".
pub async fn probe_reconnect(reader: &mut BufReader<OwnedReadHalf>, ms: u64) -> Option<String> {
    match read_line_timed(reader, ms).await {
        Ok(Some(line)) => match Frame::parse(&line) {
            Ok(Frame::Reconnect { username, .. }) => Some(username),
            other => {
                debug!("no reconnect signal: {:?}", other);
                None
            }
        },
        _ => None,
    }
}

/// Line-oriented questions on the user's input.
pub struct Prompter<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> Prompter<R> {
    pub fn new(input: R) -> Self {
        Self {
            lines: BufReader::new(input).lines(),
        }
    }

    /// Print `prompt` and return the next trimmed line.
    pub async fn ask(&mut self, prompt: &str) -> Result<String> {
        println!("{}", prompt);
        match self.lines.next_line().await? {
            Some(line) => Ok(line.trim().to_string()),
            None => anyhow::bail!("input closed"),
        }
    }

    pub async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.lines.next_line().await?)
    }
}

/// A connection that finished setup.
pub struct Established {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: SharedWriter,
    /// Only known when the user typed it; a reconnected client learns it
    /// from the server later.
    pub shared_root: Option<PathBuf>,
    pub reconnected: bool,
}

async fn send_identity(writer: &SharedWriter, value: &str, what: &str) -> Result<()> {
    let mut w = writer.lock().await;
    write_all_timed(&mut **w, format!("{}\n", value).as_bytes(), WRITE_MS)
        .await
        .with_context(|| format!("error in write {}", what))
}

/// Drive setup until `Ready`. Only a failed identity write, closed input or
/// an abort after a failed connection returns an error.
pub async fn establish<R>(
    prompter: &mut Prompter<R>,
    preset_address: Option<String>,
    probe_ms: u64,
) -> Result<Established>
where
    R: AsyncRead + Unpin,
{
    let mut preset = preset_address;
    let mut state = SetupState::AwaitAddress;
    let mut conn: Option<(BufReader<OwnedReadHalf>, SharedWriter)> = None;
    let mut shared_root = None;
    let mut reconnected = false;

    loop {
        let event = match &state {
            SetupState::AwaitAddress => {
                let addr = match preset.take() {
                    Some(a) => a,
                    None => prompter.ask("Enter server address (host:port):").await?,
                };
                if !addr.contains(':') {
                    println!("Address must look like host:port");
                    continue;
                }
                SetupEvent::Address(addr)
            }
            SetupState::Connecting(addr) => match check_server_availability(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    info!("connected to {}", addr);
                    let (rd, wr) = stream.into_split();
                    conn = Some((BufReader::new(rd), shared_writer(wr)));
                    SetupEvent::Connected
                }
                Err(why) => {
                    eprintln!("{}", why);
                    let answer = prompter.ask("Retry with another address? (y/n)").await?;
                    if !matches!(answer.to_lowercase().as_str(), "y" | "yes") {
                        anyhow::bail!("cannot reach {}: {}", addr, why);
                    }
                    SetupEvent::Retry
                }
            },
            SetupState::AwaitIdentity | SetupState::AwaitSharedPath => {
                let (reader, writer) = conn
                    .as_mut()
                    .context("no connection")?;
                if let Some(username) = probe_reconnect(reader, probe_ms).await {
                    println!("Welcome back {}!", username);
                    reconnected = true;
                    SetupEvent::Reconnected
                } else if state == SetupState::AwaitIdentity {
                    let name = prompter.ask("Enter your Username:").await?;
                    if name.is_empty() {
                        continue;
                    }
                    send_identity(writer, &name, "Username").await?;
                    SetupEvent::Identity
                } else {
                    let mut path = prompter.ask("Enter your Store File Path:").await?;
                    while !PathBuf::from(&path).is_dir() {
                        path = prompter.ask("Enter a valid Store File Path:").await?;
                    }
                    send_identity(writer, &path, "Store File Path").await?;
                    shared_root = Some(PathBuf::from(path));
                    SetupEvent::SharedPath
                }
            }
            SetupState::Ready => break,
        };
        state = advance(&state, &event).context("setup reached an impossible state")?;
    }

    let (reader, writer) = conn.context("no connection")?;
    Ok(Established {
        reader,
        writer,
        shared_root,
        reconnected,
    })
}
