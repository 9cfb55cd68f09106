//! Interactive client: server read loop and stdin command loop

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead};

use crate::cli::ClientOpts;
use crate::codec::{read_line, read_line_timed, Frame, RosterEntry};
use crate::files::ClientContext;
use crate::logger::{NoopLogger, TextLogger, TransferLogger};
use crate::protocol::listing;
use crate::protocol::timeouts::{RECONNECT_PROBE_MS, ROSTER_READ_MS};
use crate::setup::{self, Prompter};
use crate::transfer::{Direction, Transfer, TransferRegistry};

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendFile { recipient_id: String, path: PathBuf },
    SendFolder { recipient_id: String, path: PathBuf },
    Look { user_id: String },
    Download { user_id: String, path: String },
    Users,
    Transfers,
    Pause { transfer_id: String },
    Resume { transfer_id: String },
    Help,
    Exit,
    Chat(String),
    /// Known command, wrong arguments; carries the usage line.
    Usage(&'static str),
}

impl Command {
    /// `None` for blank input.
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        // User ID first, the rest (which may contain spaces) second
        let pair = || rest.split_once(char::is_whitespace).map(|(a, b)| (a.to_string(), b.trim().to_string()));
        let single = || (!rest.is_empty() && !rest.contains(char::is_whitespace)).then(|| rest.to_string());

        let cmd = match head {
            "/sendfile" => match pair() {
                Some((recipient_id, path)) => Command::SendFile {
                    recipient_id,
                    path: PathBuf::from(path),
                },
                None => Command::Usage("/sendfile <userId> <path>"),
            },
            "/sendfolder" => match pair() {
                Some((recipient_id, path)) => Command::SendFolder {
                    recipient_id,
                    path: PathBuf::from(path),
                },
                None => Command::Usage("/sendfolder <userId> <path>"),
            },
            "/look" | "/lookup" => match single() {
                Some(user_id) => Command::Look { user_id },
                None => Command::Usage("/look <userId>"),
            },
            "/download" => match pair() {
                Some((user_id, path)) => Command::Download { user_id, path },
                None => Command::Usage("/download <userId> <path>"),
            },
            "/pause" => match single() {
                Some(transfer_id) => Command::Pause { transfer_id },
                None => Command::Usage("/pause <transferId>"),
            },
            "/resume" => match single() {
                Some(transfer_id) => Command::Resume { transfer_id },
                None => Command::Usage("/resume <transferId>"),
            },
            "/users" | "/status" if rest.is_empty() => Command::Users,
            "/transfers" if rest.is_empty() => Command::Transfers,
            "/help" if rest.is_empty() => Command::Help,
            "/exit" | "exit" if rest.is_empty() => Command::Exit,
            _ => Command::Chat(chat_line(line)),
        };
        Some(cmd)
    }
}

/// Chat that would read as a protocol keyword gets a leading space so the
/// server relays it instead of acting on it.
fn chat_line(text: &str) -> String {
    match Frame::parse(text) {
        Ok(Frame::Chat(_)) => text.to_string(),
        _ => format!(" {}", text),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub fn help_text() -> &'static str {
    "Commands:
  /users                         show users and their status
  /look <userId>                 browse a user's shared folder
  /sendfile <userId> <path>      send a file
  /sendfolder <userId> <path>    send a folder
  /download <userId> <path>      fetch a file or folder from a user's share
  /transfers                     list transfers in progress
  /pause <transferId>            pause a transfer
  /resume <transferId>           resume a paused transfer
  /help                          show this help
  /exit                          leave
Anything else is sent to everyone as chat."
}

/// One `/transfers` line.
pub fn describe(transfer: &Transfer) -> String {
    let arrow = match transfer.direction {
        Direction::Send => "to",
        Direction::Receive => "from",
    };
    let elapsed = (Utc::now() - transfer.started_at).num_seconds().max(0);
    let theirs = if transfer.peer_transfer_id.is_empty() {
        String::new()
    } else {
        format!(" (their #{})", transfer.peer_transfer_id)
    };
    format!(
        "#{} {} '{}' {} {}{} | {}/{} bytes ({:.1}%) | {} | {}s",
        transfer.id,
        transfer.kind,
        transfer.name,
        arrow,
        transfer.peer_id,
        theirs,
        transfer.bytes_complete(),
        transfer.declared_size,
        transfer.progress(),
        transfer.status(),
        elapsed
    )
}

/// Act on one command. Errors are failures to write to the server.
pub async fn execute(ctx: &Arc<ClientContext>, cmd: Command) -> Result<Flow> {
    match cmd {
        Command::SendFile { recipient_id, path } => {
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                if let Err(e) = ctx.send_file(&recipient_id, &path).await {
                    eprintln!("Cannot send {}: {:#}", path.display(), e);
                }
            });
        }
        Command::SendFolder { recipient_id, path } => {
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                if let Err(e) = ctx.send_folder(&recipient_id, &path).await {
                    eprintln!("Cannot send {}: {:#}", path.display(), e);
                }
            });
        }
        Command::Look { user_id } => ctx.send_frame(&Frame::Look { user_id }).await?,
        Command::Download { user_id, path } => {
            ctx.send_frame(&Frame::DownloadRequest {
                user_id,
                file_path: path,
            })
            .await?
        }
        Command::Users => ctx.send_frame(&Frame::Users).await?,
        Command::Transfers => {
            let all = ctx.transfers().list();
            if all.is_empty() {
                println!("No transfers in progress");
            }
            for t in all {
                println!("{}", describe(&t));
            }
        }
        Command::Pause { transfer_id } => match ctx.transfers().pause(&transfer_id) {
            Ok(t) => println!("Transfer {} paused at {:.1}%", t.id, t.progress()),
            Err(e) => eprintln!("{}", e),
        },
        Command::Resume { transfer_id } => match ctx.transfers().resume(&transfer_id) {
            Ok(t) => println!("Transfer {} resumed", t.id),
            Err(e) => eprintln!("{}", e),
        },
        Command::Help => println!("{}", help_text()),
        Command::Exit => {
            ctx.send_frame(&Frame::Exit).await?;
            return Ok(Flow::Exit);
        }
        Command::Chat(text) => ctx.send_line(&text).await?,
        Command::Usage(usage) => eprintln!("Usage: {}", usage),
    }
    Ok(Flow::Continue)
}

/// Collect roster lines after `USERS:` until the blank terminator, end of
/// stream, or `ms` of silence.
pub async fn read_roster<R>(reader: &mut R, ms: u64) -> Vec<RosterEntry>
where
    R: AsyncBufRead + Unpin,
{
    let mut entries = Vec::new();
    while let Ok(Some(line)) = read_line_timed(reader, ms).await {
        if line.trim().is_empty() {
            break;
        }
        match RosterEntry::parse(&line) {
            Some(entry) => entries.push(entry),
            None => debug!("skipping roster line {:?}", line),
        }
    }
    entries
}

fn print_roster(entries: &[RosterEntry]) {
    println!("Users:");
    if entries.is_empty() {
        println!("  No users currently online");
    }
    for e in entries {
        println!("  {}", e);
    }
}

fn print_listing(user_id: &str, entries: &[String]) {
    println!("Shared folder of {}:", user_id);
    for entry in entries {
        if entry == listing::FOLDERS_HEADER || entry == listing::FILES_HEADER {
            println!("{}", entry);
        } else {
            println!("  {}", entry);
        }
    }
}

/// Handle server traffic until the connection closes. Payloads are received
/// inline; answers that send on the connection run on their own tasks.
pub async fn read_loop<R>(reader: &mut R, ctx: Arc<ClientContext>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = read_line(reader).await? {
        if line.is_empty() {
            continue;
        }
        let frame = match Frame::parse(&line) {
            Ok(f) => f,
            Err(e) => {
                debug!("dropping frame: {}", e);
                continue;
            }
        };
        match frame {
            Frame::Response {
                kind,
                recipient_id,
                tag,
                size,
                store_path,
            } => {
                println!("Incoming {} '{}' ({} bytes)", kind, tag.name, size);
                ctx.receive(reader, kind, &recipient_id, &tag, size, &store_path)
                    .await?;
            }
            Frame::LookRequest {
                storage_path,
                user_id,
            } => {
                println!("Directory lookup request from {}", user_id);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = ctx.answer_lookup(&user_id, &storage_path).await {
                        warn!("lookup answer to {} failed: {:#}", user_id, e);
                    }
                });
            }
            Frame::LookResponse { user_id, listing } => print_listing(&user_id, &listing),
            Frame::DownloadRequest { user_id, file_path } => {
                println!("Download request from {} for {}", user_id, file_path);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = ctx.answer_download(&user_id, &file_path).await {
                        eprintln!("Cannot serve {} to {}: {:#}", file_path, user_id, e);
                    }
                });
            }
            Frame::UsersBlock => {
                let entries = read_roster(reader, ROSTER_READ_MS).await;
                print_roster(&entries);
            }
            Frame::Ping => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = ctx.send_frame(&Frame::Pong).await {
                        debug!("pong failed: {:#}", e);
                    }
                });
            }
            Frame::Pong => {}
            Frame::Reconnect { username, .. } => println!("Welcome back {}!", username),
            Frame::Request { .. } | Frame::Look { .. } | Frame::Users | Frame::Exit => {
                debug!("ignoring client-bound frame: {}", line);
            }
            Frame::Chat(text) => println!("{}", text),
        }
    }
    Ok(())
}

/// Read commands from the user until `/exit` or end of input.
pub async fn command_loop<R>(prompter: &mut Prompter<R>, ctx: Arc<ClientContext>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(line) = prompter.next_line().await? {
        if let Some(cmd) = Command::parse(&line) {
            if execute(&ctx, cmd).await? == Flow::Exit {
                break;
            }
        }
    }
    Ok(())
}

pub async fn run(opts: ClientOpts) -> Result<()> {
    let logger: Arc<dyn TransferLogger> = match &opts.log_file {
        Some(path) => Arc::new(
            TextLogger::new(path)
                .with_context(|| format!("open log file {}", path.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };

    let mut prompter = Prompter::new(tokio::io::stdin());
    let mut est = setup::establish(&mut prompter, opts.server.clone(), RECONNECT_PROBE_MS).await?;

    let ctx = Arc::new(
        ClientContext::new(est.writer, Arc::new(TransferRegistry::new()))
            .with_logger(logger)
            .with_progress(true),
    );
    if let Some(root) = est.shared_root {
        ctx.set_shared_root(root);
    }
    if est.reconnected {
        println!("Session restored. Type /help for commands.");
    } else {
        println!("{}", help_text());
    }

    tokio::select! {
        res = read_loop(&mut est.reader, Arc::clone(&ctx)) => match res {
            Ok(()) => println!("Server closed the connection"),
            Err(e) => eprintln!("Connection lost: {:#}", e),
        },
        res = command_loop(&mut prompter, Arc::clone(&ctx)) => res?,
    }
    Ok(())
}
