//! Line codec for the ItShare wire protocol
//!
//! Every control message is one `\n`-terminated line: a case-sensitive
//! keyword followed by space-separated arguments. Lines that do not start
//! with a keyword are chat. Payload bytes of a transfer follow the
//! request/response line directly and are not handled here.

use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use crate::protocol::{keyword, LISTING_SEPARATOR, MAX_FRAME_LEN, TAG_SEPARATOR};
use crate::transfer::TransferKind;

/// Write side of a connection, shared by everything that sends on it.
/// Whoever holds the lock owns the byte stream, so a payload is never
/// interleaved with other lines.
pub type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type SharedWriter = Arc<Mutex<FrameWriter>>;

pub fn shared_writer<W>(writer: W) -> SharedWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Why a line with a recognised keyword was rejected.
///
/// These never end a connection: dispatchers log them and read the next line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{command}: expected {expected} argument(s), found {found}")]
    WrongArity {
        command: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{command}: invalid size {value:?}")]
    BadSize { command: &'static str, value: String },
}

/// The `name|checksum|transferId` argument of transfer frames.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransferTag {
    pub name: String,
    pub checksum: String,
    pub transfer_id: String,
}

impl TransferTag {
    pub fn new(name: &str, checksum: &str, transfer_id: &str) -> Self {
        Self {
            name: name.to_string(),
            checksum: checksum.to_string(),
            transfer_id: transfer_id.to_string(),
        }
    }

    /// Split a tag; missing checksum or ID parts come back empty.
    pub fn parse(s: &str) -> Self {
        let mut parts = s.splitn(3, TAG_SEPARATOR);
        let name = parts.next().unwrap_or_default();
        let checksum = parts.next().unwrap_or_default();
        let transfer_id = parts.next().unwrap_or_default();
        Self::new(name, checksum, transfer_id)
    }
}

impl fmt::Display for TransferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.name,
            self.checksum,
            self.transfer_id,
            sep = TAG_SEPARATOR
        )
    }
}

/// One decoded protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Sender -> server: payload of `size` bytes follows.
    Request {
        kind: TransferKind,
        recipient_id: String,
        tag: TransferTag,
        size: u64,
    },
    /// Server -> receiver: payload of `size` bytes follows.
    Response {
        kind: TransferKind,
        recipient_id: String,
        tag: TransferTag,
        size: u64,
        store_path: String,
    },
    /// Client -> server: browse another peer.
    Look { user_id: String },
    LookRequest { storage_path: String, user_id: String },
    LookResponse { user_id: String, listing: Vec<String> },
    DownloadRequest { user_id: String, file_path: String },
    /// Client -> server: ask for the roster.
    Users,
    /// Server -> client: roster lines follow, ended by an empty line.
    UsersBlock,
    Ping,
    Pong,
    Reconnect { username: String, token: String },
    Exit,
    Chat(String),
}

fn arity(command: &'static str, expected: usize, found: usize) -> FrameError {
    FrameError::WrongArity {
        command,
        expected,
        found,
    }
}

/// Split into exactly `n` arguments, the last one keeping any further spaces.
fn trailing<'a>(command: &'static str, rest: &'a str, n: usize) -> Result<Vec<&'a str>, FrameError> {
    let parts: Vec<&str> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.splitn(n, ' ').collect()
    };
    let found = parts.iter().filter(|p| !p.is_empty()).count();
    if parts.len() != n || found != n {
        return Err(arity(command, n, found));
    }
    Ok(parts)
}

/// Split into exactly `n` space-free arguments.
fn exact<'a>(command: &'static str, rest: &'a str, n: usize) -> Result<Vec<&'a str>, FrameError> {
    let parts: Vec<&str> = rest.split(' ').filter(|p| !p.is_empty()).collect();
    if parts.len() != n {
        return Err(arity(command, n, parts.len()));
    }
    Ok(parts)
}

fn size(command: &'static str, value: &str) -> Result<u64, FrameError> {
    value.trim().parse::<u64>().map_err(|_| FrameError::BadSize {
        command,
        value: value.to_string(),
    })
}

impl Frame {
    /// Classify one line (with or without its trailing newline).
    pub fn parse(line: &str) -> Result<Frame, FrameError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (head, rest) = match line.split_once(' ') {
            Some((head, rest)) => (head, rest),
            None => (line, ""),
        };

        match head {
            keyword::FILE_REQUEST | keyword::FOLDER_REQUEST => {
                let (command, kind) = if head == keyword::FILE_REQUEST {
                    (keyword::FILE_REQUEST, TransferKind::File)
                } else {
                    (keyword::FOLDER_REQUEST, TransferKind::Folder)
                };
                let args = trailing(command, rest, 3)?;
                Ok(Frame::Request {
                    kind,
                    recipient_id: args[0].to_string(),
                    tag: TransferTag::parse(args[1]),
                    size: size(command, args[2])?,
                })
            }
            keyword::FILE_RESPONSE | keyword::FOLDER_RESPONSE => {
                let (command, kind) = if head == keyword::FILE_RESPONSE {
                    (keyword::FILE_RESPONSE, TransferKind::File)
                } else {
                    (keyword::FOLDER_RESPONSE, TransferKind::Folder)
                };
                let args = trailing(command, rest, 4)?;
                Ok(Frame::Response {
                    kind,
                    recipient_id: args[0].to_string(),
                    tag: TransferTag::parse(args[1]),
                    size: size(command, args[2])?,
                    store_path: args[3].to_string(),
                })
            }
            keyword::LOOK => {
                let args = exact(keyword::LOOK, rest, 1)?;
                Ok(Frame::Look {
                    user_id: args[0].to_string(),
                })
            }
            keyword::LOOK_REQUEST => match rest.rsplit_once(' ') {
                Some((path, user)) if !path.is_empty() && !user.is_empty() => Ok(Frame::LookRequest {
                    storage_path: path.to_string(),
                    user_id: user.to_string(),
                }),
                _ => Err(arity(
                    keyword::LOOK_REQUEST,
                    2,
                    rest.split(' ').filter(|p| !p.is_empty()).count(),
                )),
            },
            keyword::LOOK_RESPONSE => {
                let args = trailing(keyword::LOOK_RESPONSE, rest, 2)?;
                Ok(Frame::LookResponse {
                    user_id: args[0].to_string(),
                    listing: args[1].split(LISTING_SEPARATOR).map(str::to_string).collect(),
                })
            }
            keyword::DOWNLOAD_REQUEST => {
                let args = trailing(keyword::DOWNLOAD_REQUEST, rest, 2)?;
                Ok(Frame::DownloadRequest {
                    user_id: args[0].to_string(),
                    file_path: args[1].to_string(),
                })
            }
            keyword::USERS => exact(keyword::USERS, rest, 0).map(|_| Frame::Users),
            keyword::USERS_BLOCK => exact(keyword::USERS_BLOCK, rest, 0).map(|_| Frame::UsersBlock),
            keyword::PING => exact(keyword::PING, rest, 0).map(|_| Frame::Ping),
            keyword::PONG => exact(keyword::PONG, rest, 0).map(|_| Frame::Pong),
            keyword::EXIT => exact(keyword::EXIT, rest, 0).map(|_| Frame::Exit),
            keyword::RECONNECT => {
                let args = exact(keyword::RECONNECT, rest, 2)?;
                Ok(Frame::Reconnect {
                    username: args[0].to_string(),
                    token: args[1].to_string(),
                })
            }
            _ => Ok(Frame::Chat(line.to_string())),
        }
    }

    /// Serialized line including the terminating newline.
    pub fn encode(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Request {
                kind,
                recipient_id,
                tag,
                size,
            } => {
                let command = match kind {
                    TransferKind::File => keyword::FILE_REQUEST,
                    TransferKind::Folder => keyword::FOLDER_REQUEST,
                };
                write!(f, "{} {} {} {}", command, recipient_id, tag, size)
            }
            Frame::Response {
                kind,
                recipient_id,
                tag,
                size,
                store_path,
            } => {
                let command = match kind {
                    TransferKind::File => keyword::FILE_RESPONSE,
                    TransferKind::Folder => keyword::FOLDER_RESPONSE,
                };
                write!(f, "{} {} {} {} {}", command, recipient_id, tag, size, store_path)
            }
            Frame::Look { user_id } => write!(f, "{} {}", keyword::LOOK, user_id),
            Frame::LookRequest {
                storage_path,
                user_id,
            } => write!(f, "{} {} {}", keyword::LOOK_REQUEST, storage_path, user_id),
            Frame::LookResponse { user_id, listing } => {
                let joined = listing.join(&LISTING_SEPARATOR.to_string());
                write!(f, "{} {} {}", keyword::LOOK_RESPONSE, user_id, joined)
            }
            Frame::DownloadRequest { user_id, file_path } => {
                write!(f, "{} {} {}", keyword::DOWNLOAD_REQUEST, user_id, file_path)
            }
            Frame::Users => f.write_str(keyword::USERS),
            Frame::UsersBlock => f.write_str(keyword::USERS_BLOCK),
            Frame::Ping => f.write_str(keyword::PING),
            Frame::Pong => f.write_str(keyword::PONG),
            Frame::Reconnect { username, token } => {
                write!(f, "{} {} {}", keyword::RECONNECT, username, token)
            }
            Frame::Exit => f.write_str(keyword::EXIT),
            Frame::Chat(text) => f.write_str(text),
        }
    }
}

/// One `username [ID: id] status` line of the roster block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub username: String,
    pub id: String,
    pub online: bool,
}

impl RosterEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let (username, rest) = line.split_once("[ID:")?;
        let (id, status) = rest.split_once(']')?;
        let online = match status.trim() {
            "online" => true,
            "offline" => false,
            _ => return None,
        };
        Some(Self {
            username: username.trim().to_string(),
            id: id.trim().to_string(),
            online,
        })
    }
}

impl fmt::Display for RosterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.online { "online" } else { "offline" };
        write!(f, "{} [ID: {}] {}", self.username, self.id, status)
    }
}

/// Read one line, without its terminator. `Ok(None)` means end-of-stream.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_FRAME_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && n > MAX_FRAME_LEN {
        anyhow::bail!("line too long: more than {} bytes", MAX_FRAME_LEN);
    }
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Like [`read_line`] but gives up after `ms` milliseconds.
///
/// Not cancel safe: when the timeout fires part way through a line, the
/// bytes of that line already taken from `reader` are lost. Callers only
/// use it where the peer writes each line in one piece (reconnect probe,
/// roster block), and treat a timeout as the end of what they waited for.
pub async fn read_line_timed<R>(reader: &mut R, ms: u64) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match timeout(Duration::from_millis(ms), read_line(reader)).await {
        Ok(res) => res,
        Err(_) => anyhow::bail!("read timeout ({} ms)", ms),
    }
}

#[inline]
pub async fn write_all_timed<W>(stream: &mut W, buf: &[u8], ms: u64) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match timeout(Duration::from_millis(ms), async {
        stream.write_all(buf).await?;
        stream.flush().await
    })
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => anyhow::bail!("write timeout ({} ms)", ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_parse_file_request_fields() {
        let frame = Frame::parse("FILE_REQUEST u1 report.txt|abc123|7 4096").unwrap();
        assert_eq!(
            frame,
            Frame::Request {
                kind: TransferKind::File,
                recipient_id: "u1".into(),
                tag: TransferTag::new("report.txt", "abc123", "7"),
                size: 4096,
            }
        );
    }

    #[test]
    fn test_parse_folder_response_splits_tag() {
        let frame = Frame::parse("FOLDER_RESPONSE u2 photos|d41d8|3 100 /home/u2/My Shared").unwrap();
        match frame {
            Frame::Response {
                kind,
                recipient_id,
                tag,
                size,
                store_path,
            } => {
                assert_eq!(kind, TransferKind::Folder);
                assert_eq!(recipient_id, "u2");
                assert_eq!(tag.name, "photos");
                assert_eq!(tag.checksum, "d41d8");
                assert_eq!(tag.transfer_id, "3");
                assert_eq!(size, 100);
                assert_eq!(store_path, "/home/u2/My Shared");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_tag_without_checksum_or_id() {
        let tag = TransferTag::parse("plain.txt");
        assert_eq!(tag.name, "plain.txt");
        assert!(tag.checksum.is_empty());
        assert!(tag.transfer_id.is_empty());
    }

    #[test]
    fn test_wrong_arity_is_rejected() {
        assert_eq!(
            Frame::parse("FILE_REQUEST u1 report.txt"),
            Err(FrameError::WrongArity {
                command: "FILE_REQUEST",
                expected: 3,
                found: 2
            })
        );
        assert!(Frame::parse("FILE_RESPONSE u1 a|b|c 10").is_err());
        assert!(Frame::parse("LOOK_RESPONSE u1").is_err());
        assert!(Frame::parse("DOWNLOAD_REQUEST").is_err());
        assert!(Frame::parse("RECONNECT alice").is_err());
        assert!(Frame::parse("RECONNECT alice 42 extra").is_err());
        assert!(Frame::parse("PING now").is_err());
        assert!(Frame::parse("LOOK_REQUEST /only/path").is_err());
    }

    #[test]
    fn test_bad_size_is_rejected() {
        assert_eq!(
            Frame::parse("FILE_REQUEST u1 a|b|c lots"),
            Err(FrameError::BadSize {
                command: "FILE_REQUEST",
                value: "lots".into()
            })
        );
        // Extra tokens run into the size argument and make it unparsable
        assert!(Frame::parse("FILE_REQUEST u1 a|b|c 10 extra").is_err());
    }

    #[test]
    fn test_unknown_keyword_is_chat() {
        assert_eq!(
            Frame::parse("hello there\n").unwrap(),
            Frame::Chat("hello there".into())
        );
        // Keywords are case-sensitive
        assert_eq!(Frame::parse("ping").unwrap(), Frame::Chat("ping".into()));
    }

    #[test]
    fn test_look_request_keeps_spaces_in_path() {
        let frame = Frame::parse("LOOK_REQUEST /srv/my files abc123").unwrap();
        assert_eq!(
            frame,
            Frame::LookRequest {
                storage_path: "/srv/my files".into(),
                user_id: "abc123".into()
            }
        );
    }

    #[test]
    fn test_look_response_listing_survives_encoding() {
        let listing = vec![
            "=== FOLDERS ===".to_string(),
            "[FOLDER] b (Size: 4096 bytes)".to_string(),
            "=== FILES ===".to_string(),
            "[FILE] a b.txt (Size: 10 bytes)".to_string(),
        ];
        let line = Frame::LookResponse {
            user_id: "u9".into(),
            listing: listing.clone(),
        }
        .encode();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        match Frame::parse(&line).unwrap() {
            Frame::LookResponse { user_id, listing: got } => {
                assert_eq!(user_id, "u9");
                assert_eq!(got, listing);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_encode_request_matches_wire_text() {
        let frame = Frame::Request {
            kind: TransferKind::Folder,
            recipient_id: "u1".into(),
            tag: TransferTag::new("docs", "ff00", "12"),
            size: 2048,
        };
        assert_eq!(frame.encode(), "FOLDER_REQUEST u1 docs|ff00|12 2048\n");
        assert_eq!(Frame::Ping.encode(), "PING\n");
        assert_eq!(
            Frame::Reconnect {
                username: "bob".into(),
                token: "1a2b".into()
            }
            .encode(),
            "RECONNECT bob 1a2b\n"
        );
    }

    #[test]
    fn test_roster_entry_parse() {
        let entry = RosterEntry::parse("alice [ID: 1f2e3d4c] online").unwrap();
        assert_eq!(entry.username, "alice");
        assert_eq!(entry.id, "1f2e3d4c");
        assert!(entry.online);
        assert_eq!(entry.to_string(), "alice [ID: 1f2e3d4c] online");
        assert!(!RosterEntry::parse("bob [ID: 9] offline").unwrap().online);
        assert!(RosterEntry::parse("no id here").is_none());
        assert!(RosterEntry::parse("carol [ID: 5] away").is_none());
    }

    #[tokio::test]
    async fn test_read_line_strips_terminators_and_reports_eof() {
        let data: &[u8] = b"PING\r\nhello\n";
        let mut reader = BufReader::new(data);
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("PING"));
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("hello"));
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_line_leaves_payload_in_buffer() {
        let data: &[u8] = b"FILE_RESPONSE u1 a|b|1 3 /tmp\nxyzNEXT\n";
        let mut reader = BufReader::new(data);
        let line = read_line(&mut reader).await.unwrap().unwrap();
        assert!(matches!(Frame::parse(&line).unwrap(), Frame::Response { size: 3, .. }));
        let mut payload = [0u8; 3];
        reader.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"xyz");
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("NEXT"));
    }
}
