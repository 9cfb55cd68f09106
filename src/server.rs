//! Relay server: accept loop, admission and per-connection dispatch

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;

use crate::codec::{read_line, shared_writer, write_all_timed, Frame, SharedWriter};
use crate::heartbeat;
use crate::protocol::timeouts::WRITE_MS;
use crate::relay::{self, RelayOutcome};
use crate::session::{Session, SessionRegistry};

pub async fn serve(bind: &str, heartbeat_every: Duration) -> Result<()> {
    let listener = match TcpListener::bind(bind).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            let port = bind.rsplit(':').next().unwrap_or(bind);
            anyhow::bail!("Port {} is already in use", port);
        }
        Err(e) => return Err(e).with_context(|| format!("bind {}", bind)),
    };
    eprintln!("itshared listening on {}", listener.local_addr()?);
    serve_listener(listener, Arc::new(SessionRegistry::new()), heartbeat_every).await
}

/// Run the accept loop on an already bound listener.
pub async fn serve_listener(
    listener: TcpListener,
    sessions: Arc<SessionRegistry>,
    heartbeat_every: Duration,
) -> Result<()> {
    let monitor = heartbeat::spawn(Arc::clone(&sessions), heartbeat_every);
    let result = accept_loop(&listener, &sessions).await;
    monitor.abort();
    result
}

async fn accept_loop(listener: &TcpListener, sessions: &Arc<SessionRegistry>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        info!("connection from {}", peer);
        let sessions = Arc::clone(sessions);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, sessions).await {
                warn!("connection {} ended with error: {:#}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    sessions: Arc<SessionRegistry>,
) -> Result<()> {
    let (rd, wr) = stream.into_split();
    let mut reader = BufReader::new(rd);
    let writer = shared_writer(wr);

    let session = match admit(&mut reader, peer, &sessions, &writer).await? {
        Some(s) => s,
        None => {
            debug!("{} left before identifying", peer);
            return Ok(());
        }
    };

    let result = dispatch(&mut reader, &session, &sessions).await;
    match result {
        Ok(Ending::Exit) => {
            sessions.unregister(&session.id).await;
            info!("{} ({}) exited", session.username, session.id);
            sessions
                .broadcast(&format!("{} has left the chat", session.username), None)
                .await;
        }
        Ok(Ending::Closed) | Err(_) => {
            if sessions.mark_offline(&session.id, &writer).await {
                info!("{} ({}) went offline", session.username, session.id);
            }
        }
    }
    result.map(|_| ())
}

/// Rebind a returning peer or read a new identity. `None` when the peer
/// hung up before sending both identity lines.
async fn admit<R>(
    reader: &mut R,
    peer: SocketAddr,
    sessions: &SessionRegistry,
    writer: &SharedWriter,
) -> Result<Option<Session>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    if let Some(session) = sessions.rebind(peer.ip(), Arc::clone(writer)).await {
        session
            .send_frame(&Frame::Reconnect {
                username: session.username.clone(),
                token: session.id.clone(),
            })
            .await
            .context("send reconnect")?;
        return Ok(Some(session));
    }

    let username = match read_line(reader).await? {
        Some(name) => name.trim().to_string(),
        None => return Ok(None),
    };
    let shared_path = match read_line(reader).await? {
        Some(path) => path.trim().to_string(),
        None => return Ok(None),
    };

    let session = sessions
        .create(&username, &shared_path, Some(peer.ip()), Arc::clone(writer))
        .await;
    session
        .send_line(&format!(
            "Welcome {}! Your ID is {}",
            session.username, session.id
        ))
        .await
        .context("send welcome")?;
    sessions
        .broadcast(&format!("{} has joined the chat", session.username), Some(&session.id))
        .await;
    Ok(Some(session))
}

enum Ending {
    Exit,
    Closed,
}

async fn dispatch<R>(reader: &mut R, session: &Session, sessions: &SessionRegistry) -> Result<Ending>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    while let Some(line) = read_line(reader).await? {
        if line.trim().is_empty() {
            continue;
        }
        let frame = match Frame::parse(&line) {
            Ok(f) => f,
            Err(e) => {
                debug!("dropping frame from {}: {}", session.id, e);
                continue;
            }
        };
        match frame {
            Frame::Request {
                kind,
                recipient_id,
                tag,
                size,
            } => {
                let outcome =
                    relay::relay_payload(sessions, session, reader, kind, &recipient_id, tag, size)
                        .await?;
                if let RelayOutcome::Short { .. } = outcome {
                    return Ok(Ending::Closed);
                }
            }
            routed @ (Frame::Look { .. } | Frame::LookResponse { .. } | Frame::DownloadRequest { .. }) => {
                relay::forward(sessions, session, routed).await?;
            }
            Frame::Users => {
                let mut block = Frame::UsersBlock.encode();
                for line in sessions.roster().await {
                    block.push_str(&line);
                    block.push('\n');
                }
                block.push('\n');
                let mut w = session.writer().lock().await;
                write_all_timed(&mut **w, block.as_bytes(), WRITE_MS).await?;
            }
            Frame::Ping => session.send_frame(&Frame::Pong).await?,
            Frame::Pong => debug!("pong from {}", session.id),
            Frame::Exit => return Ok(Ending::Exit),
            Frame::Chat(text) => {
                sessions
                    .broadcast(&format!("{}: {}", session.username, text), Some(&session.id))
                    .await;
            }
            Frame::Response { .. }
            | Frame::LookRequest { .. }
            | Frame::UsersBlock
            | Frame::Reconnect { .. } => {
                debug!("ignoring server-bound frame from {}: {}", session.id, line);
            }
        }
    }
    Ok(Ending::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::drain;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_admit_new_identity_and_join_notice() {
        let sessions = SessionRegistry::new();
        let (alice_w, mut alice_rx) = tokio::io::duplex(4096);
        let alice = sessions.create("alice", "/a", None, shared_writer(alice_w)).await;

        let (bob_w, mut bob_rx) = tokio::io::duplex(4096);
        let writer = shared_writer(bob_w);
        let mut input: &[u8] = b"bob\n/home/bob/share\n";
        let peer: SocketAddr = "10.1.1.1:5000".parse().unwrap();
        let bob = admit(&mut input, peer, &sessions, &writer).await.unwrap().unwrap();

        assert_eq!(bob.username, "bob");
        assert_eq!(bob.shared_path, "/home/bob/share");
        assert_eq!(bob.id.len(), 8);
        assert!(bob.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(bob.id, alice.id);
        assert_eq!(
            drain(&mut bob_rx).await,
            format!("Welcome bob! Your ID is {}\n", bob.id)
        );
        assert_eq!(drain(&mut alice_rx).await, "bob has joined the chat\n");
    }

    #[tokio::test]
    async fn test_admit_rebinds_offline_peer() {
        let sessions = SessionRegistry::new();
        let peer: SocketAddr = "10.1.1.2:5000".parse().unwrap();
        let (w, _rx) = tokio::io::duplex(4096);
        let old_writer = shared_writer(w);
        let dora = sessions
            .create("dora", "/d", Some(peer.ip()), Arc::clone(&old_writer))
            .await;
        sessions.mark_offline(&dora.id, &old_writer).await;

        let (w2, mut rx2) = tokio::io::duplex(4096);
        let mut input: &[u8] = b"";
        let back = admit(&mut input, peer, &sessions, &shared_writer(w2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back.id, dora.id);
        assert_eq!(drain(&mut rx2).await, format!("RECONNECT dora {}\n", dora.id));
    }

    #[tokio::test]
    async fn test_admit_hangup_before_identity() {
        let sessions = SessionRegistry::new();
        let (w, _rx) = tokio::io::duplex(64);
        let mut input: &[u8] = b"carol\n";
        let peer: SocketAddr = "10.1.1.3:5000".parse().unwrap();
        assert!(admit(&mut input, peer, &sessions, &shared_writer(w))
            .await
            .unwrap()
            .is_none());
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_dispatch_drops_malformed_and_keeps_going() {
        let sessions = SessionRegistry::new();
        let (aw, _arx) = tokio::io::duplex(4096);
        let alice = sessions.create("alice", "/a", None, shared_writer(aw)).await;
        let (bw, mut brx) = tokio::io::duplex(4096);
        let _bob = sessions.create("bob", "/b", None, shared_writer(bw)).await;

        let mut input: &[u8] = b"FILE_REQUEST onlyone\nRECONNECT x\nhello bob\nEXIT\n";
        let ending = dispatch(&mut input, &alice, &sessions).await.unwrap();
        assert!(matches!(ending, Ending::Exit));
        assert_eq!(drain(&mut brx).await, "alice: hello bob\n");
    }

    #[tokio::test]
    async fn test_dispatch_answers_users_and_ping() {
        let sessions = SessionRegistry::new();
        let (aw, mut arx) = tokio::io::duplex(4096);
        let alice = sessions.create("alice", "/a", None, shared_writer(aw)).await;

        let mut input: &[u8] = b"USERS\nPING\n";
        let ending = dispatch(&mut input, &alice, &sessions).await.unwrap();
        assert!(matches!(ending, Ending::Closed));
        assert_eq!(
            drain(&mut arx).await,
            format!("USERS:\nalice [ID: {}] online\n\nPONG\n", alice.id)
        );
    }

    #[tokio::test]
    async fn test_bind_reports_port_in_use() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = holder.local_addr().unwrap();
        let err = serve(&addr.to_string(), Duration::from_secs(100))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), format!("Port {} is already in use", addr.port()));
    }

    #[tokio::test]
    async fn test_connection_end_marks_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sessions = Arc::new(SessionRegistry::new());
        let server = tokio::spawn(serve_listener(
            listener,
            Arc::clone(&sessions),
            Duration::from_secs(100),
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"erin\n/e\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sessions.len().await, 1);
        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let roster = sessions.roster().await;
        assert_eq!(roster.len(), 1);
        assert!(roster[0].starts_with("erin [ID: "));
        assert!(roster[0].ends_with("offline"));
        server.abort();
    }
}
