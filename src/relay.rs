//! Server-side forwarding of transfers and directory traffic between peers

use anyhow::Result;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::checkpoint::discard;
use crate::codec::{Frame, TransferTag};
use crate::protocol::CHUNK_SIZE;
use crate::session::{Session, SessionRegistry};
use crate::transfer::TransferKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered(u64),
    /// Recipient unknown; payload discarded.
    NotFound,
    /// Recipient offline; payload discarded.
    Offline,
    /// Recipient write failed part way; the rest was drained from the sender
    /// and the recipient's connection was closed.
    RecipientFailed { forwarded: u64 },
    /// Sender stream ended before the declared size. The recipient's
    /// connection was closed so it sees the shortfall.
    Short { forwarded: u64 },
}

/// Relay one announced payload from `sender` (whose remaining bytes are on
/// `input`) to `recipient_id`.
///
/// Writes to the recipient are not timed: a receiver that paused its
/// transfer stops reading, and the relay waits for it as long as the
/// connection lives. Once the response line is out the recipient expects
/// exactly `size` bytes, so if that cannot be honoured its write half is
/// shut down instead of letting later lines land inside the payload.
pub async fn relay_payload<R>(
    sessions: &SessionRegistry,
    sender: &Session,
    input: &mut R,
    kind: TransferKind,
    recipient_id: &str,
    tag: TransferTag,
    size: u64,
) -> Result<RelayOutcome>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let recipient = match sessions.get(recipient_id).await {
        Some(s) if s.online => s,
        Some(_) => {
            discard(input, size).await?;
            sender
                .send_line(&format!("User {} is offline", recipient_id))
                .await?;
            return Ok(RelayOutcome::Offline);
        }
        None => {
            discard(input, size).await?;
            sender
                .send_line(&format!("User {} not found", recipient_id))
                .await?;
            return Ok(RelayOutcome::NotFound);
        }
    };

    let response = Frame::Response {
        kind,
        recipient_id: recipient.id.clone(),
        tag: tag.clone(),
        size,
        store_path: recipient.shared_path.clone(),
    };

    let mut forwarded = 0u64;
    let mut recipient_ok = true;
    let mut drained = 0u64;
    {
        let mut out = recipient.writer().lock().await;
        if let Err(e) = out.write_all(response.encode().as_bytes()).await {
            warn!("relay to {}: response write failed: {}", recipient.id, e);
            recipient_ok = false;
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        while drained < size {
            let want = usize::try_from(size - drained).map_or(buf.len(), |r| r.min(buf.len()));
            let n = input.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            drained += n as u64;
            if !recipient_ok {
                continue;
            }
            match out.write_all(&buf[..n]).await {
                Ok(()) => forwarded += n as u64,
                Err(e) => {
                    warn!("relay to {}: payload write failed: {}", recipient.id, e);
                    recipient_ok = false;
                }
            }
        }

        if recipient_ok && drained == size {
            if let Err(e) = out.flush().await {
                warn!("relay to {}: flush failed: {}", recipient.id, e);
                recipient_ok = false;
            }
        }
        if !recipient_ok || drained < size {
            if let Err(e) = out.shutdown().await {
                debug!("closing {} after broken relay: {}", recipient.id, e);
            }
        }
    }

    if !recipient_ok {
        sessions.mark_offline(&recipient.id, recipient.writer()).await;
        sender
            .send_line(&format!("Transfer of {} to {} failed", tag.name, recipient.id))
            .await?;
        return Ok(RelayOutcome::RecipientFailed { forwarded });
    }
    if drained < size {
        warn!(
            "relay {} -> {}: short copy {} of {} bytes",
            sender.id, recipient.id, forwarded, size
        );
        sessions.mark_offline(&recipient.id, recipient.writer()).await;
        return Ok(RelayOutcome::Short { forwarded });
    }
    info!(
        "relayed {} {} ({} bytes) {} -> {}",
        kind, tag.name, forwarded, sender.id, recipient.id
    );
    Ok(RelayOutcome::Delivered(forwarded))
}

/// Route a directory frame to its target with the user-ID slot rewritten
/// to the originating session. Returns false when the target is unknown
/// or offline, after telling the origin.
pub async fn forward(sessions: &SessionRegistry, origin: &Session, frame: Frame) -> Result<bool> {
    let target_id = match &frame {
        Frame::Look { user_id }
        | Frame::LookResponse { user_id, .. }
        | Frame::DownloadRequest { user_id, .. } => user_id.clone(),
        other => anyhow::bail!("not a routed frame: {}", other),
    };

    let target = match sessions.get(&target_id).await {
        Some(s) if s.online => s,
        Some(_) => {
            origin
                .send_line(&format!("User {} is offline", target_id))
                .await?;
            return Ok(false);
        }
        None => {
            origin
                .send_line(&format!("User {} not found", target_id))
                .await?;
            return Ok(false);
        }
    };

    let routed = match frame {
        Frame::Look { .. } => Frame::LookRequest {
            storage_path: target.shared_path.clone(),
            user_id: origin.id.clone(),
        },
        Frame::LookResponse { listing, .. } => Frame::LookResponse {
            user_id: origin.id.clone(),
            listing,
        },
        Frame::DownloadRequest { file_path, .. } => Frame::DownloadRequest {
            user_id: origin.id.clone(),
            file_path,
        },
        other => anyhow::bail!("not a routed frame: {}", other),
    };
    if let Err(e) = target.send_frame(&routed).await {
        warn!("forward to {} failed: {}", target.id, e);
        sessions.mark_offline(&target.id, target.writer()).await;
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_line, shared_writer};
    use crate::protocol::timeouts::WRITE_MS;
    use crate::session::tests::{drain, peer, BrokenWriter};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn test_relay_forwards_exact_payload() {
        let sessions = SessionRegistry::new();
        let (alice, _alice_rx) = peer(&sessions, "alice").await;
        let (bob, bob_rx) = peer(&sessions, "bob").await;

        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
        let mut wire = payload.clone();
        wire.extend_from_slice(b"NEXT LINE\n");
        let mut input: &[u8] = &wire;

        let outcome = relay_payload(
            &sessions,
            &alice,
            &mut input,
            TransferKind::File,
            &bob.id,
            TransferTag::new("data.bin", "abc", "4"),
            payload.len() as u64,
        )
        .await
        .unwrap();
        assert_eq!(outcome, RelayOutcome::Delivered(payload.len() as u64));
        assert_eq!(input, b"NEXT LINE\n");

        let mut reader = BufReader::new(bob_rx);
        let line = read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(
            line,
            format!("FILE_RESPONSE {} data.bin|abc|4 {} /tmp", bob.id, payload.len())
        );
        let mut got = vec![0u8; payload.len()];
        reader.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_unknown_recipient_drains_payload() {
        let sessions = SessionRegistry::new();
        let (alice, mut alice_rx) = peer(&sessions, "alice").await;
        let mut input: &[u8] = b"12345PING\n";
        let outcome = relay_payload(
            &sessions,
            &alice,
            &mut input,
            TransferKind::File,
            "nobody",
            TransferTag::new("x", "y", "1"),
            5,
        )
        .await
        .unwrap();
        assert_eq!(outcome, RelayOutcome::NotFound);
        assert_eq!(input, b"PING\n");
        assert_eq!(drain(&mut alice_rx).await, "User nobody not found\n");
    }

    #[tokio::test]
    async fn test_offline_recipient_is_reported() {
        let sessions = SessionRegistry::new();
        let (alice, mut alice_rx) = peer(&sessions, "alice").await;
        let (bob, _bob_rx) = peer(&sessions, "bob").await;
        sessions.mark_offline(&bob.id, bob.writer()).await;
        drain(&mut alice_rx).await;

        let mut input: &[u8] = b"abc";
        let outcome = relay_payload(
            &sessions,
            &alice,
            &mut input,
            TransferKind::Folder,
            &bob.id,
            TransferTag::new("dir", "y", "1"),
            3,
        )
        .await
        .unwrap();
        assert_eq!(outcome, RelayOutcome::Offline);
        assert!(input.is_empty());
        assert_eq!(
            drain(&mut alice_rx).await,
            format!("User {} is offline\n", bob.id)
        );
    }

    #[tokio::test]
    async fn test_short_sender_stream_closes_recipient() {
        let sessions = SessionRegistry::new();
        let (alice, mut alice_rx) = peer(&sessions, "alice").await;
        let (bob, bob_rx) = peer(&sessions, "bob").await;
        let mut input: &[u8] = b"only";
        let outcome = relay_payload(
            &sessions,
            &alice,
            &mut input,
            TransferKind::File,
            &bob.id,
            TransferTag::new("f", "c", "1"),
            10,
        )
        .await
        .unwrap();
        assert_eq!(outcome, RelayOutcome::Short { forwarded: 4 });
        assert!(!sessions.get(&bob.id).await.unwrap().online);
        assert_eq!(drain(&mut alice_rx).await, "User bob is now offline\n");

        // Bob sees the four bytes, then end-of-stream instead of later traffic
        let mut seen = Vec::new();
        let mut reader = BufReader::new(bob_rx);
        reader.read_to_end(&mut seen).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&seen),
            format!("FILE_RESPONSE {} f|c|1 10 /tmp\nonly", bob.id)
        );
    }

    #[tokio::test]
    async fn test_stalled_recipient_is_waited_for() {
        let sessions = SessionRegistry::new();
        let (alice, _alice_rx) = peer(&sessions, "alice").await;
        let (ours, bob_rx) = tokio::io::duplex(8 * 1024);
        let bob = sessions.create("bob", "/tmp", None, shared_writer(ours)).await;

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.len();
        let receiver = tokio::spawn(async move {
            // A paused receive stops reading for longer than any write timeout
            tokio::time::sleep(Duration::from_millis(WRITE_MS + 1_000)).await;
            let mut reader = BufReader::new(bob_rx);
            let line = read_line(&mut reader).await.unwrap().unwrap();
            let mut got = vec![0u8; expected];
            reader.read_exact(&mut got).await.unwrap();
            (line, got)
        });

        let mut input: &[u8] = &payload;
        let outcome = relay_payload(
            &sessions,
            &alice,
            &mut input,
            TransferKind::File,
            &bob.id,
            TransferTag::new("big.bin", "", "2"),
            expected as u64,
        )
        .await
        .unwrap();
        assert_eq!(outcome, RelayOutcome::Delivered(expected as u64));

        let (line, got) = receiver.await.unwrap();
        assert_eq!(line, format!("FILE_RESPONSE {} big.bin||2 {} /tmp", bob.id, expected));
        assert_eq!(got, payload);
        assert!(sessions.get(&bob.id).await.unwrap().online);
    }

    #[tokio::test]
    async fn test_broken_recipient_is_demoted_and_sender_drained() {
        let sessions = SessionRegistry::new();
        let (alice, mut alice_rx) = peer(&sessions, "alice").await;
        let ghost = sessions
            .create("ghost", "/tmp", None, shared_writer(BrokenWriter))
            .await;
        let mut input: &[u8] = b"0123456789PONG\n";
        let outcome = relay_payload(
            &sessions,
            &alice,
            &mut input,
            TransferKind::File,
            &ghost.id,
            TransferTag::new("f", "c", "1"),
            10,
        )
        .await
        .unwrap();
        assert_eq!(outcome, RelayOutcome::RecipientFailed { forwarded: 0 });
        assert_eq!(input, b"PONG\n");
        assert!(!sessions.get(&ghost.id).await.unwrap().online);
        let seen = drain(&mut alice_rx).await;
        assert!(seen.contains("User ghost is now offline"));
        assert!(seen.contains("Transfer of f to"));
    }

    #[tokio::test]
    async fn test_look_is_rewritten_for_target() {
        let sessions = SessionRegistry::new();
        let (alice, _alice_rx) = peer(&sessions, "alice").await;
        let (bob, mut bob_rx) = peer(&sessions, "bob").await;
        let routed = forward(
            &sessions,
            &alice,
            Frame::Look {
                user_id: bob.id.clone(),
            },
        )
        .await
        .unwrap();
        assert!(routed);
        assert_eq!(
            drain(&mut bob_rx).await,
            format!("LOOK_REQUEST /tmp {}\n", alice.id)
        );
    }

    #[tokio::test]
    async fn test_look_response_and_download_carry_origin() {
        let sessions = SessionRegistry::new();
        let (alice, mut alice_rx) = peer(&sessions, "alice").await;
        let (bob, mut bob_rx) = peer(&sessions, "bob").await;

        forward(
            &sessions,
            &bob,
            Frame::LookResponse {
                user_id: alice.id.clone(),
                listing: vec!["Directory is empty".into()],
            },
        )
        .await
        .unwrap();
        assert_eq!(
            drain(&mut alice_rx).await,
            format!("LOOK_RESPONSE {} Directory is empty\n", bob.id)
        );

        forward(
            &sessions,
            &alice,
            Frame::DownloadRequest {
                user_id: bob.id.clone(),
                file_path: "notes/a b.txt".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            drain(&mut bob_rx).await,
            format!("DOWNLOAD_REQUEST {} notes/a b.txt\n", alice.id)
        );
    }

    #[tokio::test]
    async fn test_forward_to_unknown_reports_back() {
        let sessions = SessionRegistry::new();
        let (alice, mut alice_rx) = peer(&sessions, "alice").await;
        let routed = forward(
            &sessions,
            &alice,
            Frame::Look {
                user_id: "ghost".into(),
            },
        )
        .await
        .unwrap();
        assert!(!routed);
        assert_eq!(drain(&mut alice_rx).await, "User ghost not found\n");
        assert!(forward(&sessions, &alice, Frame::Ping).await.is_err());
    }
}
