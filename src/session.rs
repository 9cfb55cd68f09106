//! Server-side session registry
//!
//! The map lock is held for a whole broadcast or heartbeat sweep, so either
//! sees a consistent membership. Writers are only `try_lock`ed during a
//! sweep: a writer that is busy carries a relayed payload, which means the
//! peer is alive, and chat for it is delivered once the payload is done.

use anyhow::Result;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use tokio::sync::Mutex;

use crate::codec::{write_all_timed, Frame, RosterEntry, SharedWriter};
use crate::protocol::timeouts::WRITE_MS;

#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub username: String,
    pub shared_path: String,
    pub peer_addr: Option<IpAddr>,
    pub online: bool,
    writer: SharedWriter,
}

impl Session {
    pub fn new(
        id: String,
        username: String,
        shared_path: String,
        peer_addr: Option<IpAddr>,
        writer: SharedWriter,
    ) -> Self {
        Self {
            id,
            username,
            shared_path,
            peer_addr,
            online: true,
            writer,
        }
    }

    pub fn writer(&self) -> &SharedWriter {
        &self.writer
    }

    /// Wait for the writer and send one line.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut w = self.writer.lock().await;
        write_all_timed(&mut **w, format!("{}\n", line).as_bytes(), WRITE_MS).await
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut w = self.writer.lock().await;
        write_all_timed(&mut **w, frame.encode().as_bytes(), WRITE_MS).await
    }

    fn roster_entry(&self) -> RosterEntry {
        RosterEntry {
            username: self.username.clone(),
            id: self.id.clone(),
            online: self.online,
        }
    }
}

enum Delivery {
    Sent,
    Busy,
    Failed(anyhow::Error),
}

async fn try_deliver(writer: &SharedWriter, bytes: &[u8]) -> Delivery {
    match writer.try_lock() {
        Ok(mut w) => match write_all_timed(&mut **w, bytes, WRITE_MS).await {
            Ok(()) => Delivery::Sent,
            Err(e) => Delivery::Failed(e),
        },
        Err(_) => Delivery::Busy,
    }
}

fn deliver_later(id: String, writer: SharedWriter, bytes: Vec<u8>) {
    tokio::spawn(async move {
        let mut w = writer.lock().await;
        if let Err(e) = write_all_timed(&mut **w, &bytes, WRITE_MS).await {
            debug!("deferred delivery to {} failed: {}", id, e);
        }
    });
}

pub fn departure_notice(username: &str) -> String {
    format!("User {} is now offline", username)
}

/// Send `line` to every online session except `excluding`. A failed write
/// demotes that session and queues exactly one departure notice for it.
async fn sweep(sessions: &mut HashMap<String, Session>, line: String, excluding: Option<String>) {
    let mut pending = VecDeque::from([(line, excluding)]);
    while let Some((line, excluding)) = pending.pop_front() {
        let bytes = format!("{}\n", line).into_bytes();
        for session in sessions.values_mut() {
            if !session.online || excluding.as_deref() == Some(session.id.as_str()) {
                continue;
            }
            match try_deliver(&session.writer, &bytes).await {
                Delivery::Sent => {}
                Delivery::Busy => {
                    deliver_later(session.id.clone(), session.writer.clone(), bytes.clone())
                }
                Delivery::Failed(e) => {
                    warn!("write to {} ({}) failed: {}", session.username, session.id, e);
                    session.online = false;
                    pending.push_back((departure_notice(&session.username), Some(session.id.clone())));
                }
            }
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh 8-hex-digit ID not used by any current session.
    fn fresh_id(sessions: &HashMap<String, Session>) -> String {
        loop {
            let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
            if !sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Admit a new connection; returns the session with its issued ID.
    pub async fn create(
        &self,
        username: &str,
        shared_path: &str,
        peer_addr: Option<IpAddr>,
        writer: SharedWriter,
    ) -> Session {
        let mut sessions = self.sessions.lock().await;
        let id = Self::fresh_id(&sessions);
        let session = Session::new(
            id.clone(),
            username.to_string(),
            shared_path.to_string(),
            peer_addr,
            writer,
        );
        sessions.insert(id, session.clone());
        info!("registered {} as {}", session.username, session.id);
        session
    }

    pub async fn register(&self, session: Session) {
        self.sessions.lock().await.insert(session.id.clone(), session);
    }

    pub async fn unregister(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn broadcast(&self, content: &str, excluding: Option<&str>) {
        let mut sessions = self.sessions.lock().await;
        sweep(&mut sessions, content.to_string(), excluding.map(str::to_string)).await;
    }

    /// One heartbeat sweep: PING every online session. Returns the IDs that
    /// went offline during this sweep.
    pub async fn probe(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock().await;
        let ping = Frame::Ping.encode().into_bytes();
        let mut departed = Vec::new();
        for session in sessions.values_mut().filter(|s| s.online) {
            match try_deliver(&session.writer, &ping).await {
                Delivery::Sent | Delivery::Busy => {}
                Delivery::Failed(e) => {
                    info!("user disconnected: {} ({}): {}", session.username, session.id, e);
                    session.online = false;
                    departed.push((session.id.clone(), session.username.clone()));
                }
            }
        }
        for (id, username) in &departed {
            sweep(&mut sessions, departure_notice(username), Some(id.clone())).await;
        }
        departed.into_iter().map(|(id, _)| id).collect()
    }

    /// Demote a session whose connection ended, unless it has since been
    /// rebound to a different connection. Returns whether it went offline.
    pub async fn mark_offline(&self, id: &str, writer: &SharedWriter) -> bool {
        let mut sessions = self.sessions.lock().await;
        let username = match sessions.get_mut(id) {
            Some(s) if s.online && std::sync::Arc::ptr_eq(&s.writer, writer) => {
                s.online = false;
                s.username.clone()
            }
            _ => return false,
        };
        sweep(&mut sessions, departure_notice(&username), Some(id.to_string())).await;
        true
    }

    /// Restore an offline session that came back from the same address.
    pub async fn rebind(&self, addr: IpAddr, writer: SharedWriter) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .values_mut()
            .find(|s| !s.online && s.peer_addr == Some(addr))?;
        session.online = true;
        session.writer = writer;
        let restored = session.clone();
        info!("{} ({}) reconnected from {}", restored.username, restored.id, addr);
        sweep(
            &mut sessions,
            format!("User {} is back online", restored.username),
            Some(restored.id.clone()),
        )
        .await;
        Some(restored)
    }

    /// Roster lines ordered by username, then ID.
    pub async fn roster(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut entries: Vec<RosterEntry> = sessions.values().map(Session::roster_entry).collect();
        entries.sort_by(|a, b| a.username.cmp(&b.username).then_with(|| a.id.cmp(&b.id)));
        entries.iter().map(|e| e.to_string()).collect()
    }
}
