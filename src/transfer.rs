//! Transfer bookkeeping: the per-process registry of file and folder moves
//!
//! The registry map has its own lock; each transfer carries a second lock for
//! its pause flag, status and byte counter so unrelated transfers never
//! contend on the map.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    File,
    Folder,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::File => f.write_str("File"),
            TransferKind::Folder => f.write_str("Folder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Active => "Active",
            TransferStatus::Paused => "Paused",
            TransferStatus::Completed => "Completed",
            TransferStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("no transfer with ID {0}")]
    NotFound(String),
    #[error("transfer {id} cannot go from {from} to {to}")]
    IllegalTransition {
        id: String,
        from: TransferStatus,
        to: TransferStatus,
    },
}

/// Mutable part of a transfer, guarded by the transfer's own lock.
#[derive(Debug)]
struct TransferState {
    status: TransferStatus,
    bytes_complete: u64,
    paused: bool,
}

#[derive(Debug)]
pub struct Transfer {
    pub id: String,
    pub kind: TransferKind,
    pub name: String,
    pub declared_size: u64,
    pub direction: Direction,
    pub peer_id: String,
    /// ID the other side used for this transfer, if it sent one.
    pub peer_transfer_id: String,
    pub local_path: PathBuf,
    pub checksum: String,
    pub started_at: DateTime<Utc>,
    state: Mutex<TransferState>,
    resumed: Notify,
}

/// Fields fixed when a transfer is created.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub kind: TransferKind,
    pub name: String,
    pub declared_size: u64,
    pub direction: Direction,
    pub peer_id: String,
    pub peer_transfer_id: String,
    pub local_path: PathBuf,
    pub checksum: String,
}

impl Transfer {
    pub fn new(id: String, spec: TransferSpec) -> Self {
        Self {
            id,
            kind: spec.kind,
            name: spec.name,
            declared_size: spec.declared_size,
            direction: spec.direction,
            peer_id: spec.peer_id,
            peer_transfer_id: spec.peer_transfer_id,
            local_path: spec.local_path,
            checksum: spec.checksum,
            started_at: Utc::now(),
            state: Mutex::new(TransferState {
                status: TransferStatus::Active,
                bytes_complete: 0,
                paused: false,
            }),
            resumed: Notify::new(),
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.state.lock().status
    }

    pub fn bytes_complete(&self) -> u64 {
        self.state.lock().bytes_complete
    }

    pub fn remaining(&self) -> u64 {
        self.declared_size - self.state.lock().bytes_complete
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Raw status write, no transition check.
    pub(crate) fn set_status(&self, status: TransferStatus) {
        self.state.lock().status = status;
    }

    /// Account `n` moved bytes, clamped to the declared size.
    /// Returns how many were actually counted.
    pub(crate) fn advance(&self, n: u64) -> u64 {
        let mut state = self.state.lock();
        let counted = n.min(self.declared_size - state.bytes_complete);
        state.bytes_complete += counted;
        counted
    }

    pub fn pause(&self) -> Result<(), TransferError> {
        let mut state = self.state.lock();
        if state.status != TransferStatus::Active {
            return Err(TransferError::IllegalTransition {
                id: self.id.clone(),
                from: state.status,
                to: TransferStatus::Paused,
            });
        }
        state.status = TransferStatus::Paused;
        state.paused = true;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), TransferError> {
        {
            let mut state = self.state.lock();
            if state.status != TransferStatus::Paused {
                return Err(TransferError::IllegalTransition {
                    id: self.id.clone(),
                    from: state.status,
                    to: TransferStatus::Active,
                });
            }
            state.status = TransferStatus::Active;
            state.paused = false;
        }
        self.resumed.notify_waiters();
        Ok(())
    }

    /// Move to a terminal state. Terminal states are absorbing.
    pub fn finish(&self, status: TransferStatus) -> Result<(), TransferError> {
        let mut state = self.state.lock();
        if state.status.is_terminal() || !status.is_terminal() {
            return Err(TransferError::IllegalTransition {
                id: self.id.clone(),
                from: state.status,
                to: status,
            });
        }
        state.status = status;
        state.paused = false;
        drop(state);
        self.resumed.notify_waiters();
        Ok(())
    }

    /// Resolves when the transfer is resumed (or finished).
    pub(crate) async fn wait_resumed(&self) {
        self.resumed.notified().await
    }

    /// Percentage complete, 100 for empty transfers.
    pub fn progress(&self) -> f64 {
        if self.declared_size == 0 {
            return 100.0;
        }
        self.bytes_complete() as f64 / self.declared_size as f64 * 100.0
    }
}

/// Concurrent map of transfer ID to transfer.
#[derive(Debug)]
pub struct TransferRegistry {
    transfers: Mutex<HashMap<String, Arc<Transfer>>>,
    next: AtomicU64,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self {
            transfers: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Next transfer ID; strictly increasing, never reused.
    pub fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::SeqCst).to_string()
    }

    pub fn register(&self, transfer: Transfer) -> Arc<Transfer> {
        let transfer = Arc::new(transfer);
        self.transfers
            .lock()
            .insert(transfer.id.clone(), Arc::clone(&transfer));
        transfer
    }

    /// Issue an ID and register in one step.
    pub fn start(&self, spec: TransferSpec) -> Arc<Transfer> {
        let id = self.next_id();
        self.register(Transfer::new(id, spec))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Transfer>> {
        self.transfers.lock().get(id).cloned()
    }

    pub fn update_status(&self, id: &str, status: TransferStatus) -> Result<(), TransferError> {
        let transfer = self
            .get(id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        transfer.set_status(status);
        Ok(())
    }

    pub fn pause(&self, id: &str) -> Result<Arc<Transfer>, TransferError> {
        let transfer = self
            .get(id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        transfer.pause()?;
        Ok(transfer)
    }

    pub fn resume(&self, id: &str) -> Result<Arc<Transfer>, TransferError> {
        let transfer = self
            .get(id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        transfer.resume()?;
        Ok(transfer)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Transfer>> {
        self.transfers.lock().remove(id)
    }

    /// Snapshot ordered by ID.
    pub fn list(&self) -> Vec<Arc<Transfer>> {
        let mut all: Vec<Arc<Transfer>> = self.transfers.lock().values().cloned().collect();
        all.sort_by_key(|t| t.id.parse::<u64>().unwrap_or(u64::MAX));
        all
    }
}

#[cfg(test)]
pub(crate) fn test_spec(size: u64) -> TransferSpec {
    TransferSpec {
        kind: TransferKind::File,
        name: "test.bin".into(),
        declared_size: size,
        direction: Direction::Receive,
        peer_id: "peer".into(),
        peer_transfer_id: String::new(),
        local_path: PathBuf::from("test.bin"),
        checksum: String::new(),
    }
}
