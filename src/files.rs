//! Client-side transfer operations: send, receive, lookup and download
//!
//! All outgoing bytes go through the connection's shared writer. A send
//! holds it for the request line plus the whole payload.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::archive;
use crate::checkpoint::{discard, pump_from, pump_into, CheckpointedReader, CheckpointedWriter};
use crate::checksum;
use crate::codec::{write_all_timed, Frame, SharedWriter, TransferTag};
use crate::logger::{NoopLogger, TransferLogger};
use crate::lookup;
use crate::paths;
use crate::progress::TransferProgress;
use crate::protocol::timeouts::WRITE_MS;
use crate::transfer::{Direction, Transfer, TransferKind, TransferRegistry, TransferSpec, TransferStatus};

/// What a receive ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOutcome {
    pub transfer_id: String,
    pub status: TransferStatus,
    /// `None` when the sender gave no checksum or it could not be computed.
    pub checksum_ok: Option<bool>,
    pub path: PathBuf,
}

pub struct ClientContext {
    transfers: Arc<TransferRegistry>,
    writer: SharedWriter,
    logger: Arc<dyn TransferLogger>,
    shared_root: Mutex<Option<PathBuf>>,
    show_progress: bool,
}

impl ClientContext {
    pub fn new(writer: SharedWriter, transfers: Arc<TransferRegistry>) -> Self {
        Self {
            transfers,
            writer,
            logger: Arc::new(NoopLogger),
            shared_root: Mutex::new(None),
            show_progress: false,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn transfers(&self) -> &Arc<TransferRegistry> {
        &self.transfers
    }

    pub fn writer(&self) -> &SharedWriter {
        &self.writer
    }

    pub fn set_shared_root(&self, root: PathBuf) {
        *self.shared_root.lock() = Some(root);
    }

    pub fn shared_root(&self) -> Option<PathBuf> {
        self.shared_root.lock().clone()
    }

    /// After a reconnect the client never typed its folder; the server tells
    /// us with every response and lookup.
    fn learn_shared_root(&self, path: &str) {
        let mut root = self.shared_root.lock();
        if root.is_none() && !path.is_empty() {
            debug!("shared folder is {}", path);
            *root = Some(PathBuf::from(path));
        }
    }

    fn progress_for(&self, transfer: &Transfer) -> TransferProgress {
        if self.show_progress {
            TransferProgress::new(transfer)
        } else {
            TransferProgress::hidden(transfer)
        }
    }

    /// Send one line (chat or control) on the shared writer.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut w = self.writer.lock().await;
        write_all_timed(&mut **w, format!("{}\n", line).as_bytes(), WRITE_MS).await
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut w = self.writer.lock().await;
        write_all_timed(&mut **w, frame.encode().as_bytes(), WRITE_MS).await
    }

    pub async fn send_file(&self, recipient_id: &str, path: &Path) -> Result<TransferStatus> {
        let name = paths::wire_name(path)?;
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        if !meta.is_file() {
            bail!("{} is not a file", path.display());
        }
        let digest = checksum::digest_file_async(path).await?;
        self.send_payload(TransferKind::File, recipient_id, name, path, meta.len(), digest)
            .await
    }

    pub async fn send_folder(&self, recipient_id: &str, path: &Path) -> Result<TransferStatus> {
        let name = paths::wire_name(path)?;
        if !path.is_dir() {
            bail!("{} is not a folder", path.display());
        }
        let source = path.to_path_buf();
        let (packed, file_count) = tokio::task::spawn_blocking(move || archive::pack_folder(&source))
            .await
            .context("archive task")??;
        let size = packed
            .as_file()
            .metadata()
            .context("stat archive")?
            .len();
        let digest = checksum::digest_file_async(packed.path()).await?;
        info!(
            "packed {} file(s) from {} ({} bytes)",
            file_count,
            path.display(),
            size
        );
        // `packed` deletes the archive when dropped, after the send
        self.send_payload(TransferKind::Folder, recipient_id, name, packed.path(), size, digest)
            .await
    }

    async fn send_payload(
        &self,
        kind: TransferKind,
        recipient_id: &str,
        name: String,
        source: &Path,
        size: u64,
        digest: String,
    ) -> Result<TransferStatus> {
        let transfer = self.transfers.start(TransferSpec {
            kind,
            name,
            declared_size: size,
            direction: Direction::Send,
            peer_id: recipient_id.to_string(),
            peer_transfer_id: String::new(),
            local_path: source.to_path_buf(),
            checksum: digest,
        });
        self.logger.started(&transfer);
        println!(
            "Sending {} '{}' to {} (transfer {})",
            kind.to_string().to_lowercase(),
            transfer.name,
            recipient_id,
            transfer.id
        );

        let progress = self.progress_for(&transfer);
        let result = async {
            let file = tokio::fs::File::open(source)
                .await
                .with_context(|| format!("open {}", source.display()))?;
            let mut reader = CheckpointedReader::new(file, Arc::clone(&transfer));
            let request = Frame::Request {
                kind,
                recipient_id: recipient_id.to_string(),
                tag: TransferTag::new(&transfer.name, &transfer.checksum, &transfer.id),
                size,
            };
            let mut out = self.writer.lock().await;
            let sent = async {
                write_all_timed(&mut **out, request.encode().as_bytes(), WRITE_MS).await?;
                pump_from(&mut reader, &mut **out, |done| progress.set(done)).await?;
                Ok::<(), anyhow::Error>(())
            }
            .await;
            if let Err(e) = sent {
                // The server now expects `size` bytes; anything we wrote
                // next would be relayed as payload
                if let Err(close) = out.shutdown().await {
                    debug!("closing connection after failed send: {}", close);
                }
                eprintln!("Connection closed: a partial send cannot be recovered");
                return Err(e);
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        let status = self.settle(&transfer, &progress, result);
        if status == TransferStatus::Completed {
            println!("{} '{}' sent (MD5 {})", kind, transfer.name, transfer.checksum);
        }
        Ok(status)
    }

    /// Record the end of a transfer and drop it from the registry.
    fn settle(&self, transfer: &Arc<Transfer>, progress: &TransferProgress, result: Result<()>) -> TransferStatus {
        let status = match result {
            Ok(()) => {
                self.logger.completed(transfer);
                progress.finish("done");
                TransferStatus::Completed
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                self.logger.failed(transfer, &msg);
                progress.abandon("failed");
                eprintln!("Transfer {} ({}) failed: {}", transfer.id, transfer.name, msg);
                TransferStatus::Failed
            }
        };
        if let Err(e) = transfer.finish(status) {
            debug!("{}", e);
        }
        self.transfers.remove(&transfer.id);
        status
    }

    /// Receive a payload announced by a FILE_RESPONSE or FOLDER_RESPONSE.
    ///
    /// Exactly `size` bytes are consumed from `input` whatever happens
    /// locally; only a failure of `input` itself is returned as an error.
    pub async fn receive<R>(
        &self,
        input: &mut R,
        kind: TransferKind,
        from_id: &str,
        tag: &TransferTag,
        size: u64,
        store_path: &str,
    ) -> Result<ReceiveOutcome>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.learn_shared_root(store_path);
        let store = PathBuf::from(store_path);
        let target = match kind {
            TransferKind::File => store.join(&tag.name),
            TransferKind::Folder => store.join(format!("{}.tar", tag.name)),
        };

        let transfer = self.transfers.start(TransferSpec {
            kind,
            name: tag.name.clone(),
            declared_size: size,
            direction: Direction::Receive,
            peer_id: from_id.to_string(),
            peer_transfer_id: tag.transfer_id.clone(),
            local_path: target.clone(),
            checksum: tag.checksum.clone(),
        });
        self.logger.started(&transfer);
        let progress = self.progress_for(&transfer);
        let mut limited = (&mut *input).take(size);

        let stored = async {
            if tag.name.is_empty() || paths::wire_name(Path::new(&tag.name))? != tag.name {
                bail!("refusing unsafe name {:?}", tag.name);
            }
            let file = tokio::fs::File::create(&target)
                .await
                .with_context(|| format!("create {}", target.display()))?;
            let mut writer = CheckpointedWriter::new(file, Arc::clone(&transfer));
            if let Err(e) = pump_into(&mut limited, &mut writer, |done| progress.set(done)).await {
                drop(writer);
                let _ = tokio::fs::remove_file(&target).await;
                return Err(anyhow::Error::new(e).context(format!("receive {}", tag.name)));
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        // Keep the stream framed: drop whatever part of the payload is left
        let left = limited.limit();
        if left > 0 {
            discard(&mut limited, left)
                .await
                .context("discard payload")?;
        }

        let mut checksum_ok = None;
        let result = match stored {
            Ok(()) => {
                checksum_ok = self.verify_received(&transfer, &target).await;
                match kind {
                    TransferKind::File => Ok(()),
                    TransferKind::Folder => self.extract(&target, &store.join(&tag.name)).await,
                }
            }
            Err(e) => Err(e),
        };

        let path = match kind {
            TransferKind::File => target,
            TransferKind::Folder => store.join(&tag.name),
        };
        let status = self.settle(&transfer, &progress, result);
        if status == TransferStatus::Completed {
            println!("{} '{}' received into {}", kind, tag.name, path.display());
        }
        Ok(ReceiveOutcome {
            transfer_id: transfer.id.clone(),
            status,
            checksum_ok,
            path,
        })
    }

    /// Compare the stored bytes with the sender's digest. Advisory only.
    async fn verify_received(&self, transfer: &Transfer, stored: &Path) -> Option<bool> {
        if transfer.checksum.is_empty() {
            return None;
        }
        match checksum::digest_file_async(stored).await {
            Ok(actual) if checksum::verify(&transfer.checksum, &actual) => {
                println!("Checksum verified for '{}'", transfer.name);
                Some(true)
            }
            Ok(actual) => {
                self.logger.checksum_mismatch(transfer, &transfer.checksum, &actual);
                eprintln!(
                    "Warning: checksum mismatch for '{}' (expected {}, got {})",
                    transfer.name, transfer.checksum, actual
                );
                Some(false)
            }
            Err(e) => {
                warn!("checksum of {} failed: {:#}", stored.display(), e);
                None
            }
        }
    }

    async fn extract(&self, archive_path: &Path, dest: &Path) -> Result<()> {
        let archive_path = archive_path.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let result = archive::unpack_folder(&archive_path, &dest);
            let _ = std::fs::remove_file(&archive_path);
            result
        })
        .await
        .context("extract task")?
    }

    /// Answer a LOOK_REQUEST with the listing of `storage_path`.
    pub async fn answer_lookup(&self, requester_id: &str, storage_path: &str) -> Result<()> {
        self.learn_shared_root(storage_path);
        let root = PathBuf::from(storage_path);
        let listing = match tokio::task::spawn_blocking(move || lookup::list_directory(&root)).await {
            Ok(Ok(listing)) => listing,
            Ok(Err(e)) => vec![format!("Error: {:#}", e)],
            Err(e) => vec![format!("Error: {}", e)],
        };
        self.send_frame(&Frame::LookResponse {
            user_id: requester_id.to_string(),
            listing,
        })
        .await
    }

    /// Serve a DOWNLOAD_REQUEST from the shared folder.
    pub async fn answer_download(&self, requester_id: &str, file_path: &str) -> Result<TransferStatus> {
        let root = self
            .shared_root()
            .ok_or_else(|| anyhow!("no shared folder known yet"))?;
        let resolved = paths::confine(&root, Path::new(file_path.trim()))?;
        if resolved.is_dir() {
            self.send_folder(requester_id, &resolved).await
        } else {
            self.send_file(requester_id, &resolved).await
        }
    }
}
