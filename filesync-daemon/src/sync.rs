//! Sync-phase message handling shared by client and server sessions.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use filesync_core::codec::Message;
use filesync_core::protocol::{GetFile, SyncEvent};
use filesync_core::UserId;
use filesync_engine::{Applied, Engine};

use crate::error::{DaemonError, Fault};
use crate::messenger::Messenger;
use crate::transfer::{send_file, InboundTransfers, Received};

const UPLOAD_QUEUE: usize = 256;

/// Transfer settings of one party.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub staging: PathBuf,
    pub chunk_size: usize,
    pub max_file_size: u64,
}

/// Applies the peer's sync messages for one connection.
///
/// Outbound file requests are served by a dedicated uploader task so a
/// large upload never stalls the connection's read loop, while the parts
/// of one file still go out contiguously.
pub struct SyncHandler {
    engine: Arc<Engine>,
    messenger: Messenger,
    owner: UserId,
    inbound: InboundTransfers,
    uploads: mpsc::Sender<GetFile>,
    uploader: JoinHandle<()>,
}

impl SyncHandler {
    pub fn new(
        engine: Arc<Engine>,
        messenger: Messenger,
        owner: UserId,
        settings: &TransferSettings,
    ) -> Self {
        let (uploads, requests) = mpsc::channel(UPLOAD_QUEUE);
        let uploader = tokio::spawn(upload_task(
            engine.clone(),
            messenger.clone(),
            owner,
            settings.chunk_size,
            requests,
        ));
        Self {
            engine,
            messenger,
            owner,
            inbound: InboundTransfers::new(&settings.staging, settings.max_file_size),
            uploads,
            uploader,
        }
    }

    /// Handle one sync-phase message. Errors are reported to the peer here;
    /// the returned error only tells the caller whom to charge.
    pub async fn handle(&mut self, message: Message) -> Result<(), DaemonError> {
        let result = match message {
            Message::SyncEvent(event) => self.on_sync_event(event).await,
            Message::GetFile(request) => self
                .uploads
                .send(request)
                .await
                .map_err(|_| DaemonError::ChannelClosed("upload queue")),
            Message::SendFile(meta) => self.inbound.begin(meta).await,
            Message::FilePart(part) => self.inbound.append(&part).await,
            Message::FileEnd(end) => match self.inbound.finish(&end).await {
                Ok(Some(received)) => self.on_received(received).await,
                Ok(None) => self.request_next().await,
                Err(err @ DaemonError::Unsolicited(_)) => Err(err),
                Err(err) => {
                    // The transfer is over even though it failed.
                    self.request_next().await?;
                    Err(err)
                }
            },
            other => Err(DaemonError::Unexpected {
                kind: other.kind(),
                stage: "syncing".to_string(),
            }),
        };

        let Err(err) = result else {
            return Ok(());
        };
        if err.ends_connection() {
            return Err(err);
        }
        match err.fault() {
            Fault::Local => tracing::error!(error = %err, owner = %self.owner, "sync failure"),
            Fault::Peer => tracing::warn!(error = %err, owner = %self.owner, "peer sync error"),
            Fault::Neither => tracing::info!(error = %err, owner = %self.owner, "sync conflict"),
        }
        self.messenger.send_error(&err).await?;
        Err(err)
    }

    pub fn pending_transfers(&self) -> usize {
        self.inbound.queued() + usize::from(self.inbound.in_flight().is_some())
    }

    async fn on_sync_event(&mut self, event: SyncEvent) -> Result<(), DaemonError> {
        tracing::info!(
            action = %event.action,
            kind = %event.object_kind,
            name = %event.name,
            owner = %self.owner,
            "remote change",
        );
        let engine = self.engine.clone();
        let owner = self.owner;
        let applied = tokio::task::spawn_blocking(move || engine.apply_remote(&event, owner))
            .await
            .map_err(|err| DaemonError::Protocol(format!("apply join error: {err}")))??;
        if let Applied::Fetch(request) = applied {
            if let Some(next) = self.inbound.enqueue(request) {
                self.messenger.send(Message::GetFile(next)).await?;
            }
        }
        Ok(())
    }

    async fn on_received(&mut self, received: Received) -> Result<(), DaemonError> {
        let engine = self.engine.clone();
        let owner = self.owner;
        let Received { staged, meta } = received;
        let placed = tokio::task::spawn_blocking(move || engine.finish_transfer(&staged, &meta, owner))
            .await
            .map_err(|err| DaemonError::Protocol(format!("finish join error: {err}")))?;
        // The next request goes out even when placing this file failed.
        self.request_next().await?;
        placed?;
        Ok(())
    }

    async fn request_next(&mut self) -> Result<(), DaemonError> {
        if let Some(next) = self.inbound.advance() {
            self.messenger.send(Message::GetFile(next)).await?;
        }
        Ok(())
    }
}

impl Drop for SyncHandler {
    fn drop(&mut self) {
        self.uploader.abort();
    }
}

async fn upload_task(
    engine: Arc<Engine>,
    messenger: Messenger,
    owner: UserId,
    chunk_size: usize,
    mut requests: mpsc::Receiver<GetFile>,
) {
    while let Some(request) = requests.recv().await {
        let name = request.name.clone();
        match send_file(&messenger, engine.clone(), request, owner, chunk_size).await {
            Ok(bytes) => tracing::debug!(name = %name, bytes, owner = %owner, "upload finished"),
            Err(err) if err.ends_connection() => break,
            Err(err) => tracing::warn!(name = %name, error = %err, "upload failed"),
        }
    }
}
