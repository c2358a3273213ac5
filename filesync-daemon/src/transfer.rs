//! Network side of file transfer.
//!
//! Responder: `SendFile` metadata, then `FileParts` of exactly `chunk_size`
//! bytes (the last one shorter), then `FileEnd`. A responder that cannot
//! serve a request answers with an `Error` followed by a bare `FileEnd`,
//! so the requester can move on.
//!
//! Requester: one request in flight per connection. Parts are appended to
//! a staging file that is deleted unless the transfer completes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use filesync_core::codec::Message;
use filesync_core::protocol::{FileEnd, FileMeta, FilePart, GetFile, MessageKind};
use filesync_core::UserId;
use filesync_engine::Engine;

use crate::error::{io_err, DaemonError};
use crate::messenger::Messenger;

/// Stream one requested file to the peer. The closing `FileEnd` is sent
/// even when streaming fails, so the requester never waits forever.
pub async fn send_file(
    messenger: &Messenger,
    engine: Arc<Engine>,
    request: GetFile,
    owner: UserId,
    chunk_size: usize,
) -> Result<u64, DaemonError> {
    let end = FileEnd {
        name: request.name.clone(),
        path: request.path.clone(),
    };
    let result = stream_file(messenger, engine, request, owner, chunk_size).await;
    if let Err(err) = &result {
        if err.ends_connection() {
            return result;
        }
        messenger.send_error(err).await?;
    }
    messenger.send(Message::FileEnd(end)).await?;
    result
}

async fn stream_file(
    messenger: &Messenger,
    engine: Arc<Engine>,
    request: GetFile,
    owner: UserId,
    chunk_size: usize,
) -> Result<u64, DaemonError> {
    let (path, meta) = tokio::task::spawn_blocking(move || engine.describe_request(&request, owner))
        .await
        .map_err(|err| DaemonError::Protocol(format!("describe join error: {err}")))??;

    let mut file = File::open(&path).await.map_err(|e| io_err(&path, e))?;
    messenger.send(Message::SendFile(meta)).await?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut sent = 0u64;
    loop {
        let filled = read_chunk(&mut file, &mut buf, &path).await?;
        if filled == 0 {
            break;
        }
        messenger
            .send(Message::FilePart(FilePart {
                data: buf[..filled].to_vec(),
            }))
            .await?;
        sent += filled as u64;
        if filled < buf.len() {
            break;
        }
    }
    tracing::debug!(path = %path.display(), bytes = sent, "file sent");
    Ok(sent)
}

/// Fill `buf` unless the file ends first.
async fn read_chunk(file: &mut File, buf: &mut [u8], path: &Path) -> Result<usize, DaemonError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file
            .read(&mut buf[filled..])
            .await
            .map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A staging file being filled. Deleted on drop unless handed over.
struct Staged {
    path: PathBuf,
    file: Option<File>,
    meta: FileMeta,
    written: u64,
    keep: bool,
}

impl Drop for Staged {
    fn drop(&mut self) {
        drop(self.file.take());
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A completed transfer ready for [`Engine::finish_transfer`].
#[derive(Debug)]
pub struct Received {
    pub staged: PathBuf,
    pub meta: FileMeta,
}

/// Requester-side transfer queue of one connection.
///
/// A refused or broken transfer stays in flight as draining: its remaining
/// parts are discarded and its `FileEnd` releases the next request.
pub struct InboundTransfers {
    staging: PathBuf,
    max_file_size: u64,
    queue: VecDeque<GetFile>,
    requested: Option<GetFile>,
    receiving: Option<Staged>,
    draining: bool,
}

impl InboundTransfers {
    pub fn new(staging: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            staging: staging.into(),
            max_file_size,
            queue: VecDeque::new(),
            requested: None,
            receiving: None,
            draining: false,
        }
    }

    /// Queue a fetch. Returns the request to send now, if the connection
    /// has nothing in flight. Repeated requests for the same object replace
    /// the queued one.
    pub fn enqueue(&mut self, request: GetFile) -> Option<GetFile> {
        if let Some(queued) = self
            .queue
            .iter_mut()
            .find(|q| q.same_object(&request.name, &request.path))
        {
            *queued = request;
            return None;
        }
        self.queue.push_back(request);
        self.advance()
    }

    pub fn in_flight(&self) -> Option<&GetFile> {
        self.requested.as_ref()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Open the staging file for the announced file.
    pub async fn begin(&mut self, meta: FileMeta) -> Result<(), DaemonError> {
        let matches = self
            .requested
            .as_ref()
            .is_some_and(|r| r.same_object(&meta.name, &meta.path));
        if !matches || self.receiving.is_some() || self.draining {
            return Err(DaemonError::Unsolicited(MessageKind::SendFile));
        }
        if self.max_file_size > 0 && meta.size > self.max_file_size {
            self.draining = true;
            return Err(DaemonError::FileTooLarge {
                size: meta.size,
                limit: self.max_file_size,
            });
        }

        match self.open_staging(meta).await {
            Ok(staged) => {
                self.receiving = Some(staged);
                Ok(())
            }
            Err(err) => {
                self.draining = true;
                Err(err)
            }
        }
    }

    async fn open_staging(&self, meta: FileMeta) -> Result<Staged, DaemonError> {
        tokio::fs::create_dir_all(&self.staging)
            .await
            .map_err(|e| io_err(&self.staging, e))?;
        let path = self.staging.join(format!("{}.part", Uuid::new_v4()));
        let file = File::create(&path).await.map_err(|e| io_err(&path, e))?;
        Ok(Staged {
            path,
            file: Some(file),
            meta,
            written: 0,
            keep: false,
        })
    }

    pub async fn append(&mut self, part: &FilePart) -> Result<(), DaemonError> {
        if self.draining {
            return Ok(());
        }
        let Some(staged) = self.receiving.as_mut() else {
            return Err(DaemonError::Unsolicited(MessageKind::FileParts));
        };
        staged.written += part.data.len() as u64;
        let result = if staged.written > staged.meta.size {
            Err(DaemonError::Protocol(
                "file parts exceed the announced size".to_string(),
            ))
        } else if let Some(file) = staged.file.as_mut() {
            file.write_all(&part.data)
                .await
                .map_err(|e| io_err(&staged.path, e))
        } else {
            Ok(())
        };
        if result.is_err() {
            self.drain();
        }
        result
    }

    /// Close the transfer named by `end`. `Ok(None)` means no file came
    /// through: the peer could not provide it or it was refused here.
    pub async fn finish(&mut self, end: &FileEnd) -> Result<Option<Received>, DaemonError> {
        let requested = self
            .requested
            .as_ref()
            .is_some_and(|r| r.same_object(&end.name, &end.path));
        if !requested {
            return Err(DaemonError::Unsolicited(MessageKind::FileEnd));
        }
        self.requested = None;

        if std::mem::take(&mut self.draining) {
            tracing::debug!(name = %end.name, "refused transfer drained");
            return Ok(None);
        }
        let Some(mut staged) = self.receiving.take() else {
            tracing::info!(name = %end.name, "peer could not provide requested file");
            return Ok(None);
        };
        if let Some(mut file) = staged.file.take() {
            file.flush().await.map_err(|e| io_err(&staged.path, e))?;
            file.sync_all().await.map_err(|e| io_err(&staged.path, e))?;
        }
        if staged.written != staged.meta.size {
            return Err(DaemonError::Protocol(format!(
                "received {} of {} announced bytes",
                staged.written, staged.meta.size
            )));
        }
        staged.keep = true;
        Ok(Some(Received {
            staged: staged.path.clone(),
            meta: staged.meta.clone(),
        }))
    }

    /// Discard the staged data of the transfer in flight and ignore its
    /// remaining parts.
    fn drain(&mut self) {
        self.receiving = None;
        self.draining = self.requested.is_some();
    }

    /// The next request to send, if nothing is in flight.
    pub fn advance(&mut self) -> Option<GetFile> {
        if self.requested.is_some() {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.requested = Some(next.clone());
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn request(name: &str) -> GetFile {
        GetFile {
            name: name.to_string(),
            path: "%ROOT_DIR%".to_string(),
            hash: "h".to_string(),
            updated_at: Utc::now(),
        }
    }

    fn meta(name: &str, size: u64) -> FileMeta {
        FileMeta {
            name: name.to_string(),
            path: "%ROOT_DIR%".to_string(),
            hash: "h".to_string(),
            size,
            updated_at: Utc::now(),
            ext: String::new(),
        }
    }

    fn end(name: &str) -> FileEnd {
        FileEnd {
            name: name.to_string(),
            path: "%ROOT_DIR%".to_string(),
        }
    }

    #[test]
    fn one_request_in_flight_and_duplicates_coalesce() {
        let tmp = TempDir::new().expect("tempdir");
        let mut transfers = InboundTransfers::new(tmp.path(), 0);

        assert_eq!(transfers.enqueue(request("a")).map(|r| r.name), Some("a".into()));
        assert!(transfers.enqueue(request("b")).is_none());
        assert!(transfers.enqueue(request("b")).is_none());
        assert_eq!(transfers.queued(), 1);
        assert_eq!(transfers.in_flight().map(|r| r.name.as_str()), Some("a"));
    }

    #[tokio::test]
    async fn completed_transfer_keeps_staged_file() {
        let tmp = TempDir::new().expect("tempdir");
        let mut transfers = InboundTransfers::new(tmp.path(), 0);
        transfers.enqueue(request("a"));

        transfers.begin(meta("a", 5)).await.expect("begin");
        transfers
            .append(&FilePart { data: b"hel".to_vec() })
            .await
            .expect("part");
        transfers
            .append(&FilePart { data: b"lo".to_vec() })
            .await
            .expect("part");
        let received = transfers.finish(&end("a")).await.expect("finish").expect("file");

        assert_eq!(std::fs::read(&received.staged).expect("read"), b"hello");
        assert!(transfers.in_flight().is_none());
    }

    #[tokio::test]
    async fn unsolicited_send_file_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let mut transfers = InboundTransfers::new(tmp.path(), 0);
        let err = transfers.begin(meta("a", 1)).await.unwrap_err();
        assert!(matches!(err, DaemonError::Unsolicited(MessageKind::SendFile)));

        transfers.enqueue(request("a"));
        let err = transfers.begin(meta("other", 1)).await.unwrap_err();
        assert!(matches!(err, DaemonError::Unsolicited(_)));
    }

    #[tokio::test]
    async fn overlong_parts_drain_until_file_end() {
        let tmp = TempDir::new().expect("tempdir");
        let mut transfers = InboundTransfers::new(tmp.path(), 0);
        transfers.enqueue(request("a"));
        transfers.enqueue(request("b"));
        transfers.begin(meta("a", 3)).await.expect("begin");

        let err = transfers
            .append(&FilePart { data: b"part".to_vec() })
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(_)));
        assert_eq!(std::fs::read_dir(tmp.path()).expect("read dir").count(), 0);

        transfers
            .append(&FilePart { data: b"more".to_vec() })
            .await
            .expect("discarded");
        assert!(transfers.is_draining());
        assert!(transfers.finish(&end("a")).await.expect("finish").is_none());
        assert_eq!(transfers.advance().map(|r| r.name), Some("b".into()));
    }

    #[tokio::test]
    async fn stray_file_end_leaves_the_request_in_flight() {
        let tmp = TempDir::new().expect("tempdir");
        let mut transfers = InboundTransfers::new(tmp.path(), 0);
        transfers.enqueue(request("a"));

        let err = transfers.finish(&end("other")).await.unwrap_err();
        assert!(matches!(err, DaemonError::Unsolicited(MessageKind::FileEnd)));
        assert_eq!(transfers.in_flight().map(|r| r.name.as_str()), Some("a"));
    }

    #[tokio::test]
    async fn oversized_file_is_refused() {
        let tmp = TempDir::new().expect("tempdir");
        let mut transfers = InboundTransfers::new(tmp.path(), 4);
        transfers.enqueue(request("a"));
        transfers.enqueue(request("b"));
        let err = transfers.begin(meta("a", 5)).await.unwrap_err();
        assert!(matches!(err, DaemonError::FileTooLarge { size: 5, limit: 4 }));

        transfers
            .append(&FilePart { data: b"hello".to_vec() })
            .await
            .expect("discarded");
        assert!(transfers.advance().is_none());
        assert!(transfers.finish(&end("a")).await.expect("finish").is_none());
        assert_eq!(transfers.advance().map(|r| r.name), Some("b".into()));
    }

    #[tokio::test]
    async fn bare_file_end_means_unavailable() {
        let tmp = TempDir::new().expect("tempdir");
        let mut transfers = InboundTransfers::new(tmp.path(), 0);
        transfers.enqueue(request("a"));
        transfers.enqueue(request("b"));

        assert!(transfers.finish(&end("a")).await.expect("finish").is_none());
        assert_eq!(transfers.advance().map(|r| r.name), Some("b".into()));
    }
}
