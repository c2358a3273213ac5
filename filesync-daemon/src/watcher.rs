//! OS notifier adapter and the task feeding its events to the engine.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::event::{ModifyKind, RenameMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};

use filesync_engine::{DirWatcher, Engine, FsEvent, FsOp, OutgoingEvent};

use crate::error::DaemonError;

pub type RawEvents = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Non-recursive notifier shared with the engine. Every directory is
/// registered on its own as the engine discovers it.
pub struct FsWatcher {
    inner: Mutex<Option<RecommendedWatcher>>,
    watched: Mutex<HashSet<PathBuf>>,
}

impl FsWatcher {
    pub fn start() -> Result<(Arc<Self>, RawEvents), DaemonError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let watcher = recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })?;
        let this = Self {
            inner: Mutex::new(Some(watcher)),
            watched: Mutex::new(HashSet::new()),
        };
        Ok((Arc::new(this), event_rx))
    }

    /// A removed directory stops being watched by the OS on its own; drop it
    /// from the set so a later directory with the same name is registered.
    pub fn forget(&self, path: &Path) {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        watched.retain(|dir| !dir.starts_with(path));
    }

    /// Stop the notifier. The raw event channel closes once the notifier's
    /// thread is gone, which ends the reconcile task.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.take().is_some() {
            tracing::info!("filesystem watcher closed");
        }
    }

    pub fn watched_count(&self) -> usize {
        self.watched.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl DirWatcher for FsWatcher {
    fn watch_dir(&self, dir: &Path) -> Result<(), String> {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        if watched.contains(dir) {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(watcher) = inner.as_mut() else {
            return Ok(());
        };
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| e.to_string())?;
        watched.insert(dir.to_path_buf());
        tracing::debug!(path = %dir.display(), "watching directory");
        Ok(())
    }
}

/// Map one notifier event to engine events.
///
/// Rename halves are split: the old name becomes [`FsOp::Rename`], the new
/// one [`FsOp::Create`]. Metadata and access changes carry no content and
/// are dropped.
pub fn translate(event: &Event) -> Vec<FsEvent> {
    let each = |op: FsOp| -> Vec<FsEvent> {
        event.paths.iter().map(|p| FsEvent::new(p, op)).collect()
    };
    match &event.kind {
        EventKind::Create(_) => each(FsOp::Create),
        EventKind::Remove(_) => each(FsOp::Remove),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => each(FsOp::Rename),
            RenameMode::To => each(FsOp::Create),
            RenameMode::Both => match event.paths.as_slice() {
                [from, to] => vec![FsEvent::new(from, FsOp::Rename), FsEvent::new(to, FsOp::Create)],
                _ => Vec::new(),
            },
            // Backends that cannot tell the halves apart: whichever path
            // still exists is the new name.
            RenameMode::Any | RenameMode::Other => event
                .paths
                .iter()
                .map(|p| {
                    let op = if fs::symlink_metadata(p).is_ok() {
                        FsOp::Create
                    } else {
                        FsOp::Rename
                    };
                    FsEvent::new(p, op)
                })
                .collect(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => each(FsOp::Write),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Consume notifier events, reconcile them one at a time and queue the
/// resulting sync events for delivery.
pub async fn reconcile_task(
    engine: Arc<Engine>,
    watcher: Arc<FsWatcher>,
    mut raw: RawEvents,
    outgoing: mpsc::Sender<OutgoingEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = raw.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };

                for fs_event in translate(&event) {
                    if fs_event.op == FsOp::Remove {
                        watcher.forget(&fs_event.path);
                    }
                    let engine = engine.clone();
                    let path = fs_event.path.clone();
                    let result = tokio::task::spawn_blocking(move || engine.process_local(&fs_event))
                        .await
                        .map_err(|err| DaemonError::Protocol(format!("reconcile join error: {err}")))?;
                    let events = match result {
                        Ok(events) => events,
                        Err(err) => {
                            tracing::warn!(path = %path.display(), error = %err, "local change not reconciled");
                            continue;
                        }
                    };
                    for out in events {
                        tracing::info!(
                            action = %out.event.action,
                            kind = %out.event.object_kind,
                            name = %out.event.name,
                            owner = %out.owner,
                            "local change",
                        );
                        if outgoing.send(out).await.is_err() {
                            return Err(DaemonError::ChannelClosed("outgoing sync events"));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use tempfile::TempDir;

    use filesync_core::MemoryCatalog;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn translate_maps_content_events() {
        let created = translate(&event(EventKind::Create(CreateKind::File), &["/r/a"]));
        assert_eq!(created, vec![FsEvent::new("/r/a", FsOp::Create)]);

        let written = translate(&event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/r/a"],
        ));
        assert_eq!(written, vec![FsEvent::new("/r/a", FsOp::Write)]);

        let removed = translate(&event(EventKind::Remove(RemoveKind::Any), &["/r/a"]));
        assert_eq!(removed, vec![FsEvent::new("/r/a", FsOp::Remove)]);
    }

    #[test]
    fn translate_splits_renames() {
        let both = translate(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/r/old", "/r/new"],
        ));
        assert_eq!(
            both,
            vec![
                FsEvent::new("/r/old", FsOp::Rename),
                FsEvent::new("/r/new", FsOp::Create),
            ]
        );

        let from = translate(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/r/old"],
        ));
        assert_eq!(from, vec![FsEvent::new("/r/old", FsOp::Rename)]);
    }

    #[test]
    fn translate_drops_metadata_and_access() {
        assert!(translate(&event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)),
            &["/r/a"],
        ))
        .is_empty());
        assert!(translate(&event(EventKind::Any, &["/r/a"])).is_empty());
    }

    #[test]
    fn watcher_registers_each_directory_once() {
        let tmp = TempDir::new().expect("tempdir");
        let (watcher, _events) = FsWatcher::start().expect("start watcher");
        watcher.watch_dir(tmp.path()).expect("watch");
        watcher.watch_dir(tmp.path()).expect("watch again");
        assert_eq!(watcher.watched_count(), 1);

        watcher.forget(tmp.path());
        assert_eq!(watcher.watched_count(), 0);
        watcher.close();
        // A closed watcher accepts registrations without doing anything.
        watcher.watch_dir(tmp.path()).expect("after close");
        assert_eq!(watcher.watched_count(), 0);
    }

    #[tokio::test]
    async fn reconcile_task_forwards_engine_output() {
        let tmp = TempDir::new().expect("tempdir");
        let (watcher, _unused) = FsWatcher::start().expect("start watcher");
        let engine = Arc::new(Engine::new(tmp.path(), Arc::new(MemoryCatalog::new())));
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let file = tmp.path().join("a.txt");
        std::fs::write(&file, b"alpha").expect("write");
        raw_tx
            .send(Ok(event(EventKind::Create(CreateKind::File), &[file.to_str().expect("utf8")])))
            .expect("send raw");
        drop(raw_tx);

        reconcile_task(engine, watcher, raw_rx, out_tx, shutdown_tx.subscribe())
            .await
            .expect("task");
        let out = out_rx.recv().await.expect("outgoing");
        assert_eq!(out.event.name, "a.txt");
        assert!(out_rx.recv().await.is_none());
    }
}
