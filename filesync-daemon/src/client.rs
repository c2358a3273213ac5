//! Client side: session establishment, the sync loop and reconnects.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use filesync_core::codec::{self, Message};
use filesync_core::config::{validate_root, ClientConfig};
use filesync_core::protocol::{Auth, Handshake, Hello, Intent, Limits, StartSync};
use filesync_core::{CatalogStore, JsonCatalog, UserId, Versioning};
use filesync_engine::{Engine, OutgoingEvent};

use crate::error::{io_err, DaemonError};
use crate::framing::FrameReader;
use crate::messenger::Messenger;
use crate::runtime::{handle_join, signal_task};
use crate::sync::{SyncHandler, TransferSettings};
use crate::watcher::{reconcile_task, FsWatcher};

const OUTGOING_QUEUE: usize = 256;

/// What the server told us while the session was being set up.
#[derive(Debug, Clone)]
pub struct Established {
    pub server: Handshake,
    pub token: String,
    pub session_key: String,
}

/// Why a connected session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Hello, Auth and StartSync, each answered within the handshake timeout.
pub async fn establish<R: AsyncRead + Unpin>(
    frames: &mut FrameReader<R>,
    messenger: &Messenger,
    config: &ClientConfig,
    versioning: Versioning,
    session_key: Option<String>,
) -> Result<Established, DaemonError> {
    let timeout = config.handshake_timeout();

    messenger
        .send(Message::Hello(Hello {
            intent: Intent::Client,
            party_name: config.party_name.clone(),
            app_version: versioning.app,
            protocol_version: versioning.protocol,
            owner_contacts: String::new(),
            limits: Limits {
                max_file_size: config.max_file_size,
                max_message_size: config.max_message_size as u64,
                ..Limits::default()
            },
        }))
        .await?;
    let server = match await_reply(frames, timeout, "handshake").await? {
        Message::Handshake(handshake) => handshake,
        other => return Err(unexpected(other, "waiting for handshake")),
    };
    if let Err(code) = versioning.check_peer(server.app_version, server.protocol_version) {
        messenger.send(Message::CloseConnection).await?;
        return Err(DaemonError::Rejected {
            code,
            explained: format!("server runs {}", server.app_version),
        });
    }
    tracing::info!(server = %server.party_name, version = %server.app_version, "handshake complete");

    messenger
        .send(Message::Auth(Auth {
            login: config.login.clone(),
            password: config.password.clone(),
            device_name: config.device_name.clone(),
            session_key,
        }))
        .await?;
    let issued = match await_reply(frames, timeout, "token").await? {
        Message::Token(token) => token,
        other => return Err(unexpected(other, "waiting for token")),
    };
    messenger.set_token(&issued.token);

    messenger
        .send(Message::StartSync(StartSync {
            token: issued.token.clone(),
        }))
        .await?;
    match await_reply(frames, timeout, "sync start").await? {
        Message::Ok(_) => {}
        other => return Err(unexpected(other, "waiting for sync start")),
    }

    Ok(Established {
        server,
        token: issued.token,
        session_key: issued.session_key,
    })
}

/// Next meaningful reply. Error payloads become [`DaemonError::Rejected`];
/// warnings are logged and skipped.
async fn await_reply<R: AsyncRead + Unpin>(
    frames: &mut FrameReader<R>,
    timeout: Duration,
    what: &'static str,
) -> Result<Message, DaemonError> {
    loop {
        let line = tokio::time::timeout(timeout, frames.next_frame())
            .await
            .map_err(|_| DaemonError::Timeout(what))??
            .ok_or(DaemonError::PeerClosed)?;
        match codec::decode(&line)?.message {
            Message::Error(payload) => {
                return Err(DaemonError::Rejected {
                    code: payload.code,
                    explained: payload.explained,
                })
            }
            Message::Warning(warning) => {
                tracing::info!(code = ?warning.code, explained = %warning.explained, "server warning");
            }
            Message::ConnectionEnd | Message::CloseConnection => return Err(DaemonError::PeerClosed),
            message => return Ok(message),
        }
    }
}

fn unexpected(message: Message, stage: &str) -> DaemonError {
    DaemonError::Unexpected {
        kind: message.kind(),
        stage: stage.to_string(),
    }
}

/// Forward local changes and apply the server's until the session ends.
pub async fn run_sync<R: AsyncRead + Unpin>(
    frames: &mut FrameReader<R>,
    messenger: &Messenger,
    handler: &mut SyncHandler,
    outgoing: &mut mpsc::Receiver<OutgoingEvent>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<SessionEnd, DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                messenger.send(Message::ConnectionEnd).await?;
                return Ok(SessionEnd::Shutdown);
            }
            out = outgoing.recv() => {
                let Some(out) = out else { return Ok(SessionEnd::Shutdown) };
                messenger.send(Message::SyncEvent(out.event)).await?;
            }
            read = frames.next_frame() => {
                let line = match read {
                    Ok(Some(line)) => line,
                    Ok(None) => return Ok(SessionEnd::Disconnected),
                    Err(err) if err.ends_connection() => return Err(err),
                    Err(err) => {
                        messenger.send_error(&err).await?;
                        continue;
                    }
                };
                let message = match codec::decode(&line) {
                    Ok(envelope) => envelope.message,
                    Err(err) => {
                        messenger.send_error(&err.into()).await?;
                        continue;
                    }
                };
                match message {
                    Message::SyncEvent(_)
                    | Message::GetFile(_)
                    | Message::SendFile(_)
                    | Message::FilePart(_)
                    | Message::FileEnd(_) => match handler.handle(message).await {
                        Err(err) if err.ends_connection() => return Err(err),
                        _ => {}
                    },
                    Message::Error(payload) if payload.code.is_sync_breaking() => {
                        return Err(DaemonError::Rejected {
                            code: payload.code,
                            explained: payload.explained,
                        });
                    }
                    Message::Error(payload) => {
                        tracing::warn!(code = ?payload.code, explained = %payload.explained, "server reported an error");
                    }
                    Message::Warning(warning) => {
                        tracing::info!(code = ?warning.code, explained = %warning.explained, "server warning");
                    }
                    Message::ConnectionEnd | Message::CloseConnection => {
                        tracing::info!("server ended the session");
                        return Ok(SessionEnd::Disconnected);
                    }
                    Message::Ok(ok) => tracing::debug!(text = %ok.human_readable, "server ok"),
                    other => {
                        messenger.send_error(&unexpected(other, "syncing")).await?;
                    }
                }
            }
        }
    }
}

/// Everything one connection attempt needs.
pub struct ClientContext {
    pub config: ClientConfig,
    pub versioning: Versioning,
    pub engine: Arc<Engine>,
    pub transfer: TransferSettings,
}

/// Connect, establish and sync over one transport.
pub async fn run_session<R, W>(
    ctx: &ClientContext,
    reader: R,
    writer: W,
    outgoing: &mut mpsc::Receiver<OutgoingEvent>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<SessionEnd, DaemonError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (messenger, writer_task) = Messenger::spawn(writer);
    let mut frames = FrameReader::new(reader, ctx.config.max_message_size);

    let result = sync_session(ctx, &mut frames, &messenger, outgoing, shutdown_rx).await;

    let stats = messenger.stats();
    tracing::info!(
        bytes_received = frames.bytes_read(),
        bytes_sent = stats.bytes_sent(),
        client_errors = stats.client_errors(),
        server_errors = stats.server_errors(),
        "connection closed",
    );
    drop(messenger);
    let _ = tokio::time::timeout(Duration::from_secs(5), writer_task).await;
    result
}

async fn sync_session<R: AsyncRead + Unpin>(
    ctx: &ClientContext,
    frames: &mut FrameReader<R>,
    messenger: &Messenger,
    outgoing: &mut mpsc::Receiver<OutgoingEvent>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<SessionEnd, DaemonError> {
    let key_file = &ctx.config.session_key_file;
    let handshake = establish(
        frames,
        messenger,
        &ctx.config,
        ctx.versioning,
        load_session_key(key_file),
    );
    let established = tokio::select! {
        _ = shutdown_rx.recv() => return Ok(SessionEnd::Shutdown),
        established = handshake => established?,
    };
    save_session_key(key_file, &established.session_key)?;
    tracing::info!(server = %established.server.party_name, "sync started");

    let mut handler = SyncHandler::new(
        ctx.engine.clone(),
        messenger.clone(),
        UserId::NONE,
        &ctx.transfer,
    );
    run_sync(frames, messenger, &mut handler, outgoing, shutdown_rx).await
}

fn load_session_key(path: &Path) -> Option<String> {
    if path.as_os_str().is_empty() {
        return None;
    }
    let key = fs::read_to_string(path).ok()?;
    let key = key.trim();
    (!key.is_empty()).then(|| key.to_string())
}

fn save_session_key(path: &Path, key: &str) -> Result<(), DaemonError> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    fs::write(path, key).map_err(|e| io_err(path, e))
}

/// Reconnect with a fixed delay until shutdown or a sync-breaking error.
async fn connection_loop(
    ctx: ClientContext,
    mut outgoing: mpsc::Receiver<OutgoingEvent>,
    shutdown: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        let attempt = match TcpStream::connect(&ctx.config.server).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                tracing::info!(server = %ctx.config.server, "connected");
                let (reader, writer) = stream.into_split();
                run_session(&ctx, reader, writer, &mut outgoing, &mut shutdown_rx).await
            }
            Err(err) => Err(DaemonError::Transport(err)),
        };

        match attempt {
            Ok(SessionEnd::Shutdown) => return Ok(()),
            Ok(SessionEnd::Disconnected) => tracing::info!("disconnected from server"),
            Err(DaemonError::Rejected { code, explained }) if code.is_sync_breaking() => {
                tracing::error!(?code, explained = %explained, "server refused the session, not retrying");
                return Err(DaemonError::Rejected { code, explained });
            }
            Err(err) => tracing::warn!(error = %err, "session failed"),
        }

        let delay = ctx.config.reconnect_delay();
        tracing::info!(delay_secs = delay.as_secs(), "reconnecting");
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Run the client until ctrl-c or a sync-breaking server error.
pub async fn run_client(config: ClientConfig, versioning: Versioning) -> Result<(), DaemonError> {
    let root = validate_root(&config.root)?;
    fs::create_dir_all(&config.staging).map_err(|e| io_err(&config.staging, e))?;

    let (watcher, raw_events) = FsWatcher::start()?;
    let catalog: Arc<dyn CatalogStore> = Arc::new(JsonCatalog::open(&config.catalog)?);
    let engine = Arc::new(
        Engine::new(root, catalog)
            .with_watcher(watcher.clone())
            .with_retry(config.hash_retry),
    );
    {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.initialize())
            .await
            .map_err(|err| DaemonError::Protocol(format!("initial scan join error: {err}")))??;
    }

    let ctx = ClientContext {
        transfer: TransferSettings {
            staging: config.staging.clone(),
            chunk_size: config.chunk_size,
            max_file_size: config.max_file_size,
        },
        config,
        versioning,
        engine: engine.clone(),
    };

    let (outgoing_tx, outgoing_rx) = mpsc::channel::<OutgoingEvent>(OUTGOING_QUEUE);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let reconcile_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        let watcher = watcher.clone();
        tokio::spawn(async move {
            let result =
                reconcile_task(engine, watcher, raw_events, outgoing_tx, shutdown.subscribe())
                    .await;
            let _ = shutdown.send(());
            result
        })
    };

    let connection_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = connection_loop(ctx, outgoing_rx, shutdown.clone()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = tokio::spawn(signal_task(shutdown_tx.clone()));

    let (reconcile_result, connection_result, signal_result) =
        tokio::join!(reconcile_handle, connection_handle, signal_handle);
    watcher.close();

    handle_join("reconcile", reconcile_result)?;
    handle_join("connection", connection_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn session_key_survives_restarts() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("state/session-key");
        assert_eq!(load_session_key(&path), None);

        save_session_key(&path, "abc-123").expect("save");
        assert_eq!(load_session_key(&path).as_deref(), Some("abc-123"));
    }

    #[test]
    fn empty_session_key_path_disables_persistence() {
        let path = Path::new("");
        save_session_key(path, "abc").expect("no-op");
        assert_eq!(load_session_key(path), None);
    }
}
