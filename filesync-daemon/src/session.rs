//! Server side of one connection.
//!
//! ```text
//! Connected --Hello--> HelloExchanged --Auth--> Authenticated --StartSync--> SyncStarted
//!                                                     ^                          |
//!                                                     +---------EndSync----------+
//! ```
//!
//! Any stage closes on `CloseConnection`, `ConnectionEnd`, transport
//! failure, server shutdown or an exhausted error budget. Every stage but
//! `SyncStarted` waits for the next frame with a bounded timeout.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use uuid::Uuid;

use filesync_core::codec::{self, Envelope, Message};
use filesync_core::config::ErrorBudget;
use filesync_core::protocol::{Auth, Handshake, Hello, Intent, Limits, StartSync, Token};
use filesync_core::{ErrorCode, UserId, Versioning};
use filesync_engine::Engine;

use crate::auth::{generate_session_key, TokenRecord, UserStore};
use crate::error::{DaemonError, Fault};
use crate::framing::FrameReader;
use crate::messenger::Messenger;
use crate::registry::ConnectionRegistry;
use crate::sync::{SyncHandler, TransferSettings};

/// Bound on flushing the last frames of a closing session.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connected,
    HelloExchanged,
    Authenticated,
    SyncStarted,
    Closed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Connected => "waiting for hello",
            Stage::HelloExchanged => "waiting for auth",
            Stage::Authenticated => "waiting for start sync",
            Stage::SyncStarted => "syncing",
            Stage::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Everything a session needs from the server.
pub struct ServerContext {
    pub versioning: Versioning,
    pub party_name: String,
    pub owner_contacts: String,
    pub additional_rules: String,
    pub limits: Limits,
    pub max_message_size: usize,
    pub budget: ErrorBudget,
    pub handshake_timeout: Duration,
    pub token_validity: Duration,
    pub transfer: TransferSettings,
    pub users: Arc<dyn UserStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub engine: Arc<Engine>,
}

/// Run one connection to completion.
pub async fn serve<R, W>(
    ctx: Arc<ServerContext>,
    peer: SocketAddr,
    reader: R,
    writer: W,
    shutdown_rx: broadcast::Receiver<()>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (messenger, writer_task) = Messenger::spawn(writer);
    let mut frames = FrameReader::new(reader, ctx.max_message_size);

    let id = match ctx.registry.register(peer, messenger.clone()).await {
        Ok(id) => id,
        Err(code) => {
            tracing::warn!(%peer, ?code, "connection refused");
            let _ = messenger
                .send(Message::error(code, "server is at its connection limit"))
                .await;
            drop(messenger);
            let _ = tokio::time::timeout(CLOSE_GRACE, writer_task).await;
            return;
        }
    };
    tracing::info!(%peer, session = %id, "connection accepted");

    let mut session = ServerSession {
        ctx: ctx.clone(),
        id,
        peer,
        stage: Stage::Connected,
        messenger,
        token: None,
        user: None,
        sync: None,
    };
    if let Err(err) = session.run(&mut frames, shutdown_rx).await {
        tracing::warn!(%peer, session = %id, error = %err, "session ended with error");
    }

    ctx.registry.remove(id).await;
    let stats_messenger = session.messenger.clone();
    drop(session);
    let stats = stats_messenger.stats();
    tracing::info!(
        %peer,
        session = %id,
        bytes_received = frames.bytes_read(),
        bytes_sent = stats.bytes_sent(),
        client_errors = stats.client_errors(),
        server_errors = stats.server_errors(),
        "connection closed",
    );
    drop(stats_messenger);
    match tokio::time::timeout(CLOSE_GRACE, writer_task).await {
        Ok(Ok(Err(err))) => tracing::debug!(%peer, error = %err, "writer failed"),
        Err(_) => tracing::debug!(%peer, "writer did not drain in time"),
        _ => {}
    }
}

struct ServerSession {
    ctx: Arc<ServerContext>,
    id: Uuid,
    peer: SocketAddr,
    stage: Stage,
    messenger: Messenger,
    token: Option<TokenRecord>,
    user: Option<UserId>,
    sync: Option<SyncHandler>,
}

enum Next {
    Frame(String),
    Eof,
    Shutdown,
}

impl ServerSession {
    async fn run<R: AsyncRead + Unpin>(
        &mut self,
        frames: &mut FrameReader<R>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), DaemonError> {
        while self.stage != Stage::Closed {
            let next = tokio::select! {
                _ = shutdown_rx.recv() => Ok(Next::Shutdown),
                read = self.read_next(frames) => read,
            };
            let line = match next {
                Ok(Next::Frame(line)) => line,
                Ok(Next::Eof) => return Ok(()),
                Ok(Next::Shutdown) => {
                    self.messenger.send(Message::ConnectionEnd).await?;
                    return Ok(());
                }
                Err(err) if err.ends_connection() => return Err(err),
                Err(DaemonError::Timeout(what)) => {
                    tracing::info!(peer = %self.peer, stage = %self.stage, "timed out waiting for {what}");
                    self.messenger.send(Message::ConnectionEnd).await?;
                    return Ok(());
                }
                Err(err) => {
                    self.report(err).await?;
                    continue;
                }
            };

            match codec::decode(&line) {
                Ok(envelope) => self.dispatch(envelope).await?,
                Err(err) => self.report(err.into()).await?,
            }
        }
        Ok(())
    }

    async fn read_next<R: AsyncRead + Unpin>(
        &self,
        frames: &mut FrameReader<R>,
    ) -> Result<Next, DaemonError> {
        let read = if self.stage == Stage::SyncStarted {
            frames.next_frame().await?
        } else {
            tokio::time::timeout(self.ctx.handshake_timeout, frames.next_frame())
                .await
                .map_err(|_| DaemonError::Timeout("the next handshake message"))??
        };
        Ok(match read {
            Some(line) => Next::Frame(line),
            None => Next::Eof,
        })
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Result<(), DaemonError> {
        let kind = envelope.kind();
        match (self.stage, envelope.message) {
            (_, Message::CloseConnection | Message::ConnectionEnd) => {
                tracing::info!(peer = %self.peer, stage = %self.stage, "peer closed the session");
                self.stage = Stage::Closed;
                Ok(())
            }
            (_, Message::Warning(warning)) => {
                tracing::info!(peer = %self.peer, code = ?warning.code, explained = %warning.explained, "peer warning");
                Ok(())
            }
            (Stage::Connected, Message::Hello(hello)) => self.on_hello(hello).await,
            (Stage::HelloExchanged, Message::Auth(auth)) => self.on_auth(auth).await,
            (Stage::Authenticated, Message::StartSync(start)) => self.on_start_sync(start).await,
            (Stage::SyncStarted, Message::EndSync) => self.on_end_sync().await,
            (Stage::SyncStarted, Message::Error(payload)) => {
                tracing::warn!(peer = %self.peer, code = ?payload.code, explained = %payload.explained, "peer reported an error");
                Ok(())
            }
            (Stage::SyncStarted, message) => {
                if !self.token_identifies(&envelope.auth_token) {
                    return self
                        .report(DaemonError::Rejected {
                            code: ErrorCode::AccessDenied,
                            explained: "access denied".to_string(),
                        })
                        .await;
                }
                let Some(sync) = self.sync.as_mut() else {
                    return Err(DaemonError::Protocol("sync handler missing".to_string()));
                };
                match sync.handle(message).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.ends_connection() => Err(err),
                    Err(err) => self.charge(err.fault()).await,
                }
            }
            (stage, _) => {
                self.report(DaemonError::Unexpected {
                    kind,
                    stage: stage.to_string(),
                })
                .await
            }
        }
    }

    async fn on_hello(&mut self, hello: Hello) -> Result<(), DaemonError> {
        let verdict = match hello.intent {
            Intent::Client => self
                .ctx
                .versioning
                .check_peer(hello.app_version, hello.protocol_version),
            Intent::Mirror => Err(ErrorCode::IntentionRejected),
            Intent::Unknown(_) => Err(ErrorCode::IntentionUnknown),
        };
        if let Err(code) = verdict {
            tracing::info!(
                peer = %self.peer,
                party = %hello.party_name,
                version = %hello.app_version,
                ?code,
                "hello rejected",
            );
            self.messenger
                .send(Message::error(code, "incompatible peer"))
                .await?;
            self.stage = Stage::Closed;
            return Ok(());
        }

        let ctx = &self.ctx;
        self.messenger
            .send(Message::Handshake(Handshake {
                party_name: ctx.party_name.clone(),
                app_version: ctx.versioning.app,
                protocol_version: ctx.versioning.protocol,
                owner_contacts: ctx.owner_contacts.clone(),
                additional_rules: ctx.additional_rules.clone(),
                limits: ctx.limits,
            }))
            .await?;
        tracing::debug!(peer = %self.peer, party = %hello.party_name, "hello accepted");
        self.stage = Stage::HelloExchanged;
        Ok(())
    }

    async fn on_auth(&mut self, auth: Auth) -> Result<(), DaemonError> {
        let denied = DaemonError::Rejected {
            code: ErrorCode::AccessDenied,
            explained: "access denied".to_string(),
        };
        let Some(user) = self.ctx.users.verify(&auth.login, &auth.password) else {
            tracing::info!(peer = %self.peer, login = %auth.login, "authentication failed");
            return self.report(denied).await;
        };
        if let Some(allowed) = user.restrict_ip {
            if allowed != self.peer.ip() {
                tracing::info!(peer = %self.peer, login = %auth.login, "login from a restricted address");
                return self.report(denied).await;
            }
        }

        let uid = UserId(user.id);
        if let Err(code) = self.ctx.registry.authenticate(self.id, uid).await {
            tracing::info!(peer = %self.peer, user = %uid, ?code, "per-user connection limit reached");
            self.messenger
                .send(Message::error(code, "too many connections for this user"))
                .await?;
            self.stage = Stage::Closed;
            return Ok(());
        }

        let session_key = auth
            .session_key
            .filter(|key| !key.is_empty())
            .unwrap_or_else(generate_session_key);
        let record = TokenRecord::issue(uid, session_key, self.ctx.token_validity);
        self.messenger.set_token(&record.token);
        self.messenger
            .send(Message::Token(Token {
                token: record.token.clone(),
                session_key: record.session_key.clone(),
            }))
            .await?;
        tracing::info!(peer = %self.peer, user = %uid, device = %auth.device_name, "authenticated");

        self.user = Some(uid);
        self.token = Some(record);
        self.stage = Stage::Authenticated;
        Ok(())
    }

    async fn on_start_sync(&mut self, start: StartSync) -> Result<(), DaemonError> {
        if !self.token_matches(&start.token) {
            return self
                .report(DaemonError::Rejected {
                    code: ErrorCode::AccessDenied,
                    explained: "access denied".to_string(),
                })
                .await;
        }
        let Some(user) = self.user else {
            return Err(DaemonError::Protocol("authenticated session without user".to_string()));
        };

        self.messenger.send(Message::ok("sync started")).await?;
        if self.sync.is_none() {
            self.sync = Some(SyncHandler::new(
                self.ctx.engine.clone(),
                self.messenger.clone(),
                user,
                &self.ctx.transfer,
            ));
        }
        self.ctx.registry.set_syncing(self.id, true).await;
        self.stage = Stage::SyncStarted;
        tracing::info!(peer = %self.peer, user = %user, "sync started");
        Ok(())
    }

    async fn on_end_sync(&mut self) -> Result<(), DaemonError> {
        self.ctx.registry.set_syncing(self.id, false).await;
        self.sync = None;
        self.stage = Stage::Authenticated;
        self.messenger.send(Message::ok("sync ended")).await?;
        tracing::info!(peer = %self.peer, "sync ended");
        Ok(())
    }

    fn token_matches(&self, presented: &str) -> bool {
        self.token
            .as_ref()
            .is_some_and(|record| record.accepts(presented, Utc::now()))
    }

    fn token_identifies(&self, presented: &str) -> bool {
        self.token
            .as_ref()
            .is_some_and(|record| record.identifies(presented))
    }

    /// Send `err` to the peer and charge it.
    async fn report(&mut self, err: DaemonError) -> Result<(), DaemonError> {
        tracing::debug!(peer = %self.peer, stage = %self.stage, error = %err, "session error");
        self.messenger.send_error(&err).await?;
        self.charge(err.fault()).await
    }

    /// Count one error and close the session once a budget is exceeded.
    async fn charge(&mut self, fault: Fault) -> Result<(), DaemonError> {
        let stats = self.messenger.stats();
        let code = match fault {
            Fault::Peer if stats.client_error() > self.ctx.budget.client => {
                ErrorCode::TooManyClientErrors
            }
            Fault::Local if stats.server_error() > self.ctx.budget.server => {
                ErrorCode::TooManyServerErrors
            }
            _ => return Ok(()),
        };
        tracing::warn!(peer = %self.peer, ?code, "error budget exhausted, closing");
        self.messenger
            .send(Message::error(code, "error budget exhausted"))
            .await?;
        self.stage = Stage::Closed;
        Ok(())
    }
}
