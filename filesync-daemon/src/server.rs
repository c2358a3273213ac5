//! Server runtime: accept loop, local reconciliation and event fan-out.

use std::fs;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use filesync_core::config::{validate_root, ServerConfig};
use filesync_core::protocol::Limits;
use filesync_core::{CatalogStore, JsonCatalog, Versioning};
use filesync_engine::{Engine, OutgoingEvent, Tenancy};

use crate::auth::StaticUsers;
use crate::error::{io_err, DaemonError};
use crate::registry::ConnectionRegistry;
use crate::runtime::{handle_join, signal_task};
use crate::session::{serve, ServerContext};
use crate::sync::TransferSettings;
use crate::watcher::{reconcile_task, FsWatcher};

const OUTGOING_QUEUE: usize = 1024;

/// Validate, bind, rebuild the catalog and serve until ctrl-c.
///
/// Every step before the first task is spawned is fatal.
pub async fn run_server(config: ServerConfig, versioning: Versioning) -> Result<(), DaemonError> {
    let root = validate_root(&config.root)?;
    fs::create_dir_all(&config.staging).map_err(|e| io_err(&config.staging, e))?;

    let listener = TcpListener::bind(&config.listen)
        .await
        .map_err(|source| DaemonError::Bind {
            addr: config.listen.clone(),
            source,
        })?;

    let (watcher, raw_events) = FsWatcher::start()?;
    let catalog: Arc<dyn CatalogStore> = Arc::new(JsonCatalog::open(&config.catalog)?);
    let engine = Arc::new(
        Engine::new(root.clone(), catalog)
            .with_tenancy(Tenancy::PerUser)
            .with_watcher(watcher.clone())
            .with_retry(config.hash_retry),
    );
    let indexed = {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.initialize())
            .await
            .map_err(|err| DaemonError::Protocol(format!("initial scan join error: {err}")))??
    };
    tracing::info!(
        root = %root.display(),
        listen = %config.listen,
        users = config.users.len(),
        indexed,
        "server ready",
    );

    let registry = Arc::new(ConnectionRegistry::new(
        config.limits.max_clients,
        config.limits.max_connections_per_user,
    ));
    let ctx = Arc::new(server_context(&config, versioning, engine.clone(), registry.clone()));

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

    let publisher_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = publisher_task(registry, outgoing_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let accept_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = accept_task(listener, ctx, shutdown.clone()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = tokio::spawn(signal_task(shutdown_tx.clone()));

    let (reconcile_result, publisher_result, accept_result, signal_result) =
        tokio::join!(reconcile_handle, publisher_handle, accept_handle, signal_handle);
    watcher.close();

    handle_join("reconcile", reconcile_result)?;
    handle_join("publisher", publisher_result)?;
    handle_join("accept", accept_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

pub fn server_context(
    config: &ServerConfig,
    versioning: Versioning,
    engine: Arc<Engine>,
    registry: Arc<ConnectionRegistry>,
) -> ServerContext {
    ServerContext {
        versioning,
        party_name: config.party_name.clone(),
        owner_contacts: config.owner_contacts.clone(),
        additional_rules: config.additional_rules.clone(),
        limits: Limits {
            max_clients: config.limits.max_clients as u64,
            max_connections_per_user: config.limits.max_connections_per_user as u64,
            max_file_size: config.limits.max_file_size,
            max_message_size: config.limits.max_message_size as u64,
        },
        max_message_size: config.limits.max_message_size,
        budget: config.error_budget,
        handshake_timeout: config.handshake_timeout(),
        token_validity: config.token_validity(),
        transfer: TransferSettings {
            staging: config.staging.clone(),
            chunk_size: config.chunk_size,
            max_file_size: config.limits.max_file_size,
        },
        users: Arc::new(StaticUsers::new(
            config.password_salt.clone(),
            config.users.clone(),
        )),
        registry,
        engine,
    }
}

/// Deliver each local change to every syncing session of its owner.
async fn publisher_task(
    registry: Arc<ConnectionRegistry>,
    mut outgoing: mpsc::Receiver<OutgoingEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            out = outgoing.recv() => {
                let Some(out) = out else { break };
                let delivered = registry.publish(&out).await;
                tracing::debug!(owner = %out.owner, name = %out.event.name, delivered, "published");
            }
        }
    }
    Ok(())
}

async fn accept_task(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    shutdown: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let mut shutdown_rx = shutdown.subscribe();
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(err) = finished {
                    tracing::error!(error = %err, "session task failed");
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                sessions.spawn(serve(ctx.clone(), peer, reader, writer, shutdown.subscribe()));
            }
        }
    }

    // Sessions have seen the shutdown and are sending ConnectionEnd.
    tracing::info!(live = sessions.len(), "waiting for sessions to close");
    while let Some(finished) = sessions.join_next().await {
        if let Err(err) = finished {
            tracing::error!(error = %err, "session task failed");
        }
    }
    Ok(())
}
