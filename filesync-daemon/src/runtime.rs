use std::path::Path;

use tokio::sync::broadcast;

use filesync_core::config::{self, ClientConfig, ServerConfig};
use filesync_core::Versioning;

use crate::error::{io_err, DaemonError};

/// Load the server config, start the runtime and block until it exits.
pub fn start_server_blocking(config_path: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let config: ServerConfig = config::load(config_path)?;
    let runtime = build_runtime()?;
    runtime.block_on(crate::server::run_server(config, Versioning::current()))
}

/// Load the client config, start the runtime and block until it exits.
pub fn start_client_blocking(config_path: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let config: ClientConfig = config::load(config_path)?;
    let runtime = build_runtime()?;
    runtime.block_on(crate::client::run_client(config, Versioning::current()))
}

fn build_runtime() -> Result<tokio::runtime::Runtime, DaemonError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))
}

/// Wait for ctrl-c or another task's shutdown, whichever comes first.
pub(crate) async fn signal_task(shutdown: broadcast::Sender<()>) -> Result<(), DaemonError> {
    let mut shutdown_rx = shutdown.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("received ctrl-c, shutting down");
                    let _ = shutdown.send(());
                    Ok(())
                }
                Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
            }
        }
    }
}

pub(crate) fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
