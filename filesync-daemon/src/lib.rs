//! Network side of filesync: framing, sessions, transfers and the two
//! party runtimes.

pub mod auth;
pub mod client;
mod error;
pub mod framing;
pub mod messenger;
pub mod registry;
mod runtime;
pub mod server;
pub mod session;
pub mod sync;
pub mod transfer;
pub mod watcher;

pub use auth::{hash_password, StaticUsers, TokenRecord, UserStore};
pub use client::{establish, run_client, Established, SessionEnd};
pub use error::{DaemonError, Fault};
pub use messenger::Messenger;
pub use registry::ConnectionRegistry;
pub use runtime::{start_client_blocking, start_server_blocking};
pub use server::run_server;
pub use session::{serve, ServerContext};
pub use sync::TransferSettings;
