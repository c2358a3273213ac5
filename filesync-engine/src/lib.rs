//! # filesync-engine
//!
//! Reconciliation between the local filesystem, the catalog and a peer.
//!
//! - [`Engine::process_local`] turns a watcher event into outgoing
//!   [`SyncEvent`](filesync_core::protocol::SyncEvent)s.
//! - [`Engine::apply_remote`] applies a peer's event to the local tree, or
//!   asks for the file content.
//! - [`Engine::describe_request`] and [`Engine::finish_transfer`] are the
//!   filesystem halves of a file transfer.
//!
//! Every method blocks; async callers run them on a blocking thread.

mod echo;
pub mod engine;
pub mod error;
mod incoming;
mod outgoing;
mod scan;
mod transfer;
pub mod watch;

pub use echo::{EchoBuffer, Suppression, SUPPRESSION_TTL};
pub use engine::{Applied, Engine, OutgoingEvent, Tenancy};
pub use error::EngineError;
pub use watch::{DirWatcher, FsEvent, FsOp, NoopWatcher};
