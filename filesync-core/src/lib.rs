//! filesync core library: domain types, catalog persistence, wire model.
//!
//! - [`types`]: catalog records and identifiers
//! - [`namespace`]: transport-safe path escaping and per-user segments
//! - [`catalog`]: the [`CatalogStore`] contract plus memory and JSON stores
//! - [`hasher`]: SHA-256 content digests with bounded retry
//! - [`protocol`] / [`codec`]: message payloads and the framed envelope
//! - [`config`]: YAML configuration for both parties

pub mod catalog;
pub mod codec;
pub mod config;
pub mod error;
pub mod hasher;
pub mod namespace;
pub mod protocol;
pub mod types;

pub use catalog::{CatalogStore, JsonCatalog, MemoryCatalog};
pub use codec::{Envelope, Message};
pub use config::{ClientConfig, ServerConfig};
pub use error::{CatalogError, CodecError, ConfigError, NamespaceError};
pub use hasher::RetryPolicy;
pub use namespace::NamespaceCodec;
pub use protocol::{ErrorCode, MessageKind, SyncAction, Versioning};
pub use types::{CatalogEntry, CatalogKey, ObjectKind, UserId};
