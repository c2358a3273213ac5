//! YAML configuration for the server and client parties.
//!
//! Every field has a default so a config file only needs to name what
//! differs. Loading is fatal on error: the caller aborts startup.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{config_io, ConfigError};
use crate::hasher::RetryPolicy;

/// Default chunk size for file parts.
pub const DEFAULT_CHUNK_SIZE: usize = 15 * 1024;

/// Default upper bound for one frame, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Directory holding one subtree per user: `<root>/<uid>/…`.
    pub root: PathBuf,
    pub catalog: PathBuf,
    /// Where incoming file parts are assembled. Keep it outside `root`.
    pub staging: PathBuf,
    pub party_name: String,
    pub owner_contacts: String,
    pub additional_rules: String,
    /// Mixed into every password hash.
    pub password_salt: String,
    pub users: Vec<UserRecord>,
    pub limits: ServerLimits,
    pub error_budget: ErrorBudget,
    pub token_validity_secs: u64,
    pub handshake_timeout_secs: u64,
    pub chunk_size: usize,
    pub hash_retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7425".to_string(),
            root: PathBuf::from("/var/lib/filesync/root"),
            catalog: PathBuf::from("/var/lib/filesync/catalog.json"),
            staging: PathBuf::from("/var/lib/filesync/staging"),
            party_name: "filesync-server".to_string(),
            owner_contacts: String::new(),
            additional_rules: String::new(),
            password_salt: String::new(),
            users: Vec::new(),
            limits: ServerLimits::default(),
            error_budget: ErrorBudget::default(),
            token_validity_secs: 24 * 60 * 60,
            handshake_timeout_secs: 180,
            chunk_size: DEFAULT_CHUNK_SIZE,
            hash_retry: RetryPolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_secs)
    }
}

/// A login allowed on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u64,
    pub login: String,
    /// Hex SHA-256 of `password_salt + password`.
    pub password_hash: String,
    /// When set, the user may only authenticate from this address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrict_ip: Option<IpAddr>,
}

/// Zero disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerLimits {
    pub max_message_size: usize,
    pub max_clients: usize,
    pub max_connections_per_user: usize,
    pub max_file_size: u64,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_clients: 64,
            max_connections_per_user: 8,
            max_file_size: 0,
        }
    }
}

/// How many errors a connection may accumulate before it is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorBudget {
    pub client: u32,
    pub server: u32,
}

impl Default for ErrorBudget {
    fn default() -> Self {
        Self {
            client: 10,
            server: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: String,
    pub login: String,
    pub password: String,
    pub device_name: String,
    pub root: PathBuf,
    pub catalog: PathBuf,
    pub staging: PathBuf,
    pub party_name: String,
    /// The session key survives restarts through this file.
    pub session_key_file: PathBuf,
    pub reconnect_delay_secs: u64,
    pub handshake_timeout_secs: u64,
    pub max_message_size: usize,
    pub max_file_size: u64,
    pub chunk_size: usize,
    pub hash_retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:7425".to_string(),
            login: String::new(),
            password: String::new(),
            device_name: "filesync-client".to_string(),
            root: PathBuf::from("sync"),
            catalog: PathBuf::from(".filesync/catalog.json"),
            staging: PathBuf::from(".filesync/staging"),
            party_name: "filesync-client".to_string(),
            session_key_file: PathBuf::from(".filesync/session-key"),
            reconnect_delay_secs: 10,
            handshake_timeout_secs: 180,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_file_size: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            hash_retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load a config file.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| config_io(path, e))?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Render a config as YAML, e.g. for a template.
pub fn to_yaml<T: Serialize>(config: &T) -> Result<String, ConfigError> {
    Ok(serde_yaml::to_string(config)?)
}

/// The synchronized root must exist and be a directory. Returns the
/// canonical form so that watcher paths compare equal.
pub fn validate_root(root: &Path) -> Result<PathBuf, ConfigError> {
    let bad = |reason: String| ConfigError::BadRoot {
        path: root.to_path_buf(),
        reason,
    };
    let meta = std::fs::metadata(root).map_err(|e| bad(e.to_string()))?;
    if !meta.is_dir() {
        return Err(bad("not a directory".to_string()));
    }
    std::fs::canonicalize(root).map_err(|e| bad(e.to_string()))
}
