//! Wire payloads.
//!
//! Every frame carries one of the payloads below, selected by its
//! [`MessageKind`]. Field names are camelCase on the wire. Enumerations that a
//! newer peer may extend (error codes, warning codes, intents, actions) keep
//! unrecognised values instead of failing the whole frame.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ObjectKind;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Discriminator of a frame. Values are fixed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Error = 1,
    Auth = 2,
    Token = 3,
    GetFile = 4,
    SendFile = 5,
    ConnectionEnd = 6,
    Ok = 7,
    StartSync = 8,
    EndSync = 9,
    CloseConnection = 10,
    SyncEvent = 11,
    Handshake = 12,
    Hello = 13,
    FileParts = 14,
    FileEnd = 15,
    Warning = 16,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u64) -> Option<Self> {
        let kind = match code {
            1 => Self::Error,
            2 => Self::Auth,
            3 => Self::Token,
            4 => Self::GetFile,
            5 => Self::SendFile,
            6 => Self::ConnectionEnd,
            7 => Self::Ok,
            8 => Self::StartSync,
            9 => Self::EndSync,
            10 => Self::CloseConnection,
            11 => Self::SyncEvent,
            12 => Self::Handshake,
            13 => Self::Hello,
            14 => Self::FileParts,
            15 => Self::FileEnd,
            16 => Self::Warning,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Error and warning codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum ErrorCode {
    BrokenMessage,
    UnknownMessageType,
    AccessDenied,
    Internal,
    TooManyServerErrors,
    TooManyClientErrors,
    TooManyClients,
    TooManyConnections,
    IncompatibleAppVersion,
    IncompatibleProtocol,
    IncompatibleConditions,
    HaveNewerVersion,
    IntentionUnknown,
    IntentionRejected,
    Other(u16),
}

impl ErrorCode {
    /// Codes after which the receiving client must not retry the session.
    pub fn is_sync_breaking(self) -> bool {
        matches!(
            self,
            ErrorCode::AccessDenied
                | ErrorCode::TooManyServerErrors
                | ErrorCode::TooManyClientErrors
                | ErrorCode::TooManyClients
                | ErrorCode::IncompatibleAppVersion
                | ErrorCode::IncompatibleConditions
        )
    }
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        match code {
            1 => Self::BrokenMessage,
            2 => Self::UnknownMessageType,
            3 => Self::AccessDenied,
            4 => Self::Internal,
            5 => Self::TooManyServerErrors,
            6 => Self::TooManyClientErrors,
            7 => Self::TooManyClients,
            8 => Self::TooManyConnections,
            9 => Self::IncompatibleAppVersion,
            10 => Self::IncompatibleProtocol,
            11 => Self::IncompatibleConditions,
            12 => Self::HaveNewerVersion,
            13 => Self::IntentionUnknown,
            14 => Self::IntentionRejected,
            other => Self::Other(other),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::BrokenMessage => 1,
            ErrorCode::UnknownMessageType => 2,
            ErrorCode::AccessDenied => 3,
            ErrorCode::Internal => 4,
            ErrorCode::TooManyServerErrors => 5,
            ErrorCode::TooManyClientErrors => 6,
            ErrorCode::TooManyClients => 7,
            ErrorCode::TooManyConnections => 8,
            ErrorCode::IncompatibleAppVersion => 9,
            ErrorCode::IncompatibleProtocol => 10,
            ErrorCode::IncompatibleConditions => 11,
            ErrorCode::HaveNewerVersion => 12,
            ErrorCode::IntentionUnknown => 13,
            ErrorCode::IntentionRejected => 14,
            ErrorCode::Other(other) => other,
        }
    }
}

/// Non-fatal notices a party may send at any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum WarningCode {
    UnsupportedFunction,
    Maintenance,
    ProtocolChange,
    PossibleErrors,
    UnknownObjects,
    ConnectionLimitReached,
    Other(u16),
}

impl From<u16> for WarningCode {
    fn from(code: u16) -> Self {
        match code {
            1 => Self::UnsupportedFunction,
            2 => Self::Maintenance,
            3 => Self::ProtocolChange,
            4 => Self::PossibleErrors,
            5 => Self::UnknownObjects,
            6 => Self::ConnectionLimitReached,
            other => Self::Other(other),
        }
    }
}

impl From<WarningCode> for u16 {
    fn from(code: WarningCode) -> Self {
        match code {
            WarningCode::UnsupportedFunction => 1,
            WarningCode::Maintenance => 2,
            WarningCode::ProtocolChange => 3,
            WarningCode::PossibleErrors => 4,
            WarningCode::UnknownObjects => 5,
            WarningCode::ConnectionLimitReached => 6,
            WarningCode::Other(other) => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Versioning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppVersion {
    pub major: u32,
    pub minor: u32,
    #[serde(default)]
    pub patch: u32,
}

impl AppVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Versions a party announces and accepts. Passed into every runtime
/// instead of being read from globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Versioning {
    pub app: AppVersion,
    pub protocol: u32,
}

/// Protocol revision spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

impl Versioning {
    /// The versions of this build.
    pub fn current() -> Self {
        let part = |s: &str| s.parse().unwrap_or(0);
        Self {
            app: AppVersion::new(
                part(env!("CARGO_PKG_VERSION_MAJOR")),
                part(env!("CARGO_PKG_VERSION_MINOR")),
                part(env!("CARGO_PKG_VERSION_PATCH")),
            ),
            protocol: PROTOCOL_VERSION,
        }
    }

    /// Check a peer's announced versions. Only the major app version and the
    /// protocol revision have to agree.
    pub fn check_peer(&self, app: AppVersion, protocol: u32) -> Result<(), ErrorCode> {
        if app.major != self.app.major {
            return Err(ErrorCode::IncompatibleAppVersion);
        }
        if protocol != self.protocol {
            return Err(ErrorCode::IncompatibleProtocol);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handshake and authentication
// ---------------------------------------------------------------------------

/// Why the client connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Intent {
    Client,
    Mirror,
    Unknown(u8),
}

impl From<u8> for Intent {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::Client,
            2 => Self::Mirror,
            other => Self::Unknown(other),
        }
    }
}

impl From<Intent> for u8 {
    fn from(intent: Intent) -> Self {
        match intent {
            Intent::Client => 1,
            Intent::Mirror => 2,
            Intent::Unknown(other) => other,
        }
    }
}

/// Limits a party declares. Zero means "no limit".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
    pub max_clients: u64,
    pub max_connections_per_user: u64,
    pub max_file_size: u64,
    pub max_message_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub intent: Intent,
    #[serde(default)]
    pub party_name: String,
    pub app_version: AppVersion,
    pub protocol_version: u32,
    #[serde(default)]
    pub owner_contacts: String,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(default)]
    pub party_name: String,
    pub app_version: AppVersion,
    pub protocol_version: u32,
    #[serde(default)]
    pub owner_contacts: String,
    #[serde(default)]
    pub additional_rules: String,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auth {
    pub login: String,
    pub password: String,
    #[serde(default)]
    pub device_name: String,
    /// Key of an earlier session of the same device, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub token: String,
    pub session_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSync {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkPayload {
    pub ok: bool,
    #[serde(default)]
    pub human_readable: String,
}

impl OkPayload {
    pub fn new(human_readable: impl Into<String>) -> Self {
        Self {
            ok: true,
            human_readable: human_readable.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    #[serde(default)]
    pub explained: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningPayload {
    pub code: WarningCode,
    #[serde(default)]
    pub explained: String,
}

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
    Deleted,
    Renamed,
    /// Protocol placeholder, never acted on.
    Any,
    /// Protocol placeholder, never acted on.
    NoAction,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncAction::Created => "created",
            SyncAction::Updated => "updated",
            SyncAction::Deleted => "deleted",
            SyncAction::Renamed => "renamed",
            SyncAction::Any => "any",
            SyncAction::NoAction => "no_action",
            SyncAction::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One reconciled change, in peer-addressable path form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub action: SyncAction,
    pub object_kind: ObjectKind,
    pub name: String,
    /// Escaped path of the containing directory.
    pub path: String,
    #[serde(default)]
    pub hash: String,
    pub new_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFile {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub hash: String,
    pub updated_at: DateTime<Utc>,
}

impl GetFile {
    pub fn same_object(&self, name: &str, path: &str) -> bool {
        self.name == name && self.path == path
    }
}

/// Metadata announced before the parts of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ext: String,
}

/// One chunk of file content, base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePart {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEnd {
    pub name: String,
    pub path: String,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_codes_are_stable() {
        for code in 1..=16u64 {
            let kind = MessageKind::from_code(code).expect("known kind");
            assert_eq!(kind.code() as u64, code);
        }
        assert!(MessageKind::from_code(0).is_none());
        assert!(MessageKind::from_code(17).is_none());
    }

    #[test]
    fn unknown_error_codes_survive_decoding() {
        let payload: ErrorPayload =
            serde_json::from_value(json!({"code": 99, "explained": "later"})).unwrap();
        assert_eq!(payload.code, ErrorCode::Other(99));
        assert_eq!(serde_json::to_value(&payload).unwrap()["code"], json!(99));
    }

    #[test]
    fn sync_breaking_set() {
        assert!(ErrorCode::AccessDenied.is_sync_breaking());
        assert!(ErrorCode::IncompatibleAppVersion.is_sync_breaking());
        assert!(!ErrorCode::HaveNewerVersion.is_sync_breaking());
        assert!(!ErrorCode::BrokenMessage.is_sync_breaking());
    }

    #[test]
    fn unrecognised_action_decodes_as_unknown() {
        let action: SyncAction = serde_json::from_value(json!("teleported")).unwrap();
        assert_eq!(action, SyncAction::Unknown);
        let action: SyncAction = serde_json::from_value(json!("no_action")).unwrap();
        assert_eq!(action, SyncAction::NoAction);
    }

    #[test]
    fn version_check_compares_major_and_protocol_only() {
        let local = Versioning {
            app: AppVersion::new(1, 0, 0),
            protocol: 1,
        };
        assert!(local.check_peer(AppVersion::new(1, 7, 3), 1).is_ok());
        assert_eq!(
            local.check_peer(AppVersion::new(2, 0, 0), 1),
            Err(ErrorCode::IncompatibleAppVersion)
        );
        assert_eq!(
            local.check_peer(AppVersion::new(1, 0, 0), 2),
            Err(ErrorCode::IncompatibleProtocol)
        );
    }

    #[test]
    fn file_part_is_base64_on_the_wire() {
        let part = FilePart {
            data: b"hello".to_vec(),
        };
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value, json!({"data": "aGVsbG8="}));
    }
}
