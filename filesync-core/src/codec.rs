//! Message envelope encoding.
//!
//! On the wire every frame is one JSON object:
//!
//! ```text
//! {"kind":11,"authToken":"…","timestamp":"2024-01-01T00:00:00Z","payload":{…}}
//! ```
//!
//! In memory the frame is an [`Envelope`] around a [`Message`], a closed sum
//! type with one variant per [`MessageKind`]. Decoding validates the
//! discriminator first, so an unknown kind is reported separately from a
//! payload that does not parse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::protocol::{
    Auth, ErrorCode, ErrorPayload, FileEnd, FileMeta, FilePart, GetFile, Handshake, Hello,
    MessageKind, OkPayload, StartSync, SyncEvent, Token, WarningCode, WarningPayload,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Error(ErrorPayload),
    Auth(Auth),
    Token(Token),
    GetFile(GetFile),
    SendFile(FileMeta),
    ConnectionEnd,
    Ok(OkPayload),
    StartSync(StartSync),
    EndSync,
    CloseConnection,
    SyncEvent(SyncEvent),
    Handshake(Handshake),
    Hello(Hello),
    FilePart(FilePart),
    FileEnd(FileEnd),
    Warning(WarningPayload),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Error(_) => MessageKind::Error,
            Message::Auth(_) => MessageKind::Auth,
            Message::Token(_) => MessageKind::Token,
            Message::GetFile(_) => MessageKind::GetFile,
            Message::SendFile(_) => MessageKind::SendFile,
            Message::ConnectionEnd => MessageKind::ConnectionEnd,
            Message::Ok(_) => MessageKind::Ok,
            Message::StartSync(_) => MessageKind::StartSync,
            Message::EndSync => MessageKind::EndSync,
            Message::CloseConnection => MessageKind::CloseConnection,
            Message::SyncEvent(_) => MessageKind::SyncEvent,
            Message::Handshake(_) => MessageKind::Handshake,
            Message::Hello(_) => MessageKind::Hello,
            Message::FilePart(_) => MessageKind::FileParts,
            Message::FileEnd(_) => MessageKind::FileEnd,
            Message::Warning(_) => MessageKind::Warning,
        }
    }

    pub fn error(code: ErrorCode, explained: impl Into<String>) -> Self {
        Message::Error(ErrorPayload {
            code,
            explained: explained.into(),
        })
    }

    pub fn warning(code: WarningCode, explained: impl Into<String>) -> Self {
        Message::Warning(WarningPayload {
            code,
            explained: explained.into(),
        })
    }

    pub fn ok(human_readable: impl Into<String>) -> Self {
        Message::Ok(OkPayload::new(human_readable))
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Message::Error(p) => serde_json::to_value(p),
            Message::Auth(p) => serde_json::to_value(p),
            Message::Token(p) => serde_json::to_value(p),
            Message::GetFile(p) => serde_json::to_value(p),
            Message::SendFile(p) => serde_json::to_value(p),
            Message::Ok(p) => serde_json::to_value(p),
            Message::StartSync(p) => serde_json::to_value(p),
            Message::SyncEvent(p) => serde_json::to_value(p),
            Message::Handshake(p) => serde_json::to_value(p),
            Message::Hello(p) => serde_json::to_value(p),
            Message::FilePart(p) => serde_json::to_value(p),
            Message::FileEnd(p) => serde_json::to_value(p),
            Message::Warning(p) => serde_json::to_value(p),
            Message::ConnectionEnd | Message::EndSync | Message::CloseConnection => {
                Ok(Value::Object(Default::default()))
            }
        }
    }

    fn from_payload(kind: MessageKind, payload: Value) -> Result<Self, serde_json::Error> {
        let message = match kind {
            MessageKind::Error => Message::Error(serde_json::from_value(payload)?),
            MessageKind::Auth => Message::Auth(serde_json::from_value(payload)?),
            MessageKind::Token => Message::Token(serde_json::from_value(payload)?),
            MessageKind::GetFile => Message::GetFile(serde_json::from_value(payload)?),
            MessageKind::SendFile => Message::SendFile(serde_json::from_value(payload)?),
            MessageKind::ConnectionEnd => Message::ConnectionEnd,
            MessageKind::Ok => Message::Ok(serde_json::from_value(payload)?),
            MessageKind::StartSync => Message::StartSync(serde_json::from_value(payload)?),
            MessageKind::EndSync => Message::EndSync,
            MessageKind::CloseConnection => Message::CloseConnection,
            MessageKind::SyncEvent => Message::SyncEvent(serde_json::from_value(payload)?),
            MessageKind::Handshake => Message::Handshake(serde_json::from_value(payload)?),
            MessageKind::Hello => Message::Hello(serde_json::from_value(payload)?),
            MessageKind::FileParts => Message::FilePart(serde_json::from_value(payload)?),
            MessageKind::FileEnd => Message::FileEnd(serde_json::from_value(payload)?),
            MessageKind::Warning => Message::Warning(serde_json::from_value(payload)?),
        };
        Ok(message)
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Empty until the server has issued a token.
    pub auth_token: String,
    pub timestamp: DateTime<Utc>,
    pub message: Message,
}

impl Envelope {
    pub fn new(auth_token: impl Into<String>, message: Message) -> Self {
        Self {
            auth_token: auth_token.into(),
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    kind: u64,
    #[serde(default)]
    auth_token: String,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: Value,
}

/// Encode an envelope as a single JSON line, without the trailing newline.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    let frame = RawFrame {
        kind: u64::from(envelope.kind().code()),
        auth_token: envelope.auth_token.clone(),
        timestamp: envelope.timestamp,
        payload: envelope.message.payload()?,
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Decode one frame.
pub fn decode(line: &str) -> Result<Envelope, CodecError> {
    let frame: RawFrame = serde_json::from_str(line)?;
    let kind = MessageKind::from_code(frame.kind).ok_or(CodecError::UnknownKind(frame.kind))?;
    let message = Message::from_payload(kind, frame.payload)?;
    Ok(Envelope {
        auth_token: frame.auth_token,
        timestamp: frame.timestamp,
        message,
    })
}
