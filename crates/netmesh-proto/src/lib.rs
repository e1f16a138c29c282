//! Wire protocol for the netmesh chat server.
//!
//! Every frame on the TCP stream is one newline-terminated JSON document:
//! the [`Envelope`]. The envelope's `data` field carries a second,
//! stringified JSON document whose schema depends on the envelope type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Maximum size of a JSON-lines frame, terminator included (8 KiB).
pub const MAX_FRAME_BYTES: usize = 8192;

/// Sender id the server uses on frames it originates itself.
pub const SERVER_SENDER_ID: &str = "server";

/// Sender id carried by join/leave system notices.
pub const SYSTEM_SENDER_ID: &str = "system";

/// Display name carried by join/leave system notices.
pub const SYSTEM_SENDER_NAME: &str = "System";

/// Display name the server presents in the handshake response.
pub const SERVER_USERNAME: &str = "MeshServer";

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Frame type discriminator for the outer envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkMessageType {
    Handshake,
    HandshakeResponse,
    KeyExchange,
    EncryptedMessage,
    UserList,
    Heartbeat,
    FileTransfer,
    Error,
    Disconnect,
    /// Catch-all so frames from newer clients parse; the server answers
    /// these with `UNSUPPORTED` instead of dropping the connection.
    #[serde(other)]
    Unknown,
}

/// The outer JSON object framed by a newline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: NetworkMessageType,
    pub sender_id: String,
    /// Inner JSON document, stringified. Empty for HEARTBEAT.
    pub data: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub message_id: Option<String>,
}

impl Envelope {
    /// Build an envelope around an already-stringified payload.
    pub fn new(msg_type: NetworkMessageType, sender_id: impl Into<String>, data: String) -> Self {
        Self {
            msg_type,
            sender_id: sender_id.into(),
            data,
            timestamp: now_ms(),
            message_id: None,
        }
    }

    /// Build an envelope by serializing `payload` into the `data` field.
    pub fn with_payload<T: Serialize>(
        msg_type: NetworkMessageType,
        sender_id: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(msg_type, sender_id, serde_json::to_string(payload)?))
    }

    /// Parse the stringified `data` field into a payload struct.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Client -> server, first frame on a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeData {
    pub user_id: String,
    pub username: String,
    /// Base64 X.509 SubjectPublicKeyInfo (RSA-4096).
    pub public_key: String,
    #[serde(default)]
    pub client_version: Option<String>,
}

/// Server -> client, completes the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponseData {
    pub user_id: String,
    pub username: String,
    /// Server public key, base64 SPKI.
    pub public_key: String,
    /// RSA-OAEP(session key), base64.
    pub encrypted_session_key: String,
    pub server_version: String,
    pub max_message_size: usize,
}

/// Carried by ENCRYPTED_MESSAGE frames in both directions. Server -> client,
/// `sender_public_key` and `signature` are the server's; the envelope's
/// `sender_id` and this `sender_name` identify the original author.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessageData {
    pub message_id: String,
    /// AES-256-GCM ciphertext (tag appended), base64.
    pub encrypted_content: String,
    /// 12-byte GCM IV, base64.
    pub iv: String,
    /// SHA-256-with-RSA over the plaintext, base64.
    pub signature: String,
    pub sender_public_key: String,
    pub sender_name: String,
    pub timestamp: u64,
    pub message_type: MessageType,
}

/// Roster snapshot pushed after a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserListData {
    pub users: Vec<User>,
    pub total_users: usize,
    pub online_users: usize,
}

/// Carried by ERROR frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Error codes for structured error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MaxConnections,
    NotAuthenticated,
    AlreadyAuthenticated,
    InvalidMessage,
    HandshakeFailed,
    NoSessionKey,
    InvalidSignature,
    MessageFailed,
    RateLimited,
    Unsupported,
    SlowConsumer,
    ReadTimeout,
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// A user record, shared between the roster snapshot and the user store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    /// Base64 SPKI as presented at handshake.
    pub public_key: String,
    #[serde(default)]
    pub is_host: bool,
    pub is_online: bool,
    /// Milliseconds since the Unix epoch.
    pub last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// Kind of chat message, distinct from the envelope frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    System,
    Image,
    File,
    Heartbeat,
    Handshake,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::System => "SYSTEM",
            MessageType::Image => "IMAGE",
            MessageType::File => "FILE",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Handshake => "HANDSHAKE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TEXT" => Some(MessageType::Text),
            "SYSTEM" => Some(MessageType::System),
            "IMAGE" => Some(MessageType::Image),
            "FILE" => Some(MessageType::File),
            "HEARTBEAT" => Some(MessageType::Heartbeat),
            "HANDSHAKE" => Some(MessageType::Handshake),
            _ => None,
        }
    }
}

/// A chat message after server-side decryption. `content` is plaintext and
/// only ever lives in server memory and the audit log; on the wire the
/// content is always ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    pub sender_name: String,
    /// Sender-supplied, milliseconds since the Unix epoch; the server may
    /// clamp values from the future.
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub is_encrypted: bool,
}
