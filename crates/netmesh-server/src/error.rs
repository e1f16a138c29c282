use thiserror::Error;

use netmesh_crypto::CryptoError;
use netmesh_proto::ErrorCode;
use netmesh_store::StoreError;

/// Everything that can go wrong while servicing one connection. Each
/// variant maps to a wire error code; whether the connection survives is
/// decided by the state machine, not here.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("handshake required before any other frame")]
    NotAuthenticated,

    #[error("handshake already completed on this connection")]
    AlreadyAuthenticated,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("signature did not verify against the registered key")]
    InvalidSignature,

    #[error("decrypted content is not valid UTF-8")]
    InvalidUtf8,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl ConnectionError {
    /// Convert to a wire error code and a client-safe message.
    pub fn to_wire(&self) -> (ErrorCode, String) {
        match self {
            ConnectionError::Malformed(_) => {
                (ErrorCode::InvalidMessage, "malformed envelope".to_string())
            }
            ConnectionError::NotAuthenticated => (ErrorCode::NotAuthenticated, self.to_string()),
            ConnectionError::AlreadyAuthenticated => {
                (ErrorCode::AlreadyAuthenticated, self.to_string())
            }
            ConnectionError::HandshakeFailed(_) => (ErrorCode::HandshakeFailed, self.to_string()),
            ConnectionError::RateLimited => (ErrorCode::RateLimited, self.to_string()),
            ConnectionError::InvalidSignature => (ErrorCode::InvalidSignature, self.to_string()),
            ConnectionError::InvalidUtf8 => {
                (ErrorCode::MessageFailed, "message could not be decoded".to_string())
            }
            ConnectionError::Crypto(e) => match e {
                CryptoError::BadKey(_)
                | CryptoError::Wrap(_)
                | CryptoError::KeyGen(_)
                | CryptoError::Encoding(_) => {
                    (ErrorCode::HandshakeFailed, "handshake failed".to_string())
                }
                _ => (ErrorCode::MessageFailed, "message could not be decrypted".to_string()),
            },
            ConnectionError::Store(_) => {
                (ErrorCode::MessageFailed, "message could not be persisted".to_string())
            }
        }
    }
}
