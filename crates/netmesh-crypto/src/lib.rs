//! Cryptographic primitives for the netmesh chat server.
//!
//! Wire-compatible choices: RSA-4096 with OAEP-SHA-256 for session-key
//! wrap, AES-256-GCM (96-bit IV, 128-bit tag) for message content, and
//! SHA-256-with-RSA (PKCS#1 v1.5) for signatures. All binary values cross
//! the wire as standard-alphabet base64 with padding.

pub mod crypto;
pub mod identity;

pub use crypto::{
    decrypt_message, encrypt_message, encode_public_key_b64, new_session_key,
    parse_public_key_b64, sign_payload, unwrap_session_key, verify_signature,
    wrap_session_key, CryptoError, SessionKey, GCM_IV_BYTES, SESSION_KEY_BYTES,
};
pub use identity::{ServerIdentity, RSA_KEY_BITS};
pub use rsa::{RsaPrivateKey, RsaPublicKey};
