use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

/// Session keys are 256-bit AES keys.
pub const SESSION_KEY_BYTES: usize = 32;

/// AES-GCM IV length (96 bits).
pub const GCM_IV_BYTES: usize = 12;

pub type SessionKey = [u8; SESSION_KEY_BYTES];

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key: {0}")]
    BadKey(String),

    #[error("ciphertext rejected: authentication tag mismatch")]
    BadTag,

    #[error("invalid IV length")]
    BadIv,

    #[error("encryption failed")]
    Encrypt,

    #[error("session key wrap failed: {0}")]
    Wrap(String),

    #[error("session key unwrap failed")]
    Unwrap,

    #[error("not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("key encoding failed: {0}")]
    Encoding(String),

    #[error("key generation failed: {0}")]
    KeyGen(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generate a fresh 256-bit session key from the OS RNG.
pub fn new_session_key() -> SessionKey {
    let mut key = [0u8; SESSION_KEY_BYTES];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt plaintext with AES-256-GCM under a fresh random IV.
/// Returns `(ciphertext_b64, iv_b64)`; the 16-byte tag is appended to the
/// ciphertext. The IV is never reused across calls with the same key.
pub fn encrypt_message(
    key: &SessionKey,
    plaintext: &[u8],
) -> Result<(String, String), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    let mut iv = [0u8; GCM_IV_BYTES];
    OsRng.fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    Ok((
        base64::engine::general_purpose::STANDARD.encode(ciphertext),
        base64::engine::general_purpose::STANDARD.encode(iv),
    ))
}

/// Decrypt AES-256-GCM ciphertext. A tag mismatch (wrong key, tampered
/// ciphertext, wrong IV) yields [`CryptoError::BadTag`].
pub fn decrypt_message(
    key: &SessionKey,
    ciphertext_b64: &str,
    iv_b64: &str,
) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = base64::engine::general_purpose::STANDARD.decode(ciphertext_b64)?;
    let iv = decode_iv_b64(iv_b64)?;
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| CryptoError::BadTag)
}

fn decode_iv_b64(iv_b64: &str) -> Result<[u8; GCM_IV_BYTES], CryptoError> {
    let iv = base64::engine::general_purpose::STANDARD.decode(iv_b64)?;
    if iv.len() != GCM_IV_BYTES {
        return Err(CryptoError::BadIv);
    }
    let mut out = [0u8; GCM_IV_BYTES];
    out.copy_from_slice(&iv);
    Ok(out)
}

/// Parse a base64-encoded X.509 SubjectPublicKeyInfo RSA key.
pub fn parse_public_key_b64(public_key_b64: &str) -> Result<RsaPublicKey, CryptoError> {
    if public_key_b64.is_empty() {
        return Err(CryptoError::BadKey("public key is empty".to_string()));
    }
    let der = base64::engine::general_purpose::STANDARD
        .decode(public_key_b64)
        .map_err(|e| CryptoError::BadKey(format!("not valid base64: {e}")))?;
    RsaPublicKey::from_public_key_der(&der)
        .map_err(|e| CryptoError::BadKey(format!("not a valid SPKI RSA key: {e}")))
}

/// Encode an RSA public key as base64 SPKI DER.
pub fn encode_public_key_b64(public_key: &RsaPublicKey) -> Result<String, CryptoError> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(der.as_bytes()))
}

/// RSA-OAEP-SHA-256 encrypt a session key under a peer's public key.
pub fn wrap_session_key(
    peer_public: &RsaPublicKey,
    key: &SessionKey,
) -> Result<String, CryptoError> {
    let wrapped = peer_public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_slice())
        .map_err(|e| CryptoError::Wrap(e.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(wrapped))
}

/// Recover a wrapped session key with the matching private key.
pub fn unwrap_session_key(
    private_key: &RsaPrivateKey,
    wrapped_b64: &str,
) -> Result<SessionKey, CryptoError> {
    let wrapped = base64::engine::general_purpose::STANDARD.decode(wrapped_b64)?;
    let raw = private_key
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .map_err(|_| CryptoError::Unwrap)?;
    if raw.len() != SESSION_KEY_BYTES {
        return Err(CryptoError::Unwrap);
    }
    let mut key = [0u8; SESSION_KEY_BYTES];
    key.copy_from_slice(&raw);
    Ok(key)
}

/// Sign a payload with SHA-256-with-RSA. Returns base64.
pub fn sign_payload(private_key: &RsaPrivateKey, payload: &[u8]) -> String {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key.sign(payload);
    base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
}

/// Verify a SHA-256-with-RSA signature. Returns true if valid.
pub fn verify_signature(public_key: &RsaPublicKey, payload: &[u8], signature_b64: &str) -> bool {
    let signature_bytes = match base64::engine::general_purpose::STANDARD.decode(signature_b64) {
        Ok(v) => v,
        Err(_) => return false,
    };
    let signature = match Signature::try_from(signature_bytes.as_slice()) {
        Ok(v) => v,
        Err(_) => return false,
    };
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    verifying_key.verify(payload, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_identity;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = new_session_key();
        let plaintext = b"hello mesh";
        let (ct, iv) = encrypt_message(&key, plaintext).unwrap();
        let decrypted = decrypt_message(&key, &ct, &iv).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_key_fails_with_bad_tag() {
        let key1 = new_session_key();
        let key2 = new_session_key();
        let (ct, iv) = encrypt_message(&key1, b"secret").unwrap();
        assert!(matches!(
            decrypt_message(&key2, &ct, &iv),
            Err(CryptoError::BadTag)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = new_session_key();
        let (ct, iv) = encrypt_message(&key, b"important").unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD.decode(&ct).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = base64::engine::general_purpose::STANDARD.encode(raw);
        assert!(matches!(
            decrypt_message(&key, &tampered, &iv),
            Err(CryptoError::BadTag)
        ));
    }

    #[test]
    fn ivs_are_unique_per_call() {
        let key = new_session_key();
        let (_, iv1) = encrypt_message(&key, b"msg").unwrap();
        let (_, iv2) = encrypt_message(&key, b"msg").unwrap();
        assert_ne!(iv1, iv2);
    }

    #[test]
    fn wrong_iv_length_rejected() {
        let key = new_session_key();
        let (ct, _) = encrypt_message(&key, b"msg").unwrap();
        let short_iv = base64::engine::general_purpose::STANDARD.encode([0u8; 8]);
        assert!(matches!(
            decrypt_message(&key, &ct, &short_iv),
            Err(CryptoError::BadIv)
        ));
    }

    #[test]
    fn session_keys_are_distinct() {
        assert_ne!(new_session_key(), new_session_key());
    }

    #[test]
    fn spki_encode_parse_round_trip() {
        let identity = test_identity();
        let b64 = encode_public_key_b64(&identity.public_key).unwrap();
        let parsed = parse_public_key_b64(&b64).unwrap();
        assert_eq!(parsed, identity.public_key);
    }

    #[test]
    fn parse_public_key_rejects_garbage() {
        assert!(matches!(
            parse_public_key_b64(""),
            Err(CryptoError::BadKey(_))
        ));
        assert!(matches!(
            parse_public_key_b64("not base64!!!"),
            Err(CryptoError::BadKey(_))
        ));
        let der_less = base64::engine::general_purpose::STANDARD.encode(b"random bytes");
        assert!(matches!(
            parse_public_key_b64(&der_less),
            Err(CryptoError::BadKey(_))
        ));
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let identity = test_identity();
        let key = new_session_key();
        let wrapped = wrap_session_key(&identity.public_key, &key).unwrap();
        let unwrapped = unwrap_session_key(identity.private_key(), &wrapped).unwrap();
        assert_eq!(unwrapped, key);
    }

    #[test]
    fn wrap_is_randomized() {
        let identity = test_identity();
        let key = new_session_key();
        let w1 = wrap_session_key(&identity.public_key, &key).unwrap();
        let w2 = wrap_session_key(&identity.public_key, &key).unwrap();
        // OAEP is randomized, so the same key wraps to different ciphertexts.
        assert_ne!(w1, w2);
    }

    #[test]
    fn sign_verify_round_trip() {
        let identity = test_identity();
        let payload = b"signed payload";
        let sig = sign_payload(identity.private_key(), payload);
        assert!(verify_signature(&identity.public_key, payload, &sig));
        assert!(!verify_signature(&identity.public_key, b"other payload", &sig));
        assert!(!verify_signature(&identity.public_key, payload, "bogus sig"));
    }
}
