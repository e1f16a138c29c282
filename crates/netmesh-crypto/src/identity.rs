use std::path::Path;

use base64::Engine;
use rand::rngs::OsRng;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{encode_public_key_b64, CryptoError};

/// Modulus size for the server key pair.
pub const RSA_KEY_BITS: usize = 4096;

/// The server's long-lived RSA key pair. Signs every outbound message and
/// wraps nothing itself -- session keys are wrapped under *peer* keys; this
/// key's public half is published in the handshake response so clients can
/// verify server signatures.
#[derive(Clone)]
pub struct ServerIdentity {
    private_key: RsaPrivateKey,
    signing_key: SigningKey<Sha256>,
    pub public_key: RsaPublicKey,
    pub public_key_b64: String,
}

impl ServerIdentity {
    /// Generate a fresh key pair. Production callers go through
    /// [`ServerIdentity::load_or_generate`]; this is public for clients and
    /// test harnesses that need their own RSA identity.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| CryptoError::KeyGen(e.to_string()))?;
        Self::from_private_key(private_key)
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public_key = RsaPublicKey::from(&private_key);
        let public_key_b64 = encode_public_key_b64(&public_key)?;
        let signing_key = SigningKey::<Sha256>::new(private_key.clone());
        Ok(Self {
            private_key,
            signing_key,
            public_key,
            public_key_b64,
        })
    }

    /// Load the server key pair from `key_path`, or generate an RSA-4096
    /// pair and persist it there as PKCS#8 PEM with owner-only permissions.
    pub fn load_or_generate(key_path: &Path) -> Result<Self, CryptoError> {
        Self::load_or_generate_with_bits(key_path, RSA_KEY_BITS)
    }

    fn load_or_generate_with_bits(key_path: &Path, bits: usize) -> Result<Self, CryptoError> {
        if key_path.exists() {
            let pem = Zeroizing::new(std::fs::read_to_string(key_path)?);
            let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|e| CryptoError::Encoding(format!("invalid server key file: {e}")))?;
            return Self::from_private_key(private_key);
        }

        let identity = Self::generate(bits)?;
        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pem = identity
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        std::fs::write(key_path, pem.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(identity)
    }

    /// Sign a payload with SHA-256-with-RSA. Returns base64.
    pub fn sign(&self, payload: &[u8]) -> String {
        let signature = self.signing_key.sign(payload);
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }
}

/// Shared RSA identity for this crate's tests. Key generation dominates
/// test time, so one 2048-bit pair is generated per test binary.
#[cfg(test)]
pub(crate) fn test_identity() -> &'static ServerIdentity {
    use std::sync::OnceLock;
    static IDENTITY: OnceLock<ServerIdentity> = OnceLock::new();
    IDENTITY.get_or_init(|| ServerIdentity::generate(2048).unwrap())
}
