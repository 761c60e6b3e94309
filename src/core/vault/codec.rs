use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use hmac::Hmac;
use sha2::Sha256;

use super::VaultError;

/// Environment variable holding the secret the vault key is derived from.
pub const SECRET_ENV: &str = "OUTPOST_VAULT_SECRET";

const KEY_SALT: &[u8] = b"outpost-credential-vault-v1";
const KEY_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Decrypted credential document for one provider.
pub type CredentialMap = BTreeMap<String, serde_json::Value>;

/// Whole-document credential encryption: AES-256-GCM with a PBKDF2 key
/// derived once at construction. Blobs are `base64(nonce || ciphertext)`.
pub struct VaultCodec {
    cipher: Aes256Gcm,
}

impl VaultCodec {
    pub fn from_secret(secret: &str) -> Result<Self, VaultError> {
        if secret.is_empty() {
            return Err(VaultError::MissingSecret);
        }
        let key = derive_key(secret)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| VaultError::KeyDerivation)?;
        Ok(Self { cipher })
    }

    /// Build the codec from [`SECRET_ENV`]. An unset or empty variable is
    /// [`VaultError::MissingSecret`].
    pub fn from_env() -> Result<Self, VaultError> {
        let secret = std::env::var(SECRET_ENV).map_err(|_| VaultError::MissingSecret)?;
        Self::from_secret(&secret)
    }

    pub fn encrypt(&self, credentials: &CredentialMap) -> Result<String, VaultError> {
        let plaintext = serde_json::to_vec(credentials).map_err(VaultError::Serialization)?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| VaultError::Encryption)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Every failure, whatever its cause, is [`VaultError::DecryptionFailed`].
    pub fn decrypt(&self, blob: &str) -> Result<CredentialMap, VaultError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(blob.trim())
            .map_err(|_| VaultError::DecryptionFailed)?;
        if combined.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::DecryptionFailed);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::DecryptionFailed)?;
        serde_json::from_slice(&plaintext).map_err(|_| VaultError::DecryptionFailed)
    }
}

fn derive_key(secret: &str) -> Result<[u8; 32], VaultError> {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(secret.as_bytes(), KEY_SALT, KEY_ITERATIONS, &mut key)
        .map_err(|_| VaultError::KeyDerivation)?;
    Ok(key)
}
