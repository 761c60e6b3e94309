//! Encrypted cloud-provider credentials at rest.

pub mod codec;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use tracing::info;

use crate::core::clock::Clock;
use crate::core::store::{self, RecordStore, StoreError};
pub use codec::{CredentialMap, SECRET_ENV, VaultCodec};

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault secret is not configured (set {})", SECRET_ENV)]
    MissingSecret,
    #[error("failed to derive the vault key")]
    KeyDerivation,
    #[error("failed to serialize credentials: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("failed to encrypt credentials")]
    Encryption,
    #[error("credential blob could not be decrypted")]
    DecryptionFailed,
    #[error("provider name must not be empty")]
    InvalidProvider,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialEntry {
    pub provider: String,
    pub updated_at: DateTime<Utc>,
}

/// Provider-keyed credential storage. Only encrypted blobs touch the store.
#[derive(Clone)]
pub struct CredentialVault {
    store: RecordStore,
    codec: Arc<VaultCodec>,
    clock: Arc<dyn Clock>,
}

impl CredentialVault {
    pub fn new(store: RecordStore, codec: Arc<VaultCodec>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            codec,
            clock,
        }
    }

    pub async fn store_credentials(
        &self,
        provider: &str,
        credentials: &CredentialMap,
    ) -> Result<(), VaultError> {
        if provider.trim().is_empty() {
            return Err(VaultError::InvalidProvider);
        }
        let blob = self.codec.encrypt(credentials)?;
        let provider_key = provider.to_string();
        let updated_at = store::to_millis(self.clock.now());
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO credentials (provider, blob, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(provider) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
                    params![provider_key, blob, updated_at],
                )?;
                Ok(())
            })
            .await?;
        info!("[vault] Stored credentials for {}", provider);
        Ok(())
    }

    pub async fn load_credentials(
        &self,
        provider: &str,
    ) -> Result<Option<CredentialMap>, VaultError> {
        let provider = provider.to_string();
        let blob: Option<String> = self
            .store
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT blob FROM credentials WHERE provider = ?1",
                        params![provider],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        blob.map(|b| self.codec.decrypt(&b)).transpose()
    }

    pub async fn list_providers(&self) -> Result<Vec<CredentialEntry>, VaultError> {
        let rows = self
            .store
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT provider, updated_at FROM credentials ORDER BY provider")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (provider, updated_at) = row?;
                    out.push(CredentialEntry {
                        provider,
                        updated_at: store::from_millis("credentials", updated_at)?,
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// Returns whether the provider had stored credentials.
    pub async fn remove_credentials(&self, provider: &str) -> Result<bool, VaultError> {
        let provider_key = provider.to_string();
        let deleted = self
            .store
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM credentials WHERE provider = ?1",
                    params![provider_key],
                )?)
            })
            .await?;
        if deleted > 0 {
            info!("[vault] Removed credentials for {}", provider);
        }
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use std::sync::OnceLock;

    fn shared_codec() -> Arc<VaultCodec> {
        static CODEC: OnceLock<Arc<VaultCodec>> = OnceLock::new();
        CODEC
            .get_or_init(|| Arc::new(VaultCodec::from_secret("vault-tests").unwrap()))
            .clone()
    }

    fn test_vault() -> (CredentialVault, RecordStore) {
        let store = RecordStore::open_in_memory().unwrap();
        let vault = CredentialVault::new(store.clone(), shared_codec(), Arc::new(SystemClock));
        (vault, store)
    }

    fn creds(key: &str) -> CredentialMap {
        let mut map = CredentialMap::new();
        map.insert("api_key".into(), key.into());
        map
    }

    #[tokio::test]
    async fn store_and_load_credentials() {
        let (vault, _) = test_vault();
        vault.store_credentials("azure", &creds("k1")).await.unwrap();
        assert_eq!(
            vault.load_credentials("azure").await.unwrap(),
            Some(creds("k1"))
        );
    }

    #[tokio::test]
    async fn only_ciphertext_is_persisted() {
        let (vault, store) = test_vault();
        vault
            .store_credentials("gcp", &creds("very-secret-value"))
            .await
            .unwrap();
        let raw: String = store
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT blob FROM credentials WHERE provider = 'gcp'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert!(!raw.contains("very-secret-value"));
    }

    #[tokio::test]
    async fn store_overwrites_existing() {
        let (vault, _) = test_vault();
        vault.store_credentials("aws", &creds("old")).await.unwrap();
        vault.store_credentials("aws", &creds("new")).await.unwrap();
        assert_eq!(
            vault.load_credentials("aws").await.unwrap(),
            Some(creds("new"))
        );
        assert_eq!(vault.list_providers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_provider_loads_none() {
        let (vault, _) = test_vault();
        assert_eq!(vault.load_credentials("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn plaintext_row_is_not_accepted() {
        let (vault, store) = test_vault();
        store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO credentials (provider, blob, updated_at) VALUES ('legacy', '{\"api_key\":\"x\"}', 0)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(matches!(
            vault.load_credentials("legacy").await,
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn list_and_remove() {
        let (vault, _) = test_vault();
        vault.store_credentials("beta", &creds("2")).await.unwrap();
        vault.store_credentials("alpha", &creds("1")).await.unwrap();
        let names: Vec<String> = vault
            .list_providers()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.provider)
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        assert!(vault.remove_credentials("alpha").await.unwrap());
        assert!(!vault.remove_credentials("alpha").await.unwrap());
        assert_eq!(vault.load_credentials("alpha").await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_provider_is_rejected() {
        let (vault, _) = test_vault();
        assert!(matches!(
            vault.store_credentials(" ", &creds("x")).await,
            Err(VaultError::InvalidProvider)
        ));
    }
}
