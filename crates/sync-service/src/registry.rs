use std::sync::Arc;

use async_trait::async_trait;
use chain_store::{ChainFilter, ChainStore, StoreError};
use tracing::warn;
use vault_secrets::{DecryptError, VaultClient};

use crate::types::ChainDescriptor;

/// Resolves an encrypted credential to a plaintext connection string.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError>;
}

#[async_trait]
impl SecretResolver for VaultClient {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError> {
        VaultClient::decrypt(self, ciphertext).await
    }
}

/// Produces a fresh snapshot of enabled chains for one pass, with
/// credentials resolved. A chain whose credential fails to decrypt is
/// degraded to an empty endpoint rather than aborting the snapshot.
pub struct ChainRegistry {
    store: Arc<ChainStore>,
    resolver: Arc<dyn SecretResolver>,
}

impl ChainRegistry {
    pub fn new(store: Arc<ChainStore>, resolver: Arc<dyn SecretResolver>) -> Self {
        Self { store, resolver }
    }

    pub async fn load(&self) -> Result<Vec<ChainDescriptor>, StoreError> {
        let records = self.store.list_chains(ChainFilter::EnabledOnly)?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let endpoint = if record.encrypted_endpoint.is_empty() {
                String::new()
            } else {
                match self.resolver.decrypt(&record.encrypted_endpoint).await {
                    Ok(plaintext) => plaintext,
                    Err(err) => {
                        warn!(?err, chain = %record.key, "failed to resolve chain endpoint");
                        String::new()
                    }
                }
            };
            out.push(ChainDescriptor::from_record(record, endpoint));
        }
        Ok(out)
    }
}
