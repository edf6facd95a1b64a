//! Proof/object storage collaborator for documents and images
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub reference: String,
    pub url: String,
}

#[async_trait]
pub trait ProofStorage: Send + Sync {
    async fn store(&self, bytes: &[u8], name: &str) -> Result<StoredObject, StorageError>;

    async fn resolve(&self, reference: &str) -> Result<String, StorageError>;
}

/// Content-addressed store keyed by the sha256 of each object, served from a
/// public gateway URL.
pub struct ContentAddressedStore {
    gateway: String,
    objects: RwLock<HashMap<String, (String, Vec<u8>)>>,
}

impl ContentAddressedStore {
    pub fn new(gateway: impl Into<String>) -> Self {
        Self {
            gateway: gateway.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    fn url_for(&self, reference: &str) -> String {
        format!("https://{}/ipfs/{}", self.gateway, reference)
    }

    /// Raw bytes and original name of a stored object.
    pub async fn fetch(&self, reference: &str) -> Option<(String, Vec<u8>)> {
        self.objects.read().await.get(reference).cloned()
    }
}

#[async_trait]
impl ProofStorage for ContentAddressedStore {
    async fn store(&self, bytes: &[u8], name: &str) -> Result<StoredObject, StorageError> {
        let reference = format!("sha256-{}", sha256::digest(bytes));
        self.objects
            .write()
            .await
            .entry(reference.clone())
            .or_insert_with(|| (name.to_string(), bytes.to_vec()));

        Ok(StoredObject {
            url: self.url_for(&reference),
            reference,
        })
    }

    async fn resolve(&self, reference: &str) -> Result<String, StorageError> {
        if self.objects.read().await.contains_key(reference) {
            Ok(self.url_for(reference))
        } else {
            Err(StorageError::UnknownReference(reference.to_string()))
        }
    }
}

/// Storage that is never reachable. Forces the fingerprint fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineStorage;

#[async_trait]
impl ProofStorage for OfflineStorage {
    async fn store(&self, _: &[u8], name: &str) -> Result<StoredObject, StorageError> {
        Err(StorageError::Unavailable(format!("cannot store {name}: storage offline")))
    }

    async fn resolve(&self, reference: &str) -> Result<String, StorageError> {
        Err(StorageError::Unavailable(format!("cannot resolve {reference}: storage offline")))
    }
}
