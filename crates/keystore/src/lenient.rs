use crate::ApiKeyStore;
use crate::ids::ApiKeyId;
use crate::types::{ApiKeyPatch, ApiKeyRecord, NewApiKey};

/// Degrade-to-null wrapper over any [`ApiKeyStore`].
///
/// The front-end request handlers that call this layer treat every failure
/// the same way: the operation yields nothing and the cause goes to the
/// log. This wrapper implements that contract; callers that need to
/// distinguish causes programmatically use the typed store directly.
pub struct LenientKeystore<S> {
    inner: S,
}

impl<S: ApiKeyStore> LenientKeystore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fetch_default_key(&self, service_instance_id: &str) -> Option<ApiKeyRecord> {
        self.inner
            .fetch_default_key(service_instance_id)
            .unwrap_or_else(|error| {
                tracing::warn!(
                    service_instance_id,
                    "failed to fetch default api key: {error}"
                );
                None
            })
    }

    pub fn create_key(&self, input: NewApiKey) -> Option<ApiKeyRecord> {
        match self.inner.create_key(input) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!("failed to create api key: {error}");
                None
            }
        }
    }

    pub fn update_key(&self, id: ApiKeyId, patch: ApiKeyPatch) -> Option<ApiKeyRecord> {
        match self.inner.update_key(id, patch) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(api_key_id = %id, "failed to update api key: {error}");
                None
            }
        }
    }

    pub fn delete_key(&self, id: ApiKeyId) -> bool {
        match self.inner.delete_key(id) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(api_key_id = %id, "failed to delete api key: {error}");
                false
            }
        }
    }

    pub fn fetch_decrypted_key(&self, id: ApiKeyId) -> Option<String> {
        self.inner.fetch_decrypted_key(id).unwrap_or_else(|error| {
            tracing::warn!(api_key_id = %id, "failed to fetch api key value: {error}");
            None
        })
    }

    pub fn increment_usage(&self, id: ApiKeyId) -> Option<u64> {
        match self.inner.increment_usage(id) {
            Ok(count) => Some(count),
            Err(error) => {
                tracing::warn!(api_key_id = %id, "failed to increment api key usage: {error}");
                None
            }
        }
    }
}
