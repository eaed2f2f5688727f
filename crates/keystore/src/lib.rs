/// Encrypt/decrypt collaborator for key values at rest.
pub mod cipher;
pub mod error;
pub mod ids;
/// Degrade-to-null wrapper for front-end request handlers.
pub mod lenient;
pub mod settings;
pub mod sqlite;
pub mod types;

use std::sync::Arc;

pub use cipher::{KeyCipher, MASTER_KEY_ENV, MasterKeyCipher};
pub use error::{KeystoreError, KeystoreResult};
pub use ids::ApiKeyId;
pub use lenient::LenientKeystore;
pub use settings::KeystoreSettings;
pub use sqlite::SqliteKeystore;
pub use types::{ApiKeyPatch, ApiKeyRecord, ENCRYPTED_VALUE_PREFIX, NewApiKey};

pub trait ApiKeyStore: Send + Sync {
    /// Returns the default key for a service instance, newest first.
    fn fetch_default_key(&self, service_instance_id: &str) -> KeystoreResult<Option<ApiKeyRecord>>;
    fn create_key(&self, input: NewApiKey) -> KeystoreResult<ApiKeyRecord>;
    fn update_key(&self, id: ApiKeyId, patch: ApiKeyPatch) -> KeystoreResult<ApiKeyRecord>;
    fn delete_key(&self, id: ApiKeyId) -> KeystoreResult<()>;
    /// Returns the plaintext key value, decrypting the stored form when it
    /// carries the encrypted prefix.
    fn fetch_decrypted_key(&self, id: ApiKeyId) -> KeystoreResult<Option<String>>;
    /// Bumps the usage counter for `id` and returns the new count.
    fn increment_usage(&self, id: ApiKeyId) -> KeystoreResult<u64>;
}

/// Opens the keystore described by `settings`, wiring the cipher derived
/// from the environment master key.
pub async fn open_keystore(settings: &KeystoreSettings) -> KeystoreResult<SqliteKeystore> {
    let cipher = MasterKeyCipher::from_env().map(|cipher| Arc::new(cipher) as Arc<dyn KeyCipher>);
    SqliteKeystore::open(&settings.database_path, cipher).await
}
