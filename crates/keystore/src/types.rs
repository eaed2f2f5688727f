use super::ids::ApiKeyId;

/// Prefix marking key values that were encrypted before storage.
///
/// Rows written before a master key was configured carry the raw value, so
/// reads use the prefix to decide whether decryption applies.
pub const ENCRYPTED_VALUE_PREFIX: &str = "enc:v1:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub id: ApiKeyId,
    pub service_instance_id: String,
    pub is_default: bool,
    /// Stored form; possibly encrypted, see [`ENCRYPTED_VALUE_PREFIX`].
    pub key_value: String,
    pub usage_count: u64,
    pub created_at_unix_seconds: u64,
    pub updated_at_unix_seconds: u64,
}

impl ApiKeyRecord {
    /// True when the stored value must be decrypted before use.
    pub fn value_is_encrypted(&self) -> bool {
        self.key_value.starts_with(ENCRYPTED_VALUE_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewApiKey {
    pub service_instance_id: String,
    pub is_default: bool,
    pub key_value: String,
    /// When false the value is plaintext and gets encrypted on write if a
    /// master key is configured; when true it is stored verbatim.
    pub value_is_pre_encrypted: bool,
}

impl NewApiKey {
    /// Creates a plaintext key input for the given service instance.
    pub fn plaintext(service_instance_id: impl Into<String>, key_value: impl Into<String>) -> Self {
        Self {
            service_instance_id: service_instance_id.into(),
            is_default: false,
            key_value: key_value.into(),
            value_is_pre_encrypted: false,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiKeyPatch {
    pub key_value: Option<String>,
    pub is_default: Option<bool>,
    /// Applies to `key_value` when present, with the same meaning as on
    /// [`NewApiKey`].
    pub value_is_pre_encrypted: bool,
}
