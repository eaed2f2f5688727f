use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, KeystoreError, KeystoreResult};

/// Stable identifier for one stored API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApiKeyId(pub Uuid);

impl ApiKeyId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> KeystoreResult<Self> {
        let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
            stage: "parse-api-key-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ApiKeyId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for ApiKeyId {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl From<ApiKeyId> for Uuid {
    fn from(value: ApiKeyId) -> Self {
        value.0
    }
}

impl FromStr for ApiKeyId {
    type Err = KeystoreError;

    fn from_str(raw: &str) -> KeystoreResult<Self> {
        Self::parse(raw)
    }
}
