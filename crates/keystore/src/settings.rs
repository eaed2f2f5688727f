use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};

pub const SETTINGS_DIRECTORY_NAME: &str = "murmur";
pub const SETTINGS_FILE_NAME: &str = "keystore.json";
pub const SETTINGS_ENV_PREFIX: &str = "MURMUR_KEYSTORE_";

const DEFAULT_DATABASE_RELATIVE_PATH: &str = ".murmur/api_keys.db";

/// Keystore deployment settings.
///
/// Loaded from serialized defaults, merged with the optional JSON settings
/// file, then with `MURMUR_KEYSTORE_`-prefixed environment variables. The
/// master key is deliberately absent here: it is a secret and comes from
/// the environment only (see [`crate::cipher::MASTER_KEY_ENV`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreSettings {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for KeystoreSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl KeystoreSettings {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<Self>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to load keystore settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                Self::default()
            }
        }
    }

    fn normalized(mut self) -> Self {
        self.database_path = if self.database_path.trim().is_empty() {
            default_database_path()
        } else {
            self.database_path.trim().to_string()
        };

        self
    }
}

fn default_database_path() -> String {
    DEFAULT_DATABASE_RELATIVE_PATH.to_string()
}
