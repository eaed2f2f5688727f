use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};

use super::ApiKeyStore;
use super::cipher::KeyCipher;
use super::error::{
    CreateDatabaseDirectorySnafu, InvariantViolationSnafu, KeystoreResult, MissingMasterKeySnafu,
    NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, WorkerRuntimeInitSnafu, WorkerThreadSpawnSnafu,
};
use super::ids::ApiKeyId;
use super::types::{ApiKeyPatch, ApiKeyRecord, NewApiKey};

const API_KEY_COLUMNS: &str =
    "id, service_instance_id, is_default, key_value, usage_count, created_at, updated_at";

/// SQLite-backed API key store.
///
/// Holds the bootstrap pool for migrations; each store call then runs on a
/// dedicated worker thread with its own connection, so the sync trait never
/// blocks an ambient async runtime.
#[derive(Clone)]
pub struct SqliteKeystore {
    pool: SqlitePool,
    database_url: String,
    cipher: Option<Arc<dyn KeyCipher>>,
}

impl SqliteKeystore {
    pub async fn open(
        database_location: &str,
        cipher: Option<Arc<dyn KeyCipher>>,
    ) -> KeystoreResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "keystore-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "keystore-open-connect",
                database_url: database_url.clone(),
            })?;

        // Explicit PRAGMA writes make bootstrap behavior deterministic.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "keystore-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "keystore-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "keystore-open-migrate",
            })?;

        tracing::info!(encryption_enabled = cipher.is_some(), "keystore opened");

        Ok(Self {
            pool,
            database_url,
            cipher,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// True when a master key is configured and plaintext writes are
    /// encrypted at rest.
    pub fn encryption_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> KeystoreResult<T>
    where
        T: Send + 'static,
        F: Future<Output = KeystoreResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker
        // thread with its own current-thread runtime to avoid nested-runtime
        // blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("keystore-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(WorkerRuntimeInitSnafu {
                        stage: "keystore-worker-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(WorkerThreadSpawnSnafu {
                stage: "keystore-worker-spawn",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "keystore worker thread panicked".to_string(),
            }
            .fail(),
        }
    }

    // Encryption applies exactly when the caller asserts the value is
    // plaintext and a master key is configured; pre-encrypted input is
    // stored verbatim.
    fn stored_value_for_write(
        &self,
        key_value: String,
        value_is_pre_encrypted: bool,
    ) -> KeystoreResult<String> {
        if value_is_pre_encrypted {
            return Ok(key_value);
        }

        match &self.cipher {
            Some(cipher) => cipher.encrypt(&key_value),
            None => Ok(key_value),
        }
    }

    fn load_key(&self, id: ApiKeyId) -> KeystoreResult<Option<ApiKeyRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("key-load", async move {
            let mut connection =
                connect_keystore_connection(&database_url, "key-load-connect").await?;
            let row = sqlx::query_as::<_, ApiKeyRow>(&format!(
                "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = ?"
            ))
            .bind(id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "key-load-query",
            })?;

            row.map(api_key_row_to_record).transpose()
        })
    }
}

impl ApiKeyStore for SqliteKeystore {
    fn fetch_default_key(&self, service_instance_id: &str) -> KeystoreResult<Option<ApiKeyRecord>> {
        let database_url = self.database_url.clone();
        let service_instance_id = service_instance_id.to_string();
        self.run_db_call("default-key-fetch", async move {
            let mut connection =
                connect_keystore_connection(&database_url, "default-key-fetch-connect").await?;
            let row = sqlx::query_as::<_, ApiKeyRow>(&format!(
                "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE service_instance_id = ? AND is_default = 1 ORDER BY updated_at DESC, id DESC LIMIT 1"
            ))
            .bind(service_instance_id)
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "default-key-fetch-query",
            })?;

            row.map(api_key_row_to_record).transpose()
        })
    }

    fn create_key(&self, input: NewApiKey) -> KeystoreResult<ApiKeyRecord> {
        let stored_value =
            self.stored_value_for_write(input.key_value, input.value_is_pre_encrypted)?;
        let database_url = self.database_url.clone();
        let service_instance_id = input.service_instance_id;
        let is_default = input.is_default;

        self.run_db_call("key-create", async move {
            let mut connection =
                connect_keystore_connection(&database_url, "key-create-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "key-create-begin",
            })?;

            let key_id = ApiKeyId::new_v7();
            let now = unix_timestamp_seconds();

            // One default per service instance: demote the previous default
            // in the same transaction the new one is written.
            if is_default {
                sqlx::query(
                    "UPDATE api_keys SET is_default = 0, updated_at = ? WHERE service_instance_id = ? AND is_default = 1",
                )
                .bind(now)
                .bind(service_instance_id.clone())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "key-create-demote-previous-default",
                })?;
            }

            sqlx::query(
                "INSERT INTO api_keys (id, service_instance_id, is_default, key_value, usage_count, created_at, updated_at) VALUES (?, ?, ?, ?, 0, ?, ?)",
            )
            .bind(key_id.to_string())
            .bind(service_instance_id.clone())
            .bind(i64::from(is_default))
            .bind(stored_value.clone())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "key-create-insert",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "key-create-commit",
            })?;

            Ok(ApiKeyRecord {
                id: key_id,
                service_instance_id,
                is_default,
                key_value: stored_value,
                usage_count: 0,
                created_at_unix_seconds: i64_to_u64(now, "key-create-created-at")?,
                updated_at_unix_seconds: i64_to_u64(now, "key-create-updated-at")?,
            })
        })
    }

    fn update_key(&self, id: ApiKeyId, patch: ApiKeyPatch) -> KeystoreResult<ApiKeyRecord> {
        let stored_value = patch
            .key_value
            .map(|value| self.stored_value_for_write(value, patch.value_is_pre_encrypted))
            .transpose()?;
        let database_url = self.database_url.clone();
        let is_default = patch.is_default;

        self.run_db_call("key-update", async move {
            let mut connection =
                connect_keystore_connection(&database_url, "key-update-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "key-update-begin",
            })?;

            let service_instance_id = sqlx::query_scalar::<_, String>(
                "SELECT service_instance_id FROM api_keys WHERE id = ?",
            )
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "key-update-load-instance",
            })?
            .ok_or_else(|| {
                NotFoundSnafu {
                    stage: "key-update-missing",
                    id: id.to_string(),
                }
                .build()
            })?;

            let now = unix_timestamp_seconds();

            if is_default == Some(true) {
                sqlx::query(
                    "UPDATE api_keys SET is_default = 0, updated_at = ? WHERE service_instance_id = ? AND is_default = 1 AND id != ?",
                )
                .bind(now)
                .bind(service_instance_id)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "key-update-demote-previous-default",
                })?;
            }

            sqlx::query(
                "UPDATE api_keys SET key_value = COALESCE(?, key_value), is_default = COALESCE(?, is_default), updated_at = ? WHERE id = ?",
            )
            .bind(stored_value)
            .bind(is_default.map(i64::from))
            .bind(now)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "key-update-apply",
            })?;

            let row = sqlx::query_as::<_, ApiKeyRow>(&format!(
                "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = ?"
            ))
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "key-update-load",
            })?
            .ok_or_else(|| {
                NotFoundSnafu {
                    stage: "key-update-load-missing",
                    id: id.to_string(),
                }
                .build()
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "key-update-commit",
            })?;

            api_key_row_to_record(row)
        })
    }

    fn delete_key(&self, id: ApiKeyId) -> KeystoreResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("key-delete", async move {
            let mut connection =
                connect_keystore_connection(&database_url, "key-delete-connect").await?;
            let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "key-delete-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "key-delete-missing",
                    id: id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }

    fn fetch_decrypted_key(&self, id: ApiKeyId) -> KeystoreResult<Option<String>> {
        let Some(record) = self.load_key(id)? else {
            return Ok(None);
        };

        if !record.value_is_encrypted() {
            // Written before a master key existed, or by a deployment that
            // never configured one.
            return Ok(Some(record.key_value));
        }

        let cipher = self.cipher.as_ref().ok_or_else(|| {
            MissingMasterKeySnafu {
                stage: "key-decrypt-cipher",
            }
            .build()
        })?;

        cipher.decrypt(&record.key_value).map(Some)
    }

    fn increment_usage(&self, id: ApiKeyId) -> KeystoreResult<u64> {
        let database_url = self.database_url.clone();
        self.run_db_call("usage-increment", async move {
            let mut connection =
                connect_keystore_connection(&database_url, "usage-increment-connect").await?;
            let now = unix_timestamp_seconds();
            let result = sqlx::query(
                "UPDATE api_keys SET usage_count = usage_count + 1, updated_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(id.to_string())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "usage-increment-apply",
            })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "usage-increment-missing",
                    id: id.to_string(),
                }
                .fail();
            }

            let usage_count =
                sqlx::query_scalar::<_, i64>("SELECT usage_count FROM api_keys WHERE id = ?")
                    .bind(id.to_string())
                    .fetch_one(&mut connection)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "usage-increment-load",
                    })?;

            i64_to_u64(usage_count, "usage-increment-count")
        })
    }
}

#[derive(Debug, FromRow)]
struct ApiKeyRow {
    id: String,
    service_instance_id: String,
    is_default: i64,
    key_value: String,
    usage_count: i64,
    created_at: i64,
    updated_at: i64,
}

fn api_key_row_to_record(row: ApiKeyRow) -> KeystoreResult<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: ApiKeyId::parse(&row.id)?,
        service_instance_id: row.service_instance_id,
        is_default: row.is_default != 0,
        key_value: row.key_value,
        usage_count: i64_to_u64(row.usage_count, "key-row-usage-count")?,
        created_at_unix_seconds: i64_to_u64(row.created_at, "key-row-created-at")?,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "key-row-updated-at")?,
    })
}

async fn connect_keystore_connection(
    database_url: &str,
    stage: &'static str,
) -> KeystoreResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "keystore-connection-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> KeystoreResult<u64> {
    value
        .try_into()
        .map_err(|_| super::error::KeystoreError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn ensure_database_directory(database_location: &str) -> KeystoreResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateDatabaseDirectorySnafu {
            stage: "keystore-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
