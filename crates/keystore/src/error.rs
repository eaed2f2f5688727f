use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum KeystoreError {
    #[snafu(display("api key '{id}' was not found"))]
    NotFound { stage: &'static str, id: String },
    #[snafu(display("api key id '{raw}' is invalid"))]
    InvalidId {
        stage: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("key value is stored encrypted but no master key is configured"))]
    MissingMasterKey { stage: &'static str },
    #[snafu(display("cipher operation failed at {stage}: {details}"))]
    CipherFailure {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("stored key value is malformed at {stage}: {details}"))]
    InvalidStoredValue {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("keystore invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to create keystore directory at {path}"))]
    CreateDatabaseDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to spawn keystore worker thread"))]
    WorkerThreadSpawn {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to initialize keystore worker runtime"))]
    WorkerRuntimeInit {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type KeystoreResult<T> = Result<T, KeystoreError>;
