use std::env;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};

use murmur_keystore::{
    ApiKeyId, ApiKeyPatch, ApiKeyStore, ENCRYPTED_VALUE_PREFIX, KeyCipher, KeystoreError,
    LenientKeystore, MasterKeyCipher, NewApiKey, SqliteKeystore,
};

const RUNNER_MASTER_KEY: &str = "qa-master-key";

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    SchemaInit,
    KeyCrud,
    DefaultSwap,
    EncryptRoundtrip,
    PreEncryptedPassthrough,
    MissingKeyGuard,
    UsageIncrement,
    LenientFallback,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "schema_init" => Some(Self::SchemaInit),
            "key_crud" => Some(Self::KeyCrud),
            "default_swap" => Some(Self::DefaultSwap),
            "encrypt_roundtrip" => Some(Self::EncryptRoundtrip),
            "pre_encrypted_passthrough" => Some(Self::PreEncryptedPassthrough),
            "missing_key_guard" => Some(Self::MissingKeyGuard),
            "usage_increment" => Some(Self::UsageIncrement),
            "lenient_fallback" => Some(Self::LenientFallback),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::SchemaInit => "schema_init",
            Self::KeyCrud => "key_crud",
            Self::DefaultSwap => "default_swap",
            Self::EncryptRoundtrip => "encrypt_roundtrip",
            Self::PreEncryptedPassthrough => "pre_encrypted_passthrough",
            Self::MissingKeyGuard => "missing_key_guard",
            Self::UsageIncrement => "usage_increment",
            Self::LenientFallback => "lenient_fallback",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("keystore validation failed: {source}"))]
    KeystoreValidation {
        stage: &'static str,
        source: KeystoreError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::KeyCrud => run_key_crud(require_db_path(&args, "key_crud")?).await,
        Scenario::DefaultSwap => run_default_swap(require_db_path(&args, "default_swap")?).await,
        Scenario::EncryptRoundtrip => {
            run_encrypt_roundtrip(require_db_path(&args, "encrypt_roundtrip")?).await
        }
        Scenario::PreEncryptedPassthrough => {
            run_pre_encrypted_passthrough(require_db_path(&args, "pre_encrypted_passthrough")?)
                .await
        }
        Scenario::MissingKeyGuard => {
            run_missing_key_guard(require_db_path(&args, "missing_key_guard")?).await
        }
        Scenario::UsageIncrement => {
            run_usage_increment(require_db_path(&args, "usage_increment")?).await
        }
        Scenario::LenientFallback => {
            run_lenient_fallback(require_db_path(&args, "lenient_fallback")?).await
        }
        Scenario::All => run_all(require_db_path(&args, "all")?).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    // The parser is intentionally strict to keep scenario execution
    // deterministic in CI.
    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}

fn runner_cipher() -> Option<Arc<dyn KeyCipher>> {
    Some(Arc::new(MasterKeyCipher::new(RUNNER_MASTER_KEY)))
}

async fn open_store(
    db_path: &str,
    cipher: Option<Arc<dyn KeyCipher>>,
    stage: &'static str,
) -> RunnerResult<SqliteKeystore> {
    SqliteKeystore::open(db_path, cipher)
        .await
        .context(KeystoreValidationSnafu { stage })
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let id = ApiKeyId::new_v7();
    let parsed = ApiKeyId::parse(&id.to_string()).context(KeystoreValidationSnafu {
        stage: "scenario-id-roundtrip",
    })?;

    if parsed != id {
        return ScenarioFailedSnafu {
            stage: "scenario-id-roundtrip",
            scenario: "id_roundtrip",
            reason: "parsed id does not equal the formatted source".to_string(),
        }
        .fail();
    }

    println!("id_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let invalid_id_error = ApiKeyId::parse("not-a-valid-uuid").is_err();

    println!("invalid_id_error={invalid_id_error}");
    if !invalid_id_error {
        return ScenarioFailedSnafu {
            stage: "scenario-id-invalid",
            scenario: "id_invalid",
            reason: "malformed UUID input was accepted".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, None, "scenario-schema-init-open").await?;

    let table_count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'api_keys'",
    )
    .fetch_one(store.pool())
    .await
    .map_err(|error| RunnerError::ScenarioFailed {
        stage: "scenario-schema-init-query",
        scenario: "schema_init",
        reason: error.to_string(),
    })?;

    println!("api_keys_table_present={}", table_count == 1);
    println!("encryption_enabled={}", store.encryption_enabled());
    ensure("schema_init", "api_keys table missing", table_count == 1)?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_key_crud(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, None, "scenario-key-crud-open").await?;
    let stage = KeystoreValidationSnafu {
        stage: "scenario-key-crud",
    };

    let created = store
        .create_key(NewApiKey::plaintext("crud-instance", "sk-crud-1").as_default())
        .context(stage)?;
    println!("created_id={}", created.id);

    let fetched = store.fetch_default_key("crud-instance").context(stage)?;
    ensure(
        "key_crud",
        "default fetch returned the wrong row",
        fetched.as_ref().map(|record| record.id) == Some(created.id),
    )?;

    let updated = store
        .update_key(
            created.id,
            ApiKeyPatch {
                key_value: Some("sk-crud-2".to_string()),
                ..ApiKeyPatch::default()
            },
        )
        .context(stage)?;
    ensure(
        "key_crud",
        "update did not apply the new value",
        updated.key_value == "sk-crud-2",
    )?;

    store.delete_key(created.id).context(stage)?;
    let after_delete = store.fetch_default_key("crud-instance").context(stage)?;
    ensure("key_crud", "row survived delete", after_delete.is_none())?;

    println!("key_crud=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_default_swap(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, None, "scenario-default-swap-open").await?;
    let stage = KeystoreValidationSnafu {
        stage: "scenario-default-swap",
    };

    let first = store
        .create_key(NewApiKey::plaintext("swap-instance", "sk-swap-a").as_default())
        .context(stage)?;
    let second = store
        .create_key(NewApiKey::plaintext("swap-instance", "sk-swap-b").as_default())
        .context(stage)?;

    let current = store.fetch_default_key("swap-instance").context(stage)?;
    ensure(
        "default_swap",
        "newest default did not win",
        current.as_ref().map(|record| record.id) == Some(second.id),
    )?;

    let demoted = store.update_key(first.id, ApiKeyPatch::default()).context(stage)?;
    ensure(
        "default_swap",
        "previous default was not demoted",
        !demoted.is_default,
    )?;

    println!("default_swap=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_encrypt_roundtrip(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, runner_cipher(), "scenario-encrypt-open").await?;
    let stage = KeystoreValidationSnafu {
        stage: "scenario-encrypt-roundtrip",
    };

    let created = store
        .create_key(NewApiKey::plaintext("encrypt-instance", "sk-encrypt-secret"))
        .context(stage)?;
    println!("value_is_encrypted={}", created.value_is_encrypted());
    ensure(
        "encrypt_roundtrip",
        "plaintext write was not encrypted at rest",
        created.value_is_encrypted(),
    )?;

    let decrypted = store.fetch_decrypted_key(created.id).context(stage)?;
    ensure(
        "encrypt_roundtrip",
        "decrypted value does not match the original",
        decrypted.as_deref() == Some("sk-encrypt-secret"),
    )?;

    println!("encrypt_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_pre_encrypted_passthrough(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, runner_cipher(), "scenario-passthrough-open").await?;
    let stage = KeystoreValidationSnafu {
        stage: "scenario-pre-encrypted-passthrough",
    };

    let cipher = MasterKeyCipher::new(RUNNER_MASTER_KEY);
    let already_encrypted = cipher.encrypt("sk-pre-encrypted").context(stage)?;

    let created = store
        .create_key(NewApiKey {
            service_instance_id: "passthrough-instance".to_string(),
            is_default: false,
            key_value: already_encrypted.clone(),
            value_is_pre_encrypted: true,
        })
        .context(stage)?;
    ensure(
        "pre_encrypted_passthrough",
        "pre-encrypted value was re-wrapped on write",
        created.key_value == already_encrypted
            && created.key_value.starts_with(ENCRYPTED_VALUE_PREFIX),
    )?;

    let decrypted = store.fetch_decrypted_key(created.id).context(stage)?;
    ensure(
        "pre_encrypted_passthrough",
        "stored value did not decrypt back to the original",
        decrypted.as_deref() == Some("sk-pre-encrypted"),
    )?;

    println!("pre_encrypted_passthrough=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_missing_key_guard(db_path: &str) -> RunnerResult<()> {
    let writer = open_store(db_path, runner_cipher(), "scenario-guard-writer-open").await?;
    let created = writer
        .create_key(NewApiKey::plaintext("guard-instance", "sk-guarded"))
        .context(KeystoreValidationSnafu {
            stage: "scenario-missing-key-guard-create",
        })?;

    let reader = open_store(db_path, None, "scenario-guard-reader-open").await?;
    let guard_rejected = matches!(
        reader.fetch_decrypted_key(created.id),
        Err(KeystoreError::MissingMasterKey { .. })
    );

    println!("missing_master_key_rejected={guard_rejected}");
    ensure(
        "missing_key_guard",
        "encrypted value was readable without the master key",
        guard_rejected,
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_usage_increment(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, None, "scenario-usage-open").await?;
    let stage = KeystoreValidationSnafu {
        stage: "scenario-usage-increment",
    };

    let created = store
        .create_key(NewApiKey::plaintext("usage-instance", "sk-usage"))
        .context(stage)?;

    let first = store.increment_usage(created.id).context(stage)?;
    let second = store.increment_usage(created.id).context(stage)?;
    println!("usage_counts={first},{second}");
    ensure(
        "usage_increment",
        "usage counter did not count 1 then 2",
        first == 1 && second == 2,
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_lenient_fallback(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, None, "scenario-lenient-open").await?;
    let keystore = LenientKeystore::new(store);
    let missing_id = ApiKeyId::new_v7();

    // Every miss degrades to null/false; none of these may surface an error.
    let deleted = keystore.delete_key(missing_id);
    let updated = keystore.update_key(missing_id, ApiKeyPatch::default());
    let incremented = keystore.increment_usage(missing_id);
    let fetched = keystore.fetch_decrypted_key(missing_id);

    println!(
        "lenient_results={deleted},{},{},{}",
        updated.is_some(),
        incremented.is_some(),
        fetched.is_some()
    );
    ensure(
        "lenient_fallback",
        "a missing-row operation did not degrade to null/false",
        !deleted && updated.is_none() && incremented.is_none() && fetched.is_none(),
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_all(db_path: &str) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;
    run_schema_init(db_path).await?;
    run_key_crud(db_path).await?;
    run_default_swap(db_path).await?;
    run_encrypt_roundtrip(db_path).await?;
    run_pre_encrypted_passthrough(db_path).await?;
    run_missing_key_guard(db_path).await?;
    run_usage_increment(db_path).await?;
    run_lenient_fallback(db_path).await?;
    Ok(())
}

fn ensure(scenario: &'static str, reason: &str, condition: bool) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }

    ScenarioFailedSnafu {
        stage: "scenario-ensure",
        scenario,
        reason: reason.to_string(),
    }
    .fail()
}
