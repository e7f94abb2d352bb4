use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, SqliteConnection};

use super::error::{
    CreateDirectorySnafu, InvariantViolationSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu,
    SqliteThreadSpawnSnafu, StorageResult,
};
use super::snapshot::SnapshotStore;
use super::types::unix_timestamp_millis;

/// Primary snapshot channel: a single-table sqlite key/value store.
#[derive(Debug, Clone)]
pub struct SqliteSnapshotStore {
    connect_options: SqliteConnectOptions,
    database_url: String,
}

impl SqliteSnapshotStore {
    pub fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let store = Self {
            connect_options,
            database_url,
        };

        let options = store.connect_options.clone();
        let database_url = store.database_url.clone();
        store.run_db_call("sqlite-open", move || async move {
            let mut connection = connect_store_connection(&options, &database_url).await?;
            sqlx::migrate!("./migrations")
                .run(&mut connection)
                .await
                .context(SqliteMigrateSnafu {
                    stage: "sqlite-open-migrate",
                })?;
            Ok(())
        })?;

        Ok(store)
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn run_db_call<T, F, Fut>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>>,
    {
        // Callable from inside a tokio runtime: the future is built and polled on
        // its own thread and runtime, so it need not be `Send`.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-snapshot-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-snapshot-runtime-build",
                    })?;
                runtime.block_on(op())
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-snapshot-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite snapshot worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn channel(&self) -> &'static str {
        "sqlite"
    }

    fn save(&self, key: &str, payload: &str) -> StorageResult<()> {
        let options = self.connect_options.clone();
        let database_url = self.database_url.clone();
        let key = key.to_string();
        let payload = payload.to_string();
        self.run_db_call("snapshot-save", move || async move {
            let mut connection = connect_store_connection(&options, &database_url).await?;
            let now = i64::try_from(unix_timestamp_millis()).unwrap_or(i64::MAX);
            sqlx::query(
                "INSERT INTO snapshots (key, payload, updated_at) VALUES (?, ?, ?) ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(payload)
            .bind(now)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "snapshot-save-upsert",
            })?;
            Ok(())
        })
    }

    fn load(&self, key: &str) -> StorageResult<Option<String>> {
        let options = self.connect_options.clone();
        let database_url = self.database_url.clone();
        let key = key.to_string();
        self.run_db_call("snapshot-load", move || async move {
            let mut connection = connect_store_connection(&options, &database_url).await?;
            sqlx::query_scalar::<_, String>("SELECT payload FROM snapshots WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "snapshot-load-select",
                })
        })
    }
}

async fn connect_store_connection(
    options: &SqliteConnectOptions,
    database_url: &str,
) -> StorageResult<SqliteConnection> {
    let mut connection = options.connect().await.context(SqliteConnectSnafu {
        stage: "sqlite-snapshot-connect",
        database_url: database_url.to_string(),
    })?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-snapshot-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateDirectorySnafu {
            stage: "sqlite-open-create-directory",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SNAPSHOT_KEY;

    #[test]
    fn sqlite_store_upserts_under_one_key() {
        let directory = tempfile::tempdir().expect("tempdir");
        let location = directory.path().join("state/murmur.db");
        let store = SqliteSnapshotStore::open(&location.display().to_string()).expect("open");

        assert_eq!(store.load(SNAPSHOT_KEY).expect("load empty"), None);
        store.save(SNAPSHOT_KEY, "first").expect("save first");
        store.save(SNAPSHOT_KEY, "second").expect("save second");
        assert_eq!(
            store.load(SNAPSHOT_KEY).expect("load"),
            Some("second".to_string())
        );
    }

    #[test]
    fn database_url_is_normalized() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("sqlite://x.db"), "sqlite://x.db");
        assert_eq!(normalize_database_url("/tmp/x.db"), "sqlite:///tmp/x.db");
    }
}
