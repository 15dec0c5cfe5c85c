//! Connection pool and schema.

use std::path::Path;

use larder_core::DbConfig;
use larder_core::error::AppError;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

/// Schema statements, applied in order. Each is idempotent.
const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS intake_records (
        annotation_id TEXT NOT NULL,
        intake_id TEXT NOT NULL,
        annotation_item_id TEXT NOT NULL,
        item_seq INTEGER NOT NULL DEFAULT 0,
        participation_key TEXT NOT NULL,
        consumed_at TEXT NOT NULL,
        timezone TEXT,
        status TEXT,
        food_id TEXT,
        food_name TEXT,
        product_id TEXT,
        product_barcode TEXT,
        product_name TEXT,
        consumed_quantity REAL,
        consumed_unit TEXT,
        nutrients TEXT NOT NULL DEFAULT '{}',
        comments TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (annotation_id, intake_id, annotation_item_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_intake_records_participant ON intake_records(participation_key, consumed_at)",
    r#"CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        participation_key TEXT NOT NULL UNIQUE,
        last_meal_log TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS meals (
        id BLOB PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id),
        description TEXT NOT NULL,
        nutrients TEXT NOT NULL DEFAULT '{}',
        food_ids TEXT NOT NULL DEFAULT '{}',
        eaten_quantities TEXT NOT NULL DEFAULT '{}',
        datetime TEXT NOT NULL,
        CONSTRAINT uk_meals_user_datetime UNIQUE (user_id, datetime)
    )"#,
];

/// Opens the SQLite database at `path` in WAL mode and applies the schema.
///
/// The file and its parent directories are created if missing.
///
/// # Examples
///
/// ```no_run
/// use larder_core::DbConfig;
/// use larder_db::{RecordRepository, connect};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = connect("larder.db".as_ref(), &DbConfig::default()).await?;
/// let records = RecordRepository::new(pool);
/// # Ok(())
/// # }
/// ```
pub async fn connect(path: &Path, config: &DbConfig) -> Result<SqlitePool, AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            AppError::Generic(format!("Cannot create {}: {}", parent.display(), e))
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(config.busy_timeout)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(AppError::DatabaseError)?;

    run_migrations(&pool).await?;
    tracing::debug!(path = %path.display(), "Database ready");
    Ok(pool)
}

/// Applies every schema statement. Safe to run on an existing database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    for migration in MIGRATIONS {
        sqlx::query(migration)
            .execute(pool)
            .await
            .map_err(AppError::DatabaseError)?;
    }
    Ok(())
}
