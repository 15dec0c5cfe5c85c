//! Intake record repository.
//!
//! One row per [`CompositeKey`]. Nutrients and comments are stored as JSON
//! text; `consumed_at` is stored as fixed-width UTC text so that it sorts
//! lexically in time order.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use larder_core::error::AppError;
use larder_core::models::{CompositeKey, IntakeRecord, StoreStats};
use larder_core::sync::{SyncOutcome, SyncStats, classify_record};
use sqlx::types::Json;
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool};

/// Column list for SELECT queries. Must remain a const literal since
/// format!() bypasses sqlx compile-time validation.
const RECORD_COLUMNS: &str = "annotation_id, intake_id, annotation_item_id, item_seq, participation_key, consumed_at, timezone, status, food_id, food_name, product_id, product_barcode, product_name, consumed_quantity, consumed_unit, nutrients, comments";

/// Items of one intake come back in partner order, not id order.
const RECORD_ORDER: &str =
    "ORDER BY consumed_at, annotation_id, intake_id, item_seq, annotation_item_id";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Repository for the durable intake record set.
///
/// # Examples
///
/// ```no_run
/// use larder_core::{DbConfig, RecordStore};
/// use larder_db::{RecordRepository, connect};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = connect("larder.db".as_ref(), &DbConfig::default()).await?;
/// let repo = RecordRepository::new(pool);
/// let keys = repo.participation_keys().await?;
/// println!("{} participants on record", keys.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RecordRepository {
    pool: Pool<Sqlite>,
}

impl RecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Retrieves a record by its composite key.
    pub async fn get(&self, key: &CompositeKey) -> Result<Option<IntakeRecord>, AppError> {
        let mut conn = self.pool.acquire().await.map_err(AppError::DatabaseError)?;
        fetch_record(&mut conn, key).await
    }

    /// Inserts or replaces one record, reporting what changed.
    pub async fn upsert(&self, record: &IntakeRecord) -> Result<SyncOutcome, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        let outcome = merge_one(&mut tx, record).await?;
        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(outcome)
    }

    /// Upserts a batch in a single transaction.
    ///
    /// Rows whose stored value already equals the incoming one are not
    /// rewritten. Keys not present in `records` are never touched.
    pub async fn merge(&self, records: &[IntakeRecord]) -> Result<SyncStats, AppError> {
        let mut stats = SyncStats::new();
        if records.is_empty() {
            return Ok(stats);
        }

        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        for record in records {
            stats.record(merge_one(&mut tx, record).await?);
        }
        tx.commit().await.map_err(AppError::DatabaseError)?;

        tracing::debug!(
            created = stats.created,
            updated = stats.updated,
            unchanged = stats.unchanged,
            "Record batch merged"
        );
        Ok(stats)
    }

    /// Every record, ordered by `consumed_at`, then annotation and intake,
    /// then partner item order.
    pub async fn scan(&self) -> Result<Vec<IntakeRecord>, AppError> {
        let query = format!("SELECT {} FROM intake_records {}", RECORD_COLUMNS, RECORD_ORDER);
        let rows = sqlx::query_as::<_, RecordRow>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        rows.into_iter().map(IntakeRecord::try_from).collect()
    }

    /// Records of one participant, in the same order as [`scan`](Self::scan).
    pub async fn scan_participant(
        &self,
        participation_key: &str,
    ) -> Result<Vec<IntakeRecord>, AppError> {
        let query = format!(
            "SELECT {} FROM intake_records WHERE participation_key = $1 {}",
            RECORD_COLUMNS, RECORD_ORDER
        );
        let rows = sqlx::query_as::<_, RecordRow>(&query)
            .bind(participation_key)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        rows.into_iter().map(IntakeRecord::try_from).collect()
    }

    /// Distinct participation keys, sorted.
    pub async fn participation_keys(&self) -> Result<Vec<String>, AppError> {
        let keys: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT participation_key FROM intake_records ORDER BY participation_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(keys.into_iter().map(|(key,)| key).collect())
    }

    /// Returns aggregated counts over records, users and meals.
    pub async fn get_stats(&self) -> Result<StoreStats, AppError> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM intake_records) as records,
                (SELECT COUNT(DISTINCT participation_key) FROM intake_records) as participants,
                (SELECT COUNT(*) FROM users) as users,
                (SELECT COUNT(*) FROM meals) as meals
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        let last_meal: Option<(NaiveDateTime,)> =
            sqlx::query_as("SELECT datetime FROM meals ORDER BY datetime DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::DatabaseError)?;

        Ok(StoreStats {
            records: row.records,
            participants: row.participants,
            users: row.users,
            meals: row.meals,
            last_meal: last_meal.map(|(datetime,)| datetime),
        })
    }
}

async fn fetch_record(
    conn: &mut SqliteConnection,
    key: &CompositeKey,
) -> Result<Option<IntakeRecord>, AppError> {
    let query = format!(
        "SELECT {} FROM intake_records WHERE annotation_id = $1 AND intake_id = $2 AND annotation_item_id = $3",
        RECORD_COLUMNS
    );
    let row = sqlx::query_as::<_, RecordRow>(&query)
        .bind(&key.annotation_id)
        .bind(&key.intake_id)
        .bind(&key.annotation_item_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::DatabaseError)?;

    row.map(IntakeRecord::try_from).transpose()
}

async fn merge_one(
    conn: &mut SqliteConnection,
    record: &IntakeRecord,
) -> Result<SyncOutcome, AppError> {
    let existing = fetch_record(conn, &record.key).await?;
    let outcome = classify_record(existing.as_ref(), record);
    if outcome != SyncOutcome::Unchanged {
        write_record(conn, record).await?;
    }
    Ok(outcome)
}

async fn write_record(conn: &mut SqliteConnection, record: &IntakeRecord) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO intake_records (
            annotation_id,
            intake_id,
            annotation_item_id,
            item_seq,
            participation_key,
            consumed_at,
            timezone,
            status,
            food_id,
            food_name,
            product_id,
            product_barcode,
            product_name,
            consumed_quantity,
            consumed_unit,
            nutrients,
            comments
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ON CONFLICT (annotation_id, intake_id, annotation_item_id)
        DO UPDATE SET
            item_seq = EXCLUDED.item_seq,
            participation_key = EXCLUDED.participation_key,
            consumed_at = EXCLUDED.consumed_at,
            timezone = EXCLUDED.timezone,
            status = EXCLUDED.status,
            food_id = EXCLUDED.food_id,
            food_name = EXCLUDED.food_name,
            product_id = EXCLUDED.product_id,
            product_barcode = EXCLUDED.product_barcode,
            product_name = EXCLUDED.product_name,
            consumed_quantity = EXCLUDED.consumed_quantity,
            consumed_unit = EXCLUDED.consumed_unit,
            nutrients = EXCLUDED.nutrients,
            comments = EXCLUDED.comments
        "#,
    )
    .bind(&record.key.annotation_id)
    .bind(&record.key.intake_id)
    .bind(&record.key.annotation_item_id)
    .bind(i64::from(record.item_seq))
    .bind(&record.participation_key)
    .bind(encode_timestamp(&record.consumed_at))
    .bind(&record.timezone)
    .bind(&record.status)
    .bind(&record.food_id)
    .bind(&record.food_name)
    .bind(&record.product_id)
    .bind(&record.product_barcode)
    .bind(&record.product_name)
    .bind(record.consumed_quantity)
    .bind(&record.consumed_unit)
    .bind(Json(&record.nutrients))
    .bind(Json(&record.comments))
    .execute(&mut *conn)
    .await
    .map_err(AppError::DatabaseError)?;

    Ok(())
}

fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Generic(format!("Invalid stored timestamp '{}': {}", raw, e)))
}

/// Helper struct for deserializing intake record rows
#[derive(sqlx::FromRow)]
struct RecordRow {
    annotation_id: String,
    intake_id: String,
    annotation_item_id: String,
    item_seq: i64,
    participation_key: String,
    consumed_at: String,
    timezone: Option<String>,
    status: Option<String>,
    food_id: Option<String>,
    food_name: Option<String>,
    product_id: Option<String>,
    product_barcode: Option<String>,
    product_name: Option<String>,
    consumed_quantity: Option<f64>,
    consumed_unit: Option<String>,
    nutrients: Json<BTreeMap<String, Option<f64>>>,
    comments: Json<Vec<String>>,
}

impl TryFrom<RecordRow> for IntakeRecord {
    type Error = AppError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(IntakeRecord {
            consumed_at: decode_timestamp(&row.consumed_at)?,
            key: CompositeKey::new(row.annotation_id, row.intake_id, row.annotation_item_id),
            item_seq: u32::try_from(row.item_seq).map_err(|_| {
                AppError::Generic(format!("Invalid stored item position {}", row.item_seq))
            })?,
            participation_key: row.participation_key,
            timezone: row.timezone,
            status: row.status,
            food_id: row.food_id,
            food_name: row.food_name,
            product_id: row.product_id,
            product_barcode: row.product_barcode,
            product_name: row.product_name,
            consumed_quantity: row.consumed_quantity,
            consumed_unit: row.consumed_unit,
            nutrients: row.nutrients.0,
            comments: row.comments.0,
        })
    }
}

/// Helper struct for deserializing stats query results
#[derive(sqlx::FromRow)]
struct StatsRow {
    records: i64,
    participants: i64,
    users: i64,
    meals: i64,
}

// =============================================================================
// Trait Implementation: RecordStore
// =============================================================================

impl larder_core::traits::RecordStore for RecordRepository {
    async fn get(&self, key: &CompositeKey) -> Result<Option<IntakeRecord>, AppError> {
        RecordRepository::get(self, key).await
    }

    async fn upsert(&self, record: &IntakeRecord) -> Result<SyncOutcome, AppError> {
        RecordRepository::upsert(self, record).await
    }

    async fn merge(&self, records: &[IntakeRecord]) -> Result<SyncStats, AppError> {
        RecordRepository::merge(self, records).await
    }

    async fn scan(&self) -> Result<Vec<IntakeRecord>, AppError> {
        RecordRepository::scan(self).await
    }

    async fn scan_participant(
        &self,
        participation_key: &str,
    ) -> Result<Vec<IntakeRecord>, AppError> {
        RecordRepository::scan_participant(self, participation_key).await
    }

    async fn participation_keys(&self) -> Result<Vec<String>, AppError> {
        RecordRepository::participation_keys(self).await
    }
}
