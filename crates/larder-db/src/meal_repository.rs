//! Users and persisted meals.
//!
//! A meal is identified by `(user_id, datetime)`, where `datetime` is the
//! local wall-clock time of the meal's earliest intake.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use larder_core::error::AppError;
use larder_core::models::{MealChanges, MealWrite, NewMeal, PersistedMeal, UserRef};
use sqlx::types::Json;
use sqlx::{Pool, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

/// Repository for users and their meals.
///
/// # Examples
///
/// ```no_run
/// use larder_core::DbConfig;
/// use larder_db::{MealRepository, connect};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = connect("larder.db".as_ref(), &DbConfig::default()).await?;
/// let repo = MealRepository::new(pool);
/// let user = repo.register_user("k3y").await?;
/// println!("user {} registered", user.id);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MealRepository {
    pool: Pool<Sqlite>,
}

impl MealRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Registers a user for `participation_key`. Registering an existing key
    /// returns the stored user unchanged.
    pub async fn register_user(&self, participation_key: &str) -> Result<UserRef, AppError> {
        sqlx::query(
            r#"
            INSERT INTO users (participation_key)
            VALUES ($1)
            ON CONFLICT (participation_key) DO NOTHING
            "#,
        )
        .bind(participation_key)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        self.find_user(participation_key)
            .await?
            .ok_or_else(|| AppError::UserNotFound(participation_key.to_string()))
    }

    pub async fn find_user(&self, participation_key: &str) -> Result<Option<UserRef>, AppError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, participation_key, last_meal_log FROM users WHERE participation_key = $1",
        )
        .bind(participation_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(row.map(UserRef::from))
    }

    /// All registered users, ordered by id.
    pub async fn list_users(&self) -> Result<Vec<UserRef>, AppError> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, participation_key, last_meal_log FROM users ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(rows.into_iter().map(UserRef::from).collect())
    }

    /// Meals of one user, ordered by datetime.
    pub async fn meals_for_user(&self, user_id: i64) -> Result<Vec<PersistedMeal>, AppError> {
        let rows = sqlx::query_as::<_, MealRow>(
            r#"
            SELECT id, user_id, description, nutrients, food_ids, eaten_quantities, datetime
            FROM meals
            WHERE user_id = $1
            ORDER BY datetime
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(rows.into_iter().map(PersistedMeal::from).collect())
    }

    /// Applies all `writes` for one user in a single transaction, then sets
    /// the user's `last_meal_log` to the latest stored meal datetime.
    ///
    /// Any failure rolls back every write of the batch.
    pub async fn apply_meal_writes(
        &self,
        user_id: i64,
        writes: &[MealWrite],
    ) -> Result<Option<NaiveDateTime>, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;

        for write in writes {
            match write {
                MealWrite::Insert(meal) => insert_meal(&mut tx, user_id, meal).await?,
                MealWrite::Update {
                    id,
                    datetime,
                    changes,
                } => update_meal(&mut tx, *id, *datetime, changes).await?,
            }
        }

        let latest: Option<(NaiveDateTime,)> = sqlx::query_as(
            "SELECT datetime FROM meals WHERE user_id = $1 ORDER BY datetime DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::DatabaseError)?;
        let last_meal_log = latest.map(|(datetime,)| datetime);

        sqlx::query("UPDATE users SET last_meal_log = $1 WHERE id = $2")
            .bind(last_meal_log)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;

        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(last_meal_log)
    }
}

async fn insert_meal(
    conn: &mut SqliteConnection,
    user_id: i64,
    meal: &NewMeal,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO meals (id, user_id, description, nutrients, food_ids, eaten_quantities, datetime)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(&meal.description)
    .bind(Json(&meal.nutrients))
    .bind(Json(&meal.food_ids))
    .bind(Json(&meal.eaten_quantities))
    .bind(meal.datetime)
    .execute(&mut *conn)
    .await
    .map_err(AppError::DatabaseError)?;

    Ok(())
}

/// Writes only the fields present in `changes`.
async fn update_meal(
    conn: &mut SqliteConnection,
    id: Uuid,
    datetime: NaiveDateTime,
    changes: &MealChanges,
) -> Result<(), AppError> {
    if changes.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE meals SET ");
    let mut set = builder.separated(", ");
    if let Some(description) = &changes.description {
        set.push("description = ");
        set.push_bind_unseparated(description.clone());
    }
    if let Some(nutrients) = &changes.nutrients {
        set.push("nutrients = ");
        set.push_bind_unseparated(Json(nutrients.clone()));
    }
    if let Some(food_ids) = &changes.food_ids {
        set.push("food_ids = ");
        set.push_bind_unseparated(Json(food_ids.clone()));
    }
    if let Some(eaten_quantities) = &changes.eaten_quantities {
        set.push("eaten_quantities = ");
        set.push_bind_unseparated(Json(eaten_quantities.clone()));
    }
    builder.push(" WHERE id = ");
    builder.push_bind(id);

    let result = builder
        .build()
        .execute(&mut *conn)
        .await
        .map_err(AppError::DatabaseError)?;

    if result.rows_affected() == 0 {
        return Err(AppError::Generic(format!(
            "Meal {} at {} disappeared during sync",
            id, datetime
        )));
    }

    tracing::debug!(
        meal = %id,
        %datetime,
        fields = ?changes.changed_fields(),
        "Meal updated"
    );
    Ok(())
}

/// Helper struct for deserializing user rows
#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    participation_key: String,
    last_meal_log: Option<NaiveDateTime>,
}

impl From<UserRow> for UserRef {
    fn from(row: UserRow) -> Self {
        UserRef {
            id: row.id,
            participation_key: row.participation_key,
            last_meal_log: row.last_meal_log,
        }
    }
}

/// Helper struct for deserializing meal rows
#[derive(sqlx::FromRow)]
struct MealRow {
    id: Uuid,
    user_id: i64,
    description: String,
    nutrients: Json<BTreeMap<String, f64>>,
    food_ids: Json<BTreeMap<String, String>>,
    eaten_quantities: Json<BTreeMap<String, f64>>,
    datetime: NaiveDateTime,
}

impl From<MealRow> for PersistedMeal {
    fn from(row: MealRow) -> Self {
        PersistedMeal {
            id: row.id,
            user_id: row.user_id,
            description: row.description,
            nutrients: row.nutrients.0,
            food_ids: row.food_ids.0,
            eaten_quantities: row.eaten_quantities.0,
            datetime: row.datetime,
        }
    }
}

// =============================================================================
// Trait Implementation: MealStore
// =============================================================================

impl larder_core::traits::MealStore for MealRepository {
    async fn find_user(&self, participation_key: &str) -> Result<Option<UserRef>, AppError> {
        MealRepository::find_user(self, participation_key).await
    }

    async fn meals_for_user(&self, user_id: i64) -> Result<Vec<PersistedMeal>, AppError> {
        MealRepository::meals_for_user(self, user_id).await
    }

    async fn apply_meal_writes(
        &self,
        user_id: i64,
        writes: &[MealWrite],
    ) -> Result<Option<NaiveDateTime>, AppError> {
        MealRepository::apply_meal_writes(self, user_id, writes).await
    }
}
