//! Change detection and meal synchronization.
//!
//! Pure business logic (outcome classification, meal diffing, write
//! planning) lives next to [`MealSynchronizer`], which applies a user's
//! planned writes through a [`MealStore`].

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::AppError;
use crate::models::{IntakeRecord, MealChanges, MealEvent, MealWrite, NewMeal, PersistedMeal};
use crate::traits::MealStore;

/// Outcome of writing a single record or meal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncOutcome {
    /// Stored value already equal to the incoming one.
    Unchanged,
    /// Stored value replaced.
    Updated,
    /// First time this key was seen.
    Created,
    Failed,
}

/// Counters for a batch of writes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub unchanged: usize,
    pub updated: usize,
    pub created: usize,
    pub failed: usize,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome, incrementing the matching counter.
    pub fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Unchanged => self.unchanged += 1,
            SyncOutcome::Updated => self.updated += 1,
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::Failed => self.failed += 1,
        }
    }

    /// Adds another batch's counters to this one.
    pub fn absorb(&mut self, other: &SyncStats) {
        self.unchanged += other.unchanged;
        self.updated += other.updated;
        self.created += other.created;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.unchanged + self.updated + self.created + self.failed
    }

    pub fn successful(&self) -> usize {
        self.unchanged + self.updated + self.created
    }
}

/// Classifies an incoming record against what the store holds for its key.
pub fn classify_record(existing: Option<&IntakeRecord>, incoming: &IntakeRecord) -> SyncOutcome {
    match existing {
        None => SyncOutcome::Created,
        Some(current) if current == incoming => SyncOutcome::Unchanged,
        Some(_) => SyncOutcome::Updated,
    }
}

/// Compares a stored meal with a freshly computed one.
pub fn diff_meal(existing: &PersistedMeal, fresh: &NewMeal) -> MealChanges {
    MealChanges {
        description: (existing.description != fresh.description)
            .then(|| fresh.description.clone()),
        nutrients: (existing.nutrients != fresh.nutrients).then(|| fresh.nutrients.clone()),
        food_ids: (existing.food_ids != fresh.food_ids).then(|| fresh.food_ids.clone()),
        eaten_quantities: (existing.eaten_quantities != fresh.eaten_quantities)
            .then(|| fresh.eaten_quantities.clone()),
    }
}

/// Matches fresh meals to stored ones on exact `datetime` and plans the
/// writes needed to bring the store up to date.
///
/// Stored meals with no fresh counterpart are left alone. If two fresh
/// meals share a datetime the later one wins.
pub fn plan_meal_writes(
    existing: &[PersistedMeal],
    fresh: Vec<NewMeal>,
) -> (Vec<MealWrite>, SyncStats) {
    let by_datetime: BTreeMap<NaiveDateTime, &PersistedMeal> =
        existing.iter().map(|m| (m.datetime, m)).collect();

    let mut deduped: BTreeMap<NaiveDateTime, NewMeal> = BTreeMap::new();
    for meal in fresh {
        if let Some(previous) = deduped.insert(meal.datetime, meal) {
            tracing::warn!(
                user_id = previous.user_id,
                datetime = %previous.datetime,
                "Two meals share a datetime, keeping the later one"
            );
        }
    }

    let mut writes = Vec::new();
    let mut stats = SyncStats::new();

    for (datetime, meal) in deduped {
        match by_datetime.get(&datetime) {
            Some(stored) => {
                let changes = diff_meal(stored, &meal);
                if changes.is_empty() {
                    stats.record(SyncOutcome::Unchanged);
                } else {
                    stats.record(SyncOutcome::Updated);
                    writes.push(MealWrite::Update {
                        id: stored.id,
                        datetime,
                        changes,
                    });
                }
            }
            None => {
                stats.record(SyncOutcome::Created);
                writes.push(MealWrite::Insert(meal));
            }
        }
    }

    (writes, stats)
}

/// How a participant's synchronization ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum UserSyncStatus {
    Synced,
    /// No user is registered for the participation key.
    UnknownUser,
    Failed(String),
}

/// Result of synchronizing one participant's meals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSyncResult {
    pub participation_key: String,
    pub status: UserSyncStatus,
    pub stats: SyncStats,
    pub last_meal_log: Option<NaiveDateTime>,
}

impl UserSyncResult {
    pub fn unknown_user(participation_key: &str) -> Self {
        Self {
            participation_key: participation_key.to_string(),
            status: UserSyncStatus::UnknownUser,
            stats: SyncStats::new(),
            last_meal_log: None,
        }
    }

    pub fn failed(participation_key: &str, error: &AppError) -> Self {
        Self {
            participation_key: participation_key.to_string(),
            status: UserSyncStatus::Failed(error.to_string()),
            stats: SyncStats::new(),
            last_meal_log: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UserSyncStatus::Synced
    }
}

/// Diff-aware upsert of meal events into a [`MealStore`].
pub struct MealSynchronizer<M: MealStore> {
    store: M,
    nutrient_columns: Vec<String>,
}

impl<M: MealStore> MealSynchronizer<M> {
    pub fn new(store: M, nutrient_columns: Vec<String>) -> Self {
        Self {
            store,
            nutrient_columns,
        }
    }

    /// Synchronizes one participant's meals in a single store transaction.
    ///
    /// An unregistered participant is skipped with a warning. Errors leave
    /// the store as it was before the call.
    pub async fn sync_participant(
        &self,
        participation_key: &str,
        events: &[MealEvent],
    ) -> Result<UserSyncResult, AppError> {
        let Some(user) = self.store.find_user(participation_key).await? else {
            tracing::warn!(
                participant = participation_key,
                "No user registered for participant, skipping meal sync"
            );
            return Ok(UserSyncResult::unknown_user(participation_key));
        };

        let existing = self.store.meals_for_user(user.id).await?;
        let fresh = events
            .iter()
            .map(|event| NewMeal::from_event(user.id, event, &self.nutrient_columns))
            .collect();

        let (writes, stats) = plan_meal_writes(&existing, fresh);
        for write in &writes {
            if let MealWrite::Update {
                datetime, changes, ..
            } = write
            {
                tracing::debug!(
                    participant = participation_key,
                    datetime = %datetime,
                    fields = ?changes.changed_fields(),
                    "Updating meal"
                );
            }
        }

        let last_meal_log = self.store.apply_meal_writes(user.id, &writes).await?;

        tracing::info!(
            participant = participation_key,
            created = stats.created,
            updated = stats.updated,
            unchanged = stats.unchanged,
            "Meals synchronized"
        );

        Ok(UserSyncResult {
            participation_key: participation_key.to_string(),
            status: UserSyncStatus::Synced,
            stats,
            last_meal_log,
        })
    }
}
