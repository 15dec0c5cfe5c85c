//! Meal reconstruction from intake records.
//!
//! Two stages, both using the same aggregation rules:
//! 1. rows of one participant are grouped by `intake_id` into [`IntakeGroup`]s;
//! 2. groups sorted by `consumed_at` are chained into [`MealEvent`]s. A new
//!    meal starts when the gap to the previous group exceeds the window, so
//!    a meal can span any length of time.
//!
//! Aggregation: nutrients are summed (null unless at least one input has a
//! value), timestamps take the minimum, names are joined with `", "`, and
//! the name-keyed maps are merged in order with later entries winning.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::config::ClusterConfig;
use crate::models::{IntakeGroup, IntakeRecord, MealEvent};

const NAME_SEPARATOR: &str = ", ";

/// A record ready for grouping: empty rows dropped, product data moved into
/// the food fields where food data is missing, local time computed.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRow {
    pub participation_key: String,
    pub intake_id: String,
    pub consumed_at: DateTime<Utc>,
    pub local_time: NaiveDateTime,
    pub food_id: Option<String>,
    pub food_name: String,
    pub consumed_quantity: Option<f64>,
    pub nutrients: BTreeMap<String, Option<f64>>,
}

fn non_blank(value: Option<&String>) -> Option<&String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Sums two optional values; `None` only when both are `None`.
pub fn sum_optional(acc: Option<f64>, value: Option<f64>) -> Option<f64> {
    match (acc, value) {
        (Some(a), Some(b)) => Some(a + b),
        (None, v) => v,
        (a, None) => a,
    }
}

/// Running aggregate shared by both clustering stages.
struct Aggregate {
    participation_key: String,
    consumed_at: DateTime<Utc>,
    local_time: NaiveDateTime,
    names: Vec<String>,
    nutrients: BTreeMap<String, Option<f64>>,
    food_ids: BTreeMap<String, String>,
    eaten_quantities: BTreeMap<String, f64>,
    intake_ids: Vec<String>,
}

impl Aggregate {
    fn new(
        participation_key: &str,
        consumed_at: DateTime<Utc>,
        local_time: NaiveDateTime,
        columns: &[String],
    ) -> Self {
        Self {
            participation_key: participation_key.to_string(),
            consumed_at,
            local_time,
            names: Vec::new(),
            nutrients: columns.iter().map(|c| (c.clone(), None)).collect(),
            food_ids: BTreeMap::new(),
            eaten_quantities: BTreeMap::new(),
            intake_ids: Vec::new(),
        }
    }

    fn add_times(&mut self, consumed_at: DateTime<Utc>, local_time: NaiveDateTime) {
        self.consumed_at = self.consumed_at.min(consumed_at);
        self.local_time = self.local_time.min(local_time);
    }

    fn add_nutrients(&mut self, nutrients: &BTreeMap<String, Option<f64>>) {
        for (column, total) in self.nutrients.iter_mut() {
            let value = nutrients.get(column).copied().flatten();
            *total = sum_optional(*total, value);
        }
    }

    fn add_row(&mut self, row: &PreparedRow) {
        self.add_times(row.consumed_at, row.local_time);
        self.add_nutrients(&row.nutrients);
        self.names.push(row.food_name.clone());
        if let Some(id) = &row.food_id {
            self.food_ids.insert(row.food_name.clone(), id.clone());
        }
        if let Some(quantity) = row.consumed_quantity {
            self.eaten_quantities.insert(row.food_name.clone(), quantity);
        }
    }

    fn add_group(&mut self, group: &IntakeGroup) {
        self.add_times(group.consumed_at, group.local_time);
        self.add_nutrients(&group.nutrients);
        self.names.push(group.description.clone());
        self.food_ids
            .extend(group.food_ids.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.eaten_quantities
            .extend(group.eaten_quantities.iter().map(|(k, v)| (k.clone(), *v)));
        self.intake_ids.push(group.intake_id.clone());
    }

    fn into_group(self, intake_id: String) -> IntakeGroup {
        IntakeGroup {
            intake_id,
            participation_key: self.participation_key,
            consumed_at: self.consumed_at,
            local_time: self.local_time,
            description: self.names.join(NAME_SEPARATOR),
            nutrients: self.nutrients,
            food_ids: self.food_ids,
            eaten_quantities: self.eaten_quantities,
        }
    }

    fn into_meal(self) -> MealEvent {
        MealEvent {
            participation_key: self.participation_key,
            consumed_at: self.consumed_at,
            local_time: self.local_time,
            description: self.names.join(NAME_SEPARATOR),
            nutrients: self.nutrients,
            food_ids: self.food_ids,
            eaten_quantities: self.eaten_quantities,
            intake_ids: self.intake_ids,
        }
    }
}

/// Groups and clusters one participant's records into meals.
#[derive(Debug, Clone, Default)]
pub struct Clusterer {
    config: ClusterConfig,
}

impl Clusterer {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Drops rows with neither a food nor a product name, falls back to
    /// product id/name where the food ones are blank, and computes local time.
    ///
    /// Row order is preserved.
    pub fn prepare(&self, records: &[IntakeRecord]) -> Vec<PreparedRow> {
        let mut dropped = 0usize;
        let rows: Vec<PreparedRow> = records
            .iter()
            .filter_map(|record| {
                let food_name = non_blank(record.food_name.as_ref())
                    .or(non_blank(record.product_name.as_ref()));
                let Some(food_name) = food_name else {
                    dropped += 1;
                    return None;
                };
                let food_id = non_blank(record.food_id.as_ref())
                    .or(non_blank(record.product_id.as_ref()))
                    .cloned();

                Some(PreparedRow {
                    participation_key: record.participation_key.clone(),
                    intake_id: record.key.intake_id.clone(),
                    consumed_at: record.consumed_at,
                    local_time: record
                        .consumed_at
                        .with_timezone(&self.config.timezone)
                        .naive_local(),
                    food_id,
                    food_name: food_name.clone(),
                    consumed_quantity: record.consumed_quantity,
                    nutrients: record.nutrients.clone(),
                })
            })
            .collect();

        if dropped > 0 {
            tracing::debug!(dropped, "Dropped rows without food or product name");
        }
        rows
    }

    /// Stage 1: one [`IntakeGroup`] per `intake_id`, ordered by intake id.
    ///
    /// Rows are expected to belong to a single participant.
    pub fn group_by_intake(&self, rows: &[PreparedRow]) -> Vec<IntakeGroup> {
        let mut groups: BTreeMap<&str, Aggregate> = BTreeMap::new();

        for row in rows {
            groups
                .entry(row.intake_id.as_str())
                .or_insert_with(|| {
                    Aggregate::new(
                        &row.participation_key,
                        row.consumed_at,
                        row.local_time,
                        &self.config.nutrient_columns,
                    )
                })
                .add_row(row);
        }

        groups
            .into_iter()
            .map(|(intake_id, aggregate)| aggregate.into_group(intake_id.to_string()))
            .collect()
    }

    /// Stage 2: chains groups whose consecutive gaps are within the window.
    pub fn cluster_groups(&self, mut groups: Vec<IntakeGroup>) -> Vec<MealEvent> {
        groups.sort_by_key(|g| g.consumed_at);

        let mut meals = Vec::new();
        let mut current: Option<Aggregate> = None;
        let mut previous: Option<DateTime<Utc>> = None;

        for group in &groups {
            let starts_new = previous
                .map(|prev| group.consumed_at - prev > self.config.window)
                .unwrap_or(true);
            if starts_new {
                if let Some(done) = current.take() {
                    meals.push(done.into_meal());
                }
            }

            current
                .get_or_insert_with(|| {
                    Aggregate::new(
                        &group.participation_key,
                        group.consumed_at,
                        group.local_time,
                        &self.config.nutrient_columns,
                    )
                })
                .add_group(group);
            previous = Some(group.consumed_at);
        }

        if let Some(done) = current {
            meals.push(done.into_meal());
        }
        meals
    }

    /// Runs every stage for one participant's records.
    pub fn meals_for(&self, records: &[IntakeRecord]) -> Vec<MealEvent> {
        let rows = self.prepare(records);
        let groups = self.group_by_intake(&rows);
        self.cluster_groups(groups)
    }
}
