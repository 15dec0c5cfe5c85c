//! Test utilities for integration tests.
//!
//! Provides helpers to open an isolated SQLite database per test and to
//! build sample records and meals.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use larder_core::DbConfig;
use larder_core::models::{CompositeKey, IntakeRecord, NewMeal};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Opens a fresh, migrated database inside a temporary directory.
///
/// # Returns
///
/// A tuple of (SqlitePool, TempDir) - keep the directory alive for the test duration.
pub async fn setup_test_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = larder_db::connect(&dir.path().join("larder.db"), &DbConfig::default())
        .await
        .expect("Failed to open test database");
    (pool, dir)
}

/// A sample record for `key` consumed at `hour:minute` UTC on 2024-05-01.
pub fn sample_record(
    participation_key: &str,
    key: (&str, &str, &str),
    hour: u32,
    minute: u32,
) -> IntakeRecord {
    let mut nutrients = BTreeMap::new();
    nutrients.insert("energy_kcal".to_string(), Some(200.0));
    nutrients.insert("sugar".to_string(), None);

    IntakeRecord {
        key: CompositeKey::new(key.0, key.1, key.2),
        item_seq: 0,
        participation_key: participation_key.to_string(),
        consumed_at: Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap(),
        timezone: Some("Europe/Zurich".to_string()),
        status: Some("annotated".to_string()),
        food_id: Some("food-1".to_string()),
        food_name: Some("Bread".to_string()),
        product_id: None,
        product_barcode: None,
        product_name: None,
        consumed_quantity: Some(80.0),
        consumed_unit: Some("g".to_string()),
        nutrients,
        comments: vec!["toasted".to_string()],
    }
}

pub fn local(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

pub fn sample_meal(user_id: i64, description: &str, kcal: f64, datetime: NaiveDateTime) -> NewMeal {
    NewMeal {
        user_id,
        description: description.to_string(),
        nutrients: BTreeMap::from([("energy_kcal".to_string(), kcal)]),
        food_ids: BTreeMap::from([(description.to_string(), format!("food-{}", description))]),
        eaten_quantities: BTreeMap::from([(description.to_string(), 100.0)]),
        datetime,
    }
}
