//! Integration tests for RecordRepository.

use larder_core::Clusterer;
use larder_core::models::{CompositeKey, IntakeRecord};
use larder_core::sync::SyncOutcome;
use larder_db::{MealRepository, RecordRepository};

use crate::integration::common::{sample_record, setup_test_db};

#[tokio::test]
async fn test_upsert_insert_then_get() {
    let (pool, _dir) = setup_test_db().await;
    let repo = RecordRepository::new(pool);

    let record = sample_record("key-1", ("a1", "i1", "t1"), 8, 0);
    let outcome = repo.upsert(&record).await.expect("upsert should succeed");
    assert_eq!(outcome, SyncOutcome::Created);

    let stored = repo
        .get(&CompositeKey::new("a1", "i1", "t1"))
        .await
        .expect("get should succeed")
        .expect("record should exist");
    assert_eq!(stored, record, "record should roundtrip unchanged");
}

#[tokio::test]
async fn test_upsert_same_record_is_unchanged() {
    let (pool, _dir) = setup_test_db().await;
    let repo = RecordRepository::new(pool);
    let record = sample_record("key-1", ("a1", "i1", "t1"), 8, 0);

    repo.upsert(&record).await.unwrap();
    let outcome = repo.upsert(&record).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Unchanged);
}

#[tokio::test]
async fn test_upsert_replaces_changed_record() {
    let (pool, _dir) = setup_test_db().await;
    let repo = RecordRepository::new(pool);
    let original = sample_record("key-1", ("a1", "i1", "t1"), 8, 0);
    repo.upsert(&original).await.unwrap();

    let mut edited = original.clone();
    edited.consumed_quantity = Some(120.0);
    edited
        .nutrients
        .insert("energy_kcal".to_string(), Some(300.0));
    let outcome = repo.upsert(&edited).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Updated);
    let stored = repo.get(&original.key).await.unwrap().unwrap();
    assert_eq!(stored.consumed_quantity, Some(120.0));
    assert_eq!(stored.nutrients["energy_kcal"], Some(300.0));
    assert_eq!(stored.nutrients["sugar"], None, "null nutrients survive storage");
}

#[tokio::test]
async fn test_merge_counts_outcomes_and_preserves_absent_keys() {
    let (pool, _dir) = setup_test_db().await;
    let repo = RecordRepository::new(pool);
    let kept = sample_record("key-1", ("a1", "i1", "t1"), 8, 0);
    let edited = sample_record("key-1", ("a2", "i2", "t2"), 9, 0);
    repo.merge(&[kept.clone(), edited.clone()]).await.unwrap();

    // Second batch re-fetches only `edited` (changed) and adds a new row.
    let mut edited_again = edited.clone();
    edited_again.food_name = Some("Rye bread".to_string());
    let fresh = sample_record("key-2", ("a3", "i3", "t3"), 10, 0);
    let stats = repo
        .merge(&[edited_again.clone(), fresh.clone()])
        .await
        .expect("merge should succeed");

    assert_eq!(stats.created, 1);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.unchanged, 0);
    let all = repo.scan().await.unwrap();
    assert_eq!(all.len(), 3, "rows absent from the batch are kept");
    assert_eq!(all[0], kept);
    assert_eq!(all[1].food_name.as_deref(), Some("Rye bread"));
}

#[tokio::test]
async fn test_merge_twice_is_idempotent() {
    let (pool, _dir) = setup_test_db().await;
    let repo = RecordRepository::new(pool);
    let batch = vec![
        sample_record("key-1", ("a1", "i1", "t1"), 8, 0),
        sample_record("key-1", ("a1", "i1", "t2"), 8, 0),
    ];

    repo.merge(&batch).await.unwrap();
    let before = repo.scan().await.unwrap();
    let stats = repo.merge(&batch).await.unwrap();
    let after = repo.scan().await.unwrap();

    assert_eq!(stats.unchanged, 2);
    assert_eq!(before, after);
}

fn item(
    intake: &str,
    item_id: &str,
    seq: u32,
    name: &str,
    quantity: f64,
    hour: u32,
) -> IntakeRecord {
    let mut record = sample_record("key-1", ("a1", intake, item_id), hour, 0);
    record.item_seq = seq;
    record.food_name = Some(name.to_string());
    record.food_id = Some(format!("food-{}", name));
    record.consumed_quantity = Some(quantity);
    record
}

#[tokio::test]
async fn test_scan_keeps_partner_item_order() {
    let (pool, _dir) = setup_test_db().await;
    let repo = RecordRepository::new(pool);
    repo.merge(&[
        item("i1", "9", 0, "Bread", 80.0, 8),
        item("i1", "10", 1, "Butter", 10.0, 8),
        item("i2", "9", 0, "Tea", 200.0, 12),
        item("i2", "10", 1, "Tea", 300.0, 12),
    ])
    .await
    .unwrap();

    let records = repo.scan_participant("key-1").await.unwrap();
    let items: Vec<&str> = records
        .iter()
        .map(|r| r.key.annotation_item_id.as_str())
        .collect();
    assert_eq!(items, vec!["9", "10", "9", "10"], "\"10\" must not sort before \"9\"");

    let meals = Clusterer::default().meals_for(&records);
    assert_eq!(meals.len(), 2);
    assert_eq!(meals[0].description, "Bread, Butter");
    assert_eq!(meals[1].eaten_quantities["Tea"], 300.0, "later item wins");
}

#[tokio::test]
async fn test_scan_orders_by_time_then_key() {
    let (pool, _dir) = setup_test_db().await;
    let repo = RecordRepository::new(pool);
    repo.merge(&[
        sample_record("key-1", ("a9", "i9", "t9"), 12, 0),
        sample_record("key-1", ("a2", "i1", "t1"), 8, 0),
        sample_record("key-1", ("a1", "i1", "t1"), 8, 0),
    ])
    .await
    .unwrap();

    let ids: Vec<String> = repo
        .scan()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.key.annotation_id)
        .collect();

    assert_eq!(ids, vec!["a1", "a2", "a9"]);
}

#[tokio::test]
async fn test_scan_participant_and_keys() {
    let (pool, _dir) = setup_test_db().await;
    let repo = RecordRepository::new(pool);
    repo.merge(&[
        sample_record("key-b", ("a1", "i1", "t1"), 8, 0),
        sample_record("key-a", ("a2", "i2", "t2"), 9, 0),
        sample_record("key-b", ("a3", "i3", "t3"), 10, 0),
    ])
    .await
    .unwrap();

    let keys = repo.participation_keys().await.unwrap();
    let rows = repo.scan_participant("key-b").await.unwrap();

    assert_eq!(keys, vec!["key-a", "key-b"]);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.participation_key == "key-b"));
}

#[tokio::test]
async fn test_get_missing_returns_none() {
    let (pool, _dir) = setup_test_db().await;
    let repo = RecordRepository::new(pool);

    let result = repo.get(&CompositeKey::new("x", "y", "z")).await.unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_get_stats() {
    let (pool, _dir) = setup_test_db().await;
    let records = RecordRepository::new(pool.clone());
    let meals = MealRepository::new(pool);
    records
        .merge(&[
            sample_record("key-1", ("a1", "i1", "t1"), 8, 0),
            sample_record("key-2", ("a2", "i2", "t2"), 9, 0),
        ])
        .await
        .unwrap();
    meals.register_user("key-1").await.unwrap();

    let stats = records.get_stats().await.expect("stats should succeed");

    assert_eq!(stats.records, 2);
    assert_eq!(stats.participants, 2);
    assert_eq!(stats.users, 1);
    assert_eq!(stats.meals, 0);
    assert!(stats.last_meal.is_none());
}

#[tokio::test]
async fn test_reopening_database_keeps_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("larder.db");
    let config = larder_core::DbConfig::default();
    let record = sample_record("key-1", ("a1", "i1", "t1"), 8, 0);

    {
        let pool = larder_db::connect(&path, &config).await.unwrap();
        RecordRepository::new(pool.clone()).upsert(&record).await.unwrap();
        pool.close().await;
    }
    let pool = larder_db::connect(&path, &config).await.unwrap();
    let stored = RecordRepository::new(pool).scan().await.unwrap();

    assert_eq!(stored, vec![record], "migrations must not wipe existing data");
}
