//! Integration tests for PipelineService.
//!
//! Each test wires the mock partner API and mock stores into a
//! `PipelineService` and checks the stores afterwards.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use larder_core::harvest::annotations_path;
use larder_core::models::{CompositeKey, IntakeRecord, PersistedMeal};
use larder_core::{
    HarvestMode, MealService, PipelineService, SilentReporter, TracingReporter, UserSyncStatus,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::integration::common::{
    Annotation, COHORT, MockMealStore, MockPartnerApi, MockRecordStore, annotation_page,
    test_config,
};

fn local(s: &str) -> NaiveDateTime {
    s.parse().unwrap()
}

/// Four intakes on 2024-05-01 (UTC): 08:00, 08:20, 08:45 and 12:00.
fn day_of_meals() -> Vec<Annotation<'static>> {
    vec![
        Annotation {
            id: "a-1",
            intake_id: "i-1",
            consumed_at: "2024-05-01T08:00:00Z",
            items: vec![
                ("t-1", "Coffee", Some(200.0), 1.0),
                ("t-2", "Croissant", Some(60.0), 400.0),
            ],
        },
        Annotation {
            id: "a-2",
            intake_id: "i-2",
            consumed_at: "2024-05-01T08:20:00Z",
            items: vec![("t-3", "Orange juice", Some(250.0), 40.0)],
        },
        Annotation {
            id: "a-3",
            intake_id: "i-3",
            consumed_at: "2024-05-01T08:45:00Z",
            items: vec![("t-4", "Yogurt", None, 60.0)],
        },
        Annotation {
            id: "a-4",
            intake_id: "i-4",
            consumed_at: "2024-05-01T12:00:00Z",
            items: vec![("t-5", "Pasta", Some(300.0), 150.0)],
        },
    ]
}

fn single_meal(id: &'static str, at: &'static str) -> Vec<Annotation<'static>> {
    vec![Annotation {
        id,
        intake_id: id,
        consumed_at: at,
        items: vec![("t-1", "Apple", Some(150.0), 52.0)],
    }]
}

#[tokio::test]
async fn test_run_builds_meals_from_chained_intakes() {
    // Arrange
    let api = MockPartnerApi::cohort(&[("p1", "key-1", annotation_page(&day_of_meals(), None))]);
    let records = MockRecordStore::new();
    let meals = MockMealStore::new();
    let user_id = meals.add_user("key-1");
    let pipeline = PipelineService::with_config(api, records.clone(), meals.clone(), test_config());

    // Act
    let summary = pipeline.run(COHORT, HarvestMode::Full).await.unwrap();

    // Assert
    assert_eq!(records.len(), 5, "one row per (annotation, intake, item)");
    assert_eq!(summary.synced(), 1);

    let stored = meals.meals(user_id);
    assert_eq!(stored.len(), 2, "08:00, 08:20 and 08:45 chain into one meal");

    let breakfast = &stored[0];
    assert_eq!(breakfast.datetime, local("2024-05-01T10:00:00"), "Zurich wall-clock time");
    assert_eq!(breakfast.description, "Coffee, Croissant, Orange juice, Yogurt");
    // 2 + 240 + 100 kcal; yogurt has no quantity and adds nothing
    assert_eq!(breakfast.nutrients["energy_kcal"], 342.0);
    assert!(
        !breakfast.eaten_quantities.contains_key("Yogurt"),
        "missing quantity is not recorded as zero"
    );
    assert_eq!(breakfast.food_ids["Croissant"], "food-Croissant");

    let lunch = &stored[1];
    assert_eq!(lunch.datetime, local("2024-05-01T14:00:00"));
    assert_eq!(lunch.nutrients["energy_kcal"], 450.0);

    assert_eq!(
        meals.user(user_id).unwrap().last_meal_log,
        Some(local("2024-05-01T14:00:00")),
        "bookkeeping points at the latest meal"
    );
}

#[tokio::test]
async fn test_run_is_idempotent() {
    // Arrange
    let api = MockPartnerApi::cohort(&[("p1", "key-1", annotation_page(&day_of_meals(), None))]);
    let records = MockRecordStore::new();
    let meals = MockMealStore::new();
    let user_id = meals.add_user("key-1");
    let pipeline = PipelineService::with_config(api, records.clone(), meals.clone(), test_config());

    // Act
    pipeline.run(COHORT, HarvestMode::Full).await.unwrap();
    let first_records = records.snapshot();
    let first_meals = meals.meals(user_id);
    let second = pipeline.run(COHORT, HarvestMode::Full).await.unwrap();

    // Assert
    assert_eq!(records.snapshot(), first_records, "record set must not change");
    assert_eq!(meals.meals(user_id), first_meals, "meals must not change");

    let reconcile = second.harvest.as_ref().unwrap().reconcile.as_ref().unwrap();
    assert_eq!(reconcile.stats.unchanged, 5);
    assert_eq!(reconcile.stats.created, 0);
    assert_eq!(second.meals_written(), (0, 0));
}

#[tokio::test]
async fn test_merge_preserves_rows_not_refetched() {
    // Arrange
    let records = MockRecordStore::new();
    let old = IntakeRecord {
        key: CompositeKey::new("old-a", "old-i", "old-t"),
        item_seq: 0,
        participation_key: "key-1".to_string(),
        consumed_at: "2024-04-01T08:00:00Z".parse().unwrap(),
        timezone: None,
        status: Some("annotated".to_string()),
        food_id: Some("food-Tea".to_string()),
        food_name: Some("Tea".to_string()),
        product_id: None,
        product_barcode: None,
        product_name: None,
        consumed_quantity: Some(250.0),
        consumed_unit: Some("ml".to_string()),
        nutrients: BTreeMap::from([("energy_kcal".to_string(), Some(2.5))]),
        comments: vec![],
    };
    records.insert(old.clone());

    let api = MockPartnerApi::cohort(&[(
        "p1",
        "key-1",
        annotation_page(&single_meal("a-9", "2024-05-01T08:00:00Z"), None),
    )]);
    let meals = MockMealStore::new();
    let pipeline = PipelineService::with_config(api, records.clone(), meals, test_config());

    // Act
    pipeline
        .run(COHORT, HarvestMode::Windowed { days: 3 })
        .await
        .unwrap();

    // Assert
    let snapshot = records.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.get(&old.key), Some(&old), "old row must survive unchanged");
}

#[tokio::test]
async fn test_refetched_row_overwrites_stored_row() {
    // Arrange
    let api = MockPartnerApi::cohort(&[(
        "p1",
        "key-1",
        annotation_page(&single_meal("a-1", "2024-05-01T08:00:00Z"), None),
    )]);
    let records = MockRecordStore::new();
    let meals = MockMealStore::new();
    let pipeline = PipelineService::with_config(api, records.clone(), meals, test_config());
    pipeline.run(COHORT, HarvestMode::Full).await.unwrap();

    let key = CompositeKey::new("a-1", "a-1", "t-1");
    let mut stale = records.snapshot()[&key].clone();
    stale.consumed_quantity = Some(1.0);
    records.insert(stale);

    // Act
    let summary = pipeline.run(COHORT, HarvestMode::Full).await.unwrap();

    // Assert
    assert_eq!(records.snapshot()[&key].consumed_quantity, Some(150.0));
    assert_eq!(summary.harvest.unwrap().reconcile.unwrap().stats.updated, 1);
}

#[tokio::test]
async fn test_existing_meal_updates_only_changed_fields() {
    // Arrange
    let api = MockPartnerApi::cohort(&[(
        "p1",
        "key-1",
        annotation_page(&single_meal("a-1", "2024-05-01T08:00:00Z"), None),
    )]);
    let meals = MockMealStore::new();
    let user_id = meals.add_user("key-1");
    let existing_id = Uuid::new_v4();
    meals.insert_meal(PersistedMeal {
        id: existing_id,
        user_id,
        description: "Pear".to_string(),
        nutrients: BTreeMap::from([("energy_kcal".to_string(), 78.0)]),
        food_ids: BTreeMap::from([("Apple".to_string(), "food-Apple".to_string())]),
        eaten_quantities: BTreeMap::from([("Apple".to_string(), 150.0)]),
        datetime: local("2024-05-01T10:00:00"),
    });
    let pipeline =
        PipelineService::with_config(api, MockRecordStore::new(), meals.clone(), test_config());

    // Act
    let summary = pipeline.run(COHORT, HarvestMode::Full).await.unwrap();

    // Assert
    let stored = meals.meals(user_id);
    assert_eq!(stored.len(), 1, "same (user, datetime) must not insert");
    assert_eq!(stored[0].id, existing_id);
    assert_eq!(stored[0].description, "Apple");
    assert_eq!(stored[0].nutrients["energy_kcal"], 78.0);
    assert_eq!(summary.meals_written(), (0, 1));
}

#[tokio::test]
async fn test_user_failure_is_isolated() {
    // Arrange
    let api = MockPartnerApi::cohort(&[
        ("p1", "key-a", annotation_page(&single_meal("a-1", "2024-05-01T08:00:00Z"), None)),
        ("p2", "key-b", annotation_page(&single_meal("a-2", "2024-05-01T09:00:00Z"), None)),
        ("p3", "key-c", annotation_page(&single_meal("a-3", "2024-05-01T10:00:00Z"), None)),
    ]);
    let meals = MockMealStore::new();
    let a = meals.add_user("key-a");
    let b = meals.add_user("key-b");
    let c = meals.add_user("key-c");
    meals.fail_writes_for(b);
    let pipeline =
        PipelineService::with_config(api, MockRecordStore::new(), meals.clone(), test_config());

    // Act
    let summary = pipeline.run(COHORT, HarvestMode::Full).await.unwrap();

    // Assert
    assert_eq!(summary.synced(), 2);
    assert_eq!(summary.failed_users(), vec!["key-b"]);
    assert_eq!(meals.meals(a).len(), 1, "A is synchronized");
    assert!(meals.meals(b).is_empty(), "B is rolled back");
    assert_eq!(meals.meals(c).len(), 1, "C is synchronized");
}

#[tokio::test]
async fn test_unknown_user_is_skipped() {
    // Arrange
    let api = MockPartnerApi::cohort(&[
        ("p1", "key-a", annotation_page(&single_meal("a-1", "2024-05-01T08:00:00Z"), None)),
        ("p2", "key-b", annotation_page(&single_meal("a-2", "2024-05-01T09:00:00Z"), None)),
    ]);
    let meals = MockMealStore::new();
    let a = meals.add_user("key-a");
    let pipeline =
        PipelineService::with_config(api, MockRecordStore::new(), meals.clone(), test_config());

    // Act
    let summary = pipeline
        .run_with_progress_cancellable(
            COHORT,
            HarvestMode::Full,
            &TracingReporter,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(summary.synced(), 1);
    assert_eq!(summary.unknown_users(), 1);
    assert_eq!(meals.meals(a).len(), 1);
}

#[tokio::test]
async fn test_failed_harvest_excludes_participant_and_reports_missing() {
    // Arrange
    let api = MockPartnerApi::cohort(&[
        ("p1", "key-a", annotation_page(&single_meal("a-1", "2024-05-01T08:00:00Z"), None)),
        ("p2", "key-b", annotation_page(&single_meal("a-2", "2024-05-01T09:00:00Z"), None)),
    ])
    .with_failing_path(&annotations_path("p2"));
    let meals = MockMealStore::new();
    meals.add_user("key-a");
    meals.add_user("key-b");
    let pipeline = PipelineService::with_config(api, MockRecordStore::new(), meals, test_config());

    // Act
    let summary = pipeline.run(COHORT, HarvestMode::Full).await.unwrap();

    // Assert
    let harvest = summary.harvest.as_ref().unwrap();
    assert_eq!(harvest.failed, vec!["key-b".to_string()]);
    assert_eq!(
        harvest.reconcile.as_ref().unwrap().missing_participants,
        vec!["key-b".to_string()],
        "consistency check names the missing participant"
    );
    let keys: Vec<&str> = summary
        .users
        .iter()
        .map(|u| u.participation_key.as_str())
        .collect();
    assert_eq!(keys, vec!["key-a"]);
}

#[tokio::test]
async fn test_rebuild_meals_offline() {
    // Arrange: harvest once, then rebuild without the API
    let api = MockPartnerApi::cohort(&[("p1", "key-1", annotation_page(&day_of_meals(), None))]);
    let records = MockRecordStore::new();
    let meals = MockMealStore::new();
    let pipeline =
        PipelineService::with_config(api.clone(), records.clone(), meals.clone(), test_config());
    pipeline
        .harvest_and_reconcile(
            COHORT,
            HarvestMode::Full,
            &SilentReporter,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let user_id = meals.add_user("key-1");
    let calls_before = api.calls(&annotations_path("p1"));

    // Act
    let only = vec!["key-1".to_string()];
    let summary = pipeline
        .rebuild_meals(Some(&only), &SilentReporter, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    assert!(summary.harvest.is_none());
    assert_eq!(summary.users[0].status, UserSyncStatus::Synced);
    assert_eq!(meals.meals(user_id).len(), 2);
    assert_eq!(api.calls(&annotations_path("p1")), calls_before, "no network access");
}

#[tokio::test]
async fn test_cancelled_run_skips_merge_and_sync() {
    // Arrange
    let api = MockPartnerApi::cohort(&[("p1", "key-1", annotation_page(&day_of_meals(), None))]);
    let records = MockRecordStore::new();
    let meals = MockMealStore::new();
    meals.add_user("key-1");
    let pipeline = PipelineService::with_config(api, records.clone(), meals, test_config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    // Act
    let summary = pipeline
        .run_with_progress_cancellable(COHORT, HarvestMode::Full, &SilentReporter, &cancel)
        .await
        .unwrap();

    // Assert
    assert!(summary.cancelled);
    assert!(summary.users.is_empty());
    assert_eq!(records.len(), 0);
}

fn stored_record(
    item: &str,
    intake: &str,
    at: &str,
    food: Option<&str>,
    product: Option<&str>,
    kcal: f64,
) -> IntakeRecord {
    IntakeRecord {
        key: CompositeKey::new(format!("a-{}", intake), intake, item),
        item_seq: 0,
        participation_key: "key-1".to_string(),
        consumed_at: at.parse().unwrap(),
        timezone: Some("Europe/Zurich".to_string()),
        status: Some("annotated".to_string()),
        food_id: food.map(|name| format!("food-{}", name)),
        food_name: food.map(str::to_string),
        product_id: product.map(|name| format!("product-{}", name)),
        product_barcode: None,
        product_name: product.map(str::to_string),
        consumed_quantity: Some(100.0),
        consumed_unit: Some("g".to_string()),
        nutrients: BTreeMap::from([("energy_kcal".to_string(), Some(kcal))]),
        comments: vec![],
    }
}

#[tokio::test]
async fn test_meal_service_rebuilds_without_partner_api() {
    // Arrange: a food row, a product-only row, and a row with no name at all
    let records = MockRecordStore::new();
    records.insert(stored_record("t-1", "i-1", "2024-05-01T06:00:00Z", Some("Tea"), None, 2.0));
    records.insert(stored_record(
        "t-2",
        "i-2",
        "2024-05-01T06:10:00Z",
        None,
        Some("Granola bar"),
        410.0,
    ));
    records.insert(stored_record("t-3", "i-2", "2024-05-01T06:10:00Z", None, None, 999.0));
    let meals = MockMealStore::new();
    let user_id = meals.add_user("key-1");
    let service = MealService::with_config(records, meals.clone(), test_config().cluster);

    // Act
    let summary = service
        .rebuild_meals(None, &SilentReporter, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    assert_eq!(summary.synced(), 1);
    let stored = meals.meals(user_id);
    assert_eq!(stored.len(), 1, "both intakes fall into one meal");
    let meal = &stored[0];
    assert_eq!(meal.description, "Tea, Granola bar");
    assert_eq!(meal.datetime, local("2024-05-01T08:00:00"), "local Zurich time");
    assert_eq!(meal.nutrients["energy_kcal"], 412.0, "nameless row is dropped");
    assert_eq!(meal.food_ids["Granola bar"], "product-Granola bar", "product stands in for food");
}
