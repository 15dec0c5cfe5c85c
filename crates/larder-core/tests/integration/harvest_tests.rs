//! Integration tests for the Harvester.

use crate::integration::common::{
    Annotation, COHORT, MockPartnerApi, annotation_page, participations_page, test_config,
};
use larder_core::harvest::{annotations_path, participations_path};
use larder_core::{HarvestMode, Harvester, PageTermination};
use tokio_util::sync::CancellationToken;

fn breakfast(id: &str) -> Annotation<'_> {
    Annotation {
        id,
        intake_id: "i-1",
        consumed_at: "2024-05-01T08:00:00Z",
        items: vec![("t-1", "Bread", Some(80.0), 250.0)],
    }
}

#[tokio::test]
async fn test_harvest_follows_next_pages() {
    // Arrange
    let path = annotations_path("p1");
    let first = annotation_page(&[breakfast("a-1")], Some(2));
    let api = MockPartnerApi::cohort(&[("p1", "key-1", first)])
        .with_page(&path, 2, annotation_page(&[breakfast("a-2")], Some(3)))
        .with_page(&path, 3, annotation_page(&[breakfast("a-3")], None));
    let harvester = Harvester::with_config(api.clone(), test_config().harvest);

    // Act
    let report = harvester
        .harvest_cohort(COHORT, HarvestMode::Full, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    assert_eq!(report.participants.len(), 1);
    assert_eq!(report.harvested.len(), 1);
    let harvest = &report.harvested[0];
    assert_eq!(harvest.pages.len(), 3, "all three pages should be fetched");
    assert_eq!(harvest.termination, PageTermination::Exhausted);
    assert_eq!(harvest.pages[2].data[0].id, "a-3", "pages keep fetch order");
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_pagination_cycle_terminates() {
    // Arrange: page 2 points back at page 1
    let path = annotations_path("p1");
    let first = annotation_page(&[breakfast("a-1")], Some(2));
    let api = MockPartnerApi::cohort(&[("p1", "key-1", first)])
        .with_page(&path, 2, annotation_page(&[breakfast("a-2")], Some(1)));
    let harvester = Harvester::with_config(api.clone(), test_config().harvest);

    // Act
    let report = harvester
        .harvest_cohort(COHORT, HarvestMode::Full, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    let harvest = &report.harvested[0];
    assert_eq!(harvest.termination, PageTermination::CycleDetected { page: 1 });
    assert_eq!(harvest.pages.len(), 2, "fetched pages are kept");
    assert_eq!(api.calls(&path), 2, "no page is fetched twice");
}

#[tokio::test]
async fn test_runaway_pagination_stops_at_ceiling() {
    // Arrange
    let path = annotations_path("p1");
    let api = MockPartnerApi::cohort(&[("p1", "key-1", annotation_page(&[], None))])
        .with_runaway_path(&path);
    let config = test_config().harvest.with_max_pages(5);
    let harvester = Harvester::with_config(api.clone(), config);

    // Act
    let report = harvester
        .harvest_cohort(COHORT, HarvestMode::Full, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    let harvest = &report.harvested[0];
    assert_eq!(harvest.termination, PageTermination::PageLimitReached { limit: 5 });
    assert_eq!(api.calls(&path), 5);
}

#[tokio::test]
async fn test_failed_participant_is_isolated() {
    // Arrange
    let api = MockPartnerApi::cohort(&[
        ("p1", "key-1", annotation_page(&[breakfast("a-1")], None)),
        ("p2", "key-2", annotation_page(&[breakfast("a-2")], None)),
        ("p3", "key-3", annotation_page(&[breakfast("a-3")], None)),
    ])
    .with_failing_path(&annotations_path("p2"));
    let harvester = Harvester::with_config(api.clone(), test_config().harvest);

    // Act
    let report = harvester
        .harvest_cohort(COHORT, HarvestMode::Full, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    assert_eq!(report.failed, vec!["key-2".to_string()]);
    let mut harvested: Vec<&str> = report
        .harvested
        .iter()
        .map(|h| h.participant.key.as_str())
        .collect();
    harvested.sort();
    assert_eq!(harvested, vec!["key-1", "key-3"]);
    assert_eq!(
        api.calls(&annotations_path("p2")),
        3,
        "failing participant is retried up to the attempt ceiling"
    );
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    // Arrange
    let path = annotations_path("p1");
    let api = MockPartnerApi::cohort(&[("p1", "key-1", annotation_page(&[breakfast("a-1")], None))])
        .with_flaky_path(&path, 2);
    let harvester = Harvester::with_config(api.clone(), test_config().harvest);

    // Act
    let report = harvester
        .harvest_cohort(COHORT, HarvestMode::Full, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    assert!(report.failed.is_empty(), "third attempt should succeed");
    assert_eq!(report.harvested.len(), 1);
    assert_eq!(api.calls(&path), 3);
}

#[tokio::test]
async fn test_participant_listing_failure_is_an_error() {
    // Arrange
    let api = MockPartnerApi::new().with_failing_path(&participations_path(COHORT));
    let harvester = Harvester::with_config(api, test_config().harvest);

    // Act
    let result = harvester
        .harvest_cohort(COHORT, HarvestMode::Full, &CancellationToken::new())
        .await;

    // Assert
    assert!(result.is_err());
}

#[tokio::test]
async fn test_windowed_mode_sends_time_filter() {
    // Arrange
    let path = annotations_path("p1");
    let api = MockPartnerApi::cohort(&[("p1", "key-1", annotation_page(&[], None))]);
    let harvester = Harvester::with_config(api.clone(), test_config().harvest);

    // Act
    harvester
        .harvest_cohort(COHORT, HarvestMode::Windowed { days: 3 }, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    let query = api.last_query(&path).unwrap();
    let get = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(get("page").as_deref(), Some("1"));
    assert_eq!(get("items").as_deref(), Some("250"));
    assert_eq!(get("limit").as_deref(), Some("20"));
    assert!(get("include").unwrap().contains("annotation_items.food.food_nutrients"));
    let since = get("filter[created_at][gte]").expect("windowed harvest sends a filter");
    assert!(since.ends_with('Z'), "filter is a UTC timestamp: {since}");
}

#[tokio::test]
async fn test_full_mode_omits_time_filter() {
    // Arrange
    let path = annotations_path("p1");
    let api = MockPartnerApi::cohort(&[("p1", "key-1", annotation_page(&[], None))]);
    let harvester = Harvester::with_config(api.clone(), test_config().harvest);

    // Act
    harvester
        .harvest_cohort(COHORT, HarvestMode::Full, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    let query = api.last_query(&path).unwrap();
    assert!(!query.iter().any(|(k, _)| k == "filter[created_at][gte]"));
}

#[tokio::test]
async fn test_participant_listing_is_paginated() {
    // Arrange
    let path = participations_path(COHORT);
    let api = MockPartnerApi::new()
        .with_page(&path, 1, participations_page(&[("p1", "key-1")], Some(2)))
        .with_page(&path, 2, participations_page(&[("p2", "key-2")], None));
    let harvester = Harvester::with_config(api, test_config().harvest);

    // Act
    let participants = harvester
        .list_participants(COHORT, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    let keys: Vec<&str> = participants.iter().map(|p| p.key.as_str()).collect();
    assert_eq!(keys, vec!["key-1", "key-2"]);
}

#[tokio::test]
async fn test_cancelled_harvest_starts_no_participant() {
    // Arrange
    let page = annotation_page(&[breakfast("a-1")], None);
    let api = MockPartnerApi::cohort(&[("p1", "key-1", page)]);
    let harvester = Harvester::with_config(api.clone(), test_config().harvest);
    let cancel = CancellationToken::new();
    cancel.cancel();

    // Act
    let report = harvester
        .harvest_cohort(COHORT, HarvestMode::Full, &cancel)
        .await
        .unwrap();

    // Assert
    assert!(report.cancelled);
    assert!(report.harvested.is_empty());
    assert_eq!(api.calls(&annotations_path("p1")), 0);
}

#[tokio::test]
async fn test_create_participation() {
    // Arrange
    let api = MockPartnerApi::new();
    let harvester = Harvester::with_config(api.clone(), test_config().harvest);

    // Act
    let participant = harvester.create_participation(COHORT).await.unwrap();

    // Assert
    assert_eq!(participant.key, "key-new-1");
    assert_eq!(api.created(), 1);
}
