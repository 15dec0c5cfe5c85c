//! Reconciliation of harvested documents into the durable record set.
//!
//! Each annotation page is flattened into one row per
//! `(annotation, intake, annotation item)` triple, then all rows of a run
//! are merged into the [`RecordStore`] in a single transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;
use crate::harvest::{HarvestReport, ParticipantHarvest};
use crate::models::{
    CompositeKey, DocumentPage, FoodRef, IntakeRecord, ProductRef, RawIntakeRecord, Resource,
    ResourceId,
};
use crate::sync::SyncStats;
use crate::traits::RecordStore;

/// Lookup of `included` resources by `(type, id)`.
pub struct IncludedIndex<'a> {
    by_id: HashMap<(&'a str, &'a str), &'a Resource>,
}

impl<'a> IncludedIndex<'a> {
    pub fn new(included: &'a [Resource]) -> Self {
        let by_id = included
            .iter()
            .map(|r| ((r.kind.as_str(), r.id.as_str()), r))
            .collect();
        Self { by_id }
    }

    pub fn get(&self, id: &ResourceId) -> Option<&'a Resource> {
        self.by_id.get(&(id.kind.as_str(), id.id.as_str())).copied()
    }

    fn resolve_all(&self, ids: &[ResourceId]) -> Vec<&'a Resource> {
        ids.iter()
            .filter_map(|id| {
                let found = self.get(id);
                if found.is_none() {
                    tracing::debug!(kind = %id.kind, id = %id.id, "Linked resource not included");
                }
                found
            })
            .collect()
    }
}

/// Flattens one annotation page into raw intake records.
///
/// An annotation without intakes or items yields nothing. An intake
/// without a parseable `consumed_at` is skipped with a warning.
pub fn flatten_page(page: &DocumentPage, participation_key: &str) -> Vec<RawIntakeRecord> {
    let index = IncludedIndex::new(&page.included);
    let mut records = Vec::new();

    for annotation in &page.data {
        let status = annotation.attr_str("status");
        let intakes = index.resolve_all(annotation.related_many("intakes"));
        let items = index.resolve_all(annotation.related_many("annotation_items"));
        let comments: Vec<String> = index
            .resolve_all(annotation.related_many("comments"))
            .into_iter()
            .filter_map(|c| c.attr_str("message"))
            .collect();

        for intake in &intakes {
            let Some(consumed_at) = parse_instant(intake.attr_str("consumed_at").as_deref()) else {
                tracing::warn!(
                    participant = participation_key,
                    annotation = %annotation.id,
                    intake = %intake.id,
                    "Intake without a valid consumed_at, skipping"
                );
                continue;
            };
            let timezone = intake.attr_str("timezone");

            for (item_seq, item) in (0u32..).zip(&items) {
                records.push(flatten_item(
                    &index,
                    item,
                    RawIntakeRecord {
                        key: CompositeKey::new(&annotation.id, &intake.id, &item.id),
                        item_seq,
                        participation_key: participation_key.to_string(),
                        consumed_at,
                        timezone: timezone.clone(),
                        status: status.clone(),
                        food: None,
                        product: None,
                        nutrient_densities: BTreeMap::new(),
                        consumed_quantity: None,
                        consumed_unit: None,
                        comments: comments.clone(),
                    },
                ));
            }
        }
    }

    records
}

/// Fills food, product and quantity fields of `record` from an annotation item.
fn flatten_item(
    index: &IncludedIndex<'_>,
    item: &Resource,
    mut record: RawIntakeRecord,
) -> RawIntakeRecord {
    record.consumed_quantity = item.attr_f64("consumed_quantity");
    record.consumed_unit = item.attr_str("consumed_unit_id");

    // Food densities are collected first; a nutrient keeps the first density found.
    if let Some(link) = item.related_one("food") {
        let food = index.get(link);
        record.food = Some(FoodRef {
            id: link.id.clone(),
            name: food.and_then(|f| f.attr_str("name")),
        });
        if let Some(food) = food {
            collect_densities(index, food, "food_nutrients", &mut record.nutrient_densities);
        }
    }

    if let Some(link) = item.related_one("product") {
        let product = index.get(link);
        record.product = Some(ProductRef {
            id: link.id.clone(),
            name: product.and_then(|p| p.attr_str("name")),
            barcode: product.and_then(|p| p.attr_str("barcode")),
        });
        if let Some(product) = product {
            collect_densities(index, product, "product_nutrients", &mut record.nutrient_densities);
        }
    }

    record
}

fn collect_densities(
    index: &IncludedIndex<'_>,
    owner: &Resource,
    relationship: &str,
    densities: &mut BTreeMap<String, f64>,
) {
    for entry in index.resolve_all(owner.related_many(relationship)) {
        let Some(nutrient) = entry.related_one("nutrient") else {
            continue;
        };
        if let Some(per_hundred) = entry.attr_f64("per_hundred") {
            densities.entry(nutrient.id.clone()).or_insert(per_hundred);
        }
    }
}

fn parse_instant(value: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value?)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Expected participants that have no row in the store, sorted.
pub fn missing_participants(expected: &[String], present: &[String]) -> Vec<String> {
    let present: BTreeSet<&str> = present.iter().map(String::as_str).collect();
    expected
        .iter()
        .map(String::as_str)
        .filter(|key| !present.contains(key))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Result of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Distinct keys submitted to the merge.
    pub records: usize,
    pub stats: SyncStats,
    pub missing_participants: Vec<String>,
}

/// Merges harvested documents into a [`RecordStore`].
#[derive(Debug, Clone)]
pub struct Reconciler {
    nutrient_ids: Vec<String>,
}

impl Reconciler {
    /// `nutrient_ids` is the partner nutrient catalog; every row gets one
    /// nutrient entry per id.
    pub fn new(nutrient_ids: Vec<String>) -> Self {
        Self { nutrient_ids }
    }

    pub fn nutrient_ids(&self) -> &[String] {
        &self.nutrient_ids
    }

    /// Flattens every page of a participant harvest into canonical rows.
    pub fn flatten(&self, harvest: &ParticipantHarvest) -> Vec<IntakeRecord> {
        harvest
            .pages
            .iter()
            .flat_map(|page| flatten_page(page, &harvest.participant.key))
            .map(|raw| IntakeRecord::from_raw(raw, &self.nutrient_ids))
            .collect()
    }

    /// Merges every harvested participant into `store`, then checks that
    /// each participant of the cohort listing has rows.
    ///
    /// Within a run the last row seen for a key wins. The merge is
    /// all-or-nothing; the completeness check only logs.
    pub async fn reconcile<S: RecordStore>(
        &self,
        store: &S,
        report: &HarvestReport,
    ) -> Result<ReconcileReport, AppError> {
        let mut by_key: BTreeMap<CompositeKey, IntakeRecord> = BTreeMap::new();
        for harvest in &report.harvested {
            for record in self.flatten(harvest) {
                by_key.insert(record.key.clone(), record);
            }
        }
        let records: Vec<IntakeRecord> = by_key.into_values().collect();

        let stats = store.merge(&records).await?;
        tracing::info!(
            new = stats.created,
            updated = stats.updated,
            unchanged = stats.unchanged,
            "Record set merged"
        );

        let present = store.participation_keys().await?;
        let missing = missing_participants(&report.participant_keys(), &present);
        if !missing.is_empty() {
            tracing::error!(missing = ?missing, "Participants missing from record set");
        }

        Ok(ReconcileReport {
            records: records.len(),
            stats,
            missing_participants: missing,
        })
    }
}
