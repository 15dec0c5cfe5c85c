//! Domain models for Larder.
//!
//! Three families of types live here:
//! - partner API documents ([`DocumentPage`], [`Resource`], [`Relationship`]),
//!   a JSON:API-style envelope with `data`, `included` and `meta.next`;
//! - intake records ([`RawIntakeRecord`], [`IntakeRecord`]) keyed by
//!   [`CompositeKey`];
//! - meal records ([`IntakeGroup`], [`MealEvent`], [`PersistedMeal`]).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// Partner API documents
// =============================================================================

/// One page of a partner API collection.
///
/// ```
/// use larder_core::models::DocumentPage;
///
/// let page: DocumentPage = serde_json::from_str(
///     r#"{"data": [{"id": "7", "type": "participation", "attributes": {"key": "abc"}}],
///         "meta": {"next": 2}}"#,
/// ).unwrap();
/// assert_eq!(page.data[0].id, "7");
/// assert_eq!(page.next_page(), Some(2));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentPage {
    #[serde(default)]
    pub data: Vec<Resource>,
    #[serde(default)]
    pub included: Vec<Resource>,
    #[serde(default)]
    pub meta: PageMeta,
}

impl DocumentPage {
    /// The page number the server advertises as next, if any.
    pub fn next_page(&self) -> Option<u32> {
        self.meta.next
    }
}

/// Pagination metadata. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMeta {
    #[serde(default, deserialize_with = "deserialize_page_cursor")]
    pub next: Option<u32>,
}

/// A JSON:API resource object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, Relationship>,
}

impl Resource {
    /// Reads a textual attribute. Numbers are rendered as text, empty
    /// strings and nulls are `None`.
    pub fn attr_str(&self, name: &str) -> Option<String> {
        match self.attributes.get(name)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Reads a numeric attribute, accepting numeric strings.
    pub fn attr_f64(&self, name: &str) -> Option<f64> {
        match self.attributes.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.get(name)
    }

    /// The single linked resource of a to-one relationship.
    pub fn related_one(&self, name: &str) -> Option<&ResourceId> {
        self.relationship(name).and_then(Relationship::one)
    }

    /// The linked resources of a to-many relationship (empty when absent).
    pub fn related_many(&self, name: &str) -> &[ResourceId] {
        self.relationship(name).map(Relationship::many).unwrap_or(&[])
    }

    /// Identifier of this resource for lookups in an `included` index.
    pub fn resource_id(&self) -> ResourceId {
        ResourceId {
            kind: self.kind.clone(),
            id: self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub data: Option<Linkage>,
}

impl Relationship {
    pub fn one(&self) -> Option<&ResourceId> {
        match self.data.as_ref()? {
            Linkage::One(id) => Some(id),
            Linkage::Many(ids) => ids.first(),
        }
    }

    pub fn many(&self) -> &[ResourceId] {
        match &self.data {
            Some(Linkage::Many(ids)) => ids,
            Some(Linkage::One(id)) => std::slice::from_ref(id),
            None => &[],
        }
    }
}

/// Resource linkage: a single identifier or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linkage {
    Many(Vec<ResourceId>),
    One(ResourceId),
}

/// A `(type, id)` resource identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
}

/// Accepts string or numeric identifiers.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("invalid resource id: {}", other))),
    }
}

/// Accepts `null`, a page number, or a numeric string.
fn deserialize_page_cursor<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid page cursor: {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("invalid page cursor: {}", s))),
        Some(other) => Err(de::Error::custom(format!("invalid page cursor: {}", other))),
    }
}

/// A cohort participation (one study subject's enrollment).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Participant {
    /// Partner-side participation id, used in annotation URLs.
    pub id: String,
    /// Participation key, the stable external identifier of the subject.
    pub key: String,
}

impl Participant {
    /// Builds a participant from a `participation` resource.
    ///
    /// Returns `None` when the resource has no `key` attribute.
    pub fn from_resource(resource: &Resource) -> Option<Self> {
        Some(Self {
            id: resource.id.clone(),
            key: resource.attr_str("key")?,
        })
    }
}

// =============================================================================
// Intake records
// =============================================================================

/// Natural key of one ingestible fact: `(annotation, intake, annotation item)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub annotation_id: String,
    pub intake_id: String,
    pub annotation_item_id: String,
}

impl CompositeKey {
    pub fn new(
        annotation_id: impl Into<String>,
        intake_id: impl Into<String>,
        annotation_item_id: impl Into<String>,
    ) -> Self {
        Self {
            annotation_id: annotation_id.into(),
            intake_id: intake_id.into(),
            annotation_item_id: annotation_item_id.into(),
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.annotation_id, self.intake_id, self.annotation_item_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodRef {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRef {
    pub id: String,
    pub name: Option<String>,
    pub barcode: Option<String>,
}

/// One food/product consumption fact as returned by the partner API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawIntakeRecord {
    pub key: CompositeKey,
    /// Position of the item in its annotation's `annotation_items`.
    pub item_seq: u32,
    pub participation_key: String,
    pub consumed_at: DateTime<Utc>,
    pub timezone: Option<String>,
    pub status: Option<String>,
    pub food: Option<FoodRef>,
    pub product: Option<ProductRef>,
    /// Nutrient id → amount per 100 units. The first density found wins,
    /// food entries before product entries.
    pub nutrient_densities: BTreeMap<String, f64>,
    pub consumed_quantity: Option<f64>,
    pub consumed_unit: Option<String>,
    pub comments: Vec<String>,
}

/// A flattened row of the durable record set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeRecord {
    pub key: CompositeKey,
    /// Partner order of the item within its annotation. Items of one intake
    /// are aggregated in this order.
    pub item_seq: u32,
    pub participation_key: String,
    pub consumed_at: DateTime<Utc>,
    pub timezone: Option<String>,
    pub status: Option<String>,
    pub food_id: Option<String>,
    pub food_name: Option<String>,
    pub product_id: Option<String>,
    pub product_barcode: Option<String>,
    pub product_name: Option<String>,
    pub consumed_quantity: Option<f64>,
    pub consumed_unit: Option<String>,
    /// One entry per catalog nutrient id; `None` when not derivable.
    pub nutrients: BTreeMap<String, Option<f64>>,
    pub comments: Vec<String>,
}

impl IntakeRecord {
    /// Flattens a raw record, deriving one value per catalog nutrient.
    pub fn from_raw(raw: RawIntakeRecord, nutrient_ids: &[String]) -> Self {
        let nutrients = nutrient_ids
            .iter()
            .map(|id| {
                let value = derive_nutrient(
                    raw.consumed_quantity,
                    raw.nutrient_densities.get(id).copied(),
                );
                (id.clone(), value)
            })
            .collect();

        let (food_id, food_name) = match raw.food {
            Some(food) => (Some(food.id), food.name),
            None => (None, None),
        };
        let (product_id, product_name, product_barcode) = match raw.product {
            Some(product) => (Some(product.id), product.name, product.barcode),
            None => (None, None, None),
        };

        Self {
            key: raw.key,
            item_seq: raw.item_seq,
            participation_key: raw.participation_key,
            consumed_at: raw.consumed_at,
            timezone: raw.timezone,
            status: raw.status,
            food_id,
            food_name,
            product_id,
            product_barcode,
            product_name,
            consumed_quantity: raw.consumed_quantity,
            consumed_unit: raw.consumed_unit,
            nutrients,
            comments: raw.comments,
        }
    }

    /// Scan order of the record set: `consumed_at`, annotation, intake,
    /// then partner item order. Ids compare as text.
    pub fn scan_order(&self, other: &Self) -> Ordering {
        self.consumed_at
            .cmp(&other.consumed_at)
            .then_with(|| self.key.annotation_id.cmp(&other.key.annotation_id))
            .then_with(|| self.key.intake_id.cmp(&other.key.intake_id))
            .then_with(|| self.item_seq.cmp(&other.item_seq))
            .then_with(|| self.key.annotation_item_id.cmp(&other.key.annotation_item_id))
    }
}

/// `round(quantity × density / 100, 2)`, or `None` if either side is missing.
pub fn derive_nutrient(quantity: Option<f64>, density: Option<f64>) -> Option<f64> {
    Some(round2(quantity? * density? / 100.0))
}

/// Rounds half away from zero to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// =============================================================================
// Meals
// =============================================================================

/// All rows of one participant sharing an `intake_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeGroup {
    pub intake_id: String,
    pub participation_key: String,
    pub consumed_at: DateTime<Utc>,
    /// Wall-clock time in the configured local zone.
    pub local_time: NaiveDateTime,
    pub description: String,
    pub nutrients: BTreeMap<String, Option<f64>>,
    pub food_ids: BTreeMap<String, String>,
    pub eaten_quantities: BTreeMap<String, f64>,
}

/// A reconstructed meal: intake groups chained by temporal proximity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealEvent {
    pub participation_key: String,
    pub consumed_at: DateTime<Utc>,
    pub local_time: NaiveDateTime,
    pub description: String,
    pub nutrients: BTreeMap<String, Option<f64>>,
    pub food_ids: BTreeMap<String, String>,
    pub eaten_quantities: BTreeMap<String, f64>,
    /// Intake ids merged into this meal, in timestamp order.
    pub intake_ids: Vec<String>,
}

/// A user registered in the meal store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
    pub participation_key: String,
    pub last_meal_log: Option<NaiveDateTime>,
}

/// A meal row as stored for downstream collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMeal {
    pub id: Uuid,
    pub user_id: i64,
    pub description: String,
    pub nutrients: BTreeMap<String, f64>,
    pub food_ids: BTreeMap<String, String>,
    pub eaten_quantities: BTreeMap<String, f64>,
    pub datetime: NaiveDateTime,
}

/// A meal about to be written; identity is `(user_id, datetime)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMeal {
    pub user_id: i64,
    pub description: String,
    pub nutrients: BTreeMap<String, f64>,
    pub food_ids: BTreeMap<String, String>,
    pub eaten_quantities: BTreeMap<String, f64>,
    pub datetime: NaiveDateTime,
}

impl NewMeal {
    /// Projects a meal event onto the store's shape.
    ///
    /// Only `nutrient_columns` with a value are kept, rounded to 2 decimals.
    pub fn from_event(user_id: i64, event: &MealEvent, nutrient_columns: &[String]) -> Self {
        let nutrients = nutrient_columns
            .iter()
            .filter_map(|column| {
                let value = event.nutrients.get(column).copied().flatten()?;
                Some((column.clone(), round2(value)))
            })
            .collect();

        Self {
            user_id,
            description: event.description.clone(),
            nutrients,
            food_ids: event.food_ids.clone(),
            eaten_quantities: event.eaten_quantities.clone(),
            datetime: event.local_time,
        }
    }
}

/// Fields of a stored meal that differ from a fresh one. `None` means equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MealChanges {
    pub description: Option<String>,
    pub nutrients: Option<BTreeMap<String, f64>>,
    pub food_ids: Option<BTreeMap<String, String>>,
    pub eaten_quantities: Option<BTreeMap<String, f64>>,
}

impl MealChanges {
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.nutrients.is_none()
            && self.food_ids.is_none()
            && self.eaten_quantities.is_none()
    }

    /// Names of the changed fields, for logging.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.description.is_some() {
            fields.push("description");
        }
        if self.nutrients.is_some() {
            fields.push("nutrients");
        }
        if self.food_ids.is_some() {
            fields.push("food_ids");
        }
        if self.eaten_quantities.is_some() {
            fields.push("eaten_quantities");
        }
        fields
    }
}

/// A single write against the meal store.
#[derive(Debug, Clone, PartialEq)]
pub enum MealWrite {
    Insert(NewMeal),
    Update {
        id: Uuid,
        datetime: NaiveDateTime,
        changes: MealChanges,
    },
}

/// Row counts of the local stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub records: i64,
    pub participants: i64,
    pub users: i64,
    pub meals: i64,
    pub last_meal: Option<NaiveDateTime>,
}
