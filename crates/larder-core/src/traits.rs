//! Trait definitions for external dependencies.
//!
//! The pipeline services are generic over these traits so the partner API
//! and the stores can be swapped for in-memory mocks in tests:
//!
//! - [`PartnerApi`] - single-page fetches against the partner document API
//! - [`RecordStore`] - the durable keyed intake record set
//! - [`MealStore`] - users and their persisted meals
//!
//! # Example
//!
//! ```
//! use larder_core::traits::RecordStore;
//!
//! async fn known_participants<S: RecordStore>(
//!     store: &S,
//! ) -> Result<usize, larder_core::AppError> {
//!     Ok(store.participation_keys().await?.len())
//! }
//! ```

use std::future::Future;

use chrono::NaiveDateTime;

use crate::models::{
    CompositeKey, DocumentPage, IntakeRecord, MealWrite, Participant, PersistedMeal, UserRef,
};
use crate::sync::{SyncOutcome, SyncStats};
use crate::AppError;

/// Client for the partner's paginated document API.
///
/// Implementations hold credentials and perform exactly one HTTP exchange
/// per call. Retrying is the caller's concern.
pub trait PartnerApi: Send + Sync + Clone {
    /// Fetches one page of `path` with the given query parameters.
    ///
    /// A non-success status is returned as [`AppError::ApiError`].
    fn fetch_page(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> impl Future<Output = Result<DocumentPage, AppError>> + Send;

    /// Creates a new participation in `cohort_id` and returns it.
    fn create_participation(
        &self,
        cohort_id: &str,
    ) -> impl Future<Output = Result<Participant, AppError>> + Send;
}

/// Durable record set keyed by [`CompositeKey`].
pub trait RecordStore: Send + Sync + Clone {
    fn get(
        &self,
        key: &CompositeKey,
    ) -> impl Future<Output = Result<Option<IntakeRecord>, AppError>> + Send;

    /// Inserts or replaces a single record.
    fn upsert(
        &self,
        record: &IntakeRecord,
    ) -> impl Future<Output = Result<SyncOutcome, AppError>> + Send;

    /// Upserts a batch in one transaction. Keys absent from `records` are
    /// left untouched; on error nothing is written.
    fn merge(
        &self,
        records: &[IntakeRecord],
    ) -> impl Future<Output = Result<SyncStats, AppError>> + Send;

    /// Every record, in [`IntakeRecord::scan_order`].
    fn scan(&self) -> impl Future<Output = Result<Vec<IntakeRecord>, AppError>> + Send;

    /// Records of one participant, in [`IntakeRecord::scan_order`].
    fn scan_participant(
        &self,
        participation_key: &str,
    ) -> impl Future<Output = Result<Vec<IntakeRecord>, AppError>> + Send;

    /// Distinct participation keys present in the store, sorted.
    fn participation_keys(&self) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;
}

/// Store of users and their meals.
pub trait MealStore: Send + Sync + Clone {
    fn find_user(
        &self,
        participation_key: &str,
    ) -> impl Future<Output = Result<Option<UserRef>, AppError>> + Send;

    fn meals_for_user(
        &self,
        user_id: i64,
    ) -> impl Future<Output = Result<Vec<PersistedMeal>, AppError>> + Send;

    /// Applies `writes` for one user and refreshes its `last_meal_log` to the
    /// latest meal datetime, all in one transaction.
    ///
    /// Returns the new `last_meal_log`.
    fn apply_meal_writes(
        &self,
        user_id: i64,
        writes: &[MealWrite],
    ) -> impl Future<Output = Result<Option<NaiveDateTime>, AppError>> + Send;
}
