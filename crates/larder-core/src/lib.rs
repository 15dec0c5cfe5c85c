//! Larder Core - Domain types, pipeline services and traits.
//!
//! This crate provides the core functionality for Larder, including:
//!
//! - **Domain models**: [`IntakeRecord`], [`MealEvent`], [`PersistedMeal`], etc.
//! - **Pipeline stages**: [`Harvester`], [`Reconciler`], [`Clusterer`], [`MealSynchronizer`]
//! - **Services**: [`PipelineService`] running the stages end to end, and
//!   [`MealService`] for offline meal rebuilds
//! - **Traits**: [`PartnerApi`], [`RecordStore`], [`MealStore`] for dependency injection
//! - **Progress reporting**: [`ProgressReporter`] trait for decoupled logging/UI
//!
//! # Architecture
//!
//! Business logic is decoupled from I/O through traits, so the same services
//! run against the reqwest client and SQLite repositories in production and
//! against in-memory mocks in tests:
//!
//! - [`PartnerApi`] - abstracts the partner document API (e.g. MyFoodRepo)
//! - [`RecordStore`] - abstracts the keyed intake record set (e.g. SQLite)
//! - [`MealStore`] - abstracts users and persisted meals (e.g. SQLite)

pub mod cluster;
pub mod config;
pub mod error;
pub mod harvest;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod retry;
pub mod sync;
pub mod traits;

// Configuration
pub use config::{
    ClusterConfig, DbConfig, HarvestConfig, HttpConfig, PartnerCredentials, PartnerEnvironment,
    PipelineConfig, PipelineConfigFile, default_config_path, load_pipeline_config,
};

// Error handling
pub use error::AppError;

// Domain models
pub use models::{
    CompositeKey, DocumentPage, IntakeGroup, IntakeRecord, MealChanges, MealEvent, MealWrite,
    NewMeal, Participant, PersistedMeal, RawIntakeRecord, StoreStats, UserRef,
};

// Pipeline stages
pub use cluster::Clusterer;
pub use harvest::{HarvestMode, HarvestReport, Harvester, PageTermination, ParticipantHarvest};
pub use reconcile::{ReconcileReport, Reconciler};
pub use retry::{RetryConfig, with_retry};
pub use sync::{
    MealSynchronizer, SyncOutcome, SyncStats, UserSyncResult, UserSyncStatus, classify_record,
    diff_meal, plan_meal_writes,
};

// Progress reporting
pub use progress::{PipelineEvent, ProgressReporter, SilentReporter, TracingReporter};

// Traits for dependency injection
pub use traits::{MealStore, PartnerApi, RecordStore};

// Services
pub use pipeline::{HarvestSummary, MealService, PipelineService, PipelineSummary};
