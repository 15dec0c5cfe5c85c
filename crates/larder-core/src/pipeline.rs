//! End-to-end pipeline: harvest → reconcile → cluster → synchronize.
//!
//! [`PipelineService`] is generic over the partner API and both stores.
//! Harvesting is concurrent across participants. Everything after it runs
//! sequentially, one participant at a time, and a failing participant never
//! stops the others. [`MealService`] is the offline half (cluster and
//! synchronize) and needs no partner API.
//!
//! # Example
//!
//! ```ignore
//! use larder_core::{HarvestMode, PipelineService, TracingReporter};
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = PipelineService::new(client, record_repo, meal_repo);
//! let summary = pipeline
//!     .run_with_progress_cancellable("42", HarvestMode::Windowed { days: 3 }, &TracingReporter, &CancellationToken::new())
//!     .await?;
//! println!("{} users synced", summary.synced());
//! ```

use std::collections::BTreeSet;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cluster::Clusterer;
use crate::config::{ClusterConfig, PipelineConfig};
use crate::error::AppError;
use crate::harvest::{HarvestMode, Harvester, PageTermination};
use crate::progress::{PipelineEvent, ProgressReporter, SilentReporter};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::sync::{MealSynchronizer, UserSyncResult, UserSyncStatus};
use crate::traits::{MealStore, PartnerApi, RecordStore};

/// What the harvest and reconcile stages did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HarvestSummary {
    pub participants: usize,
    pub harvested: usize,
    pub failed: Vec<String>,
    /// Participants whose pagination stopped on an anomaly.
    pub truncated: Vec<(String, PageTermination)>,
    /// `None` when the run was cancelled before merging.
    pub reconcile: Option<ReconcileReport>,
    pub cancelled: bool,
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSummary {
    /// `None` for offline runs that only rebuild meals.
    pub harvest: Option<HarvestSummary>,
    pub users: Vec<UserSyncResult>,
    pub cancelled: bool,
}

impl PipelineSummary {
    fn count(&self, predicate: impl Fn(&UserSyncStatus) -> bool) -> usize {
        self.users.iter().filter(|u| predicate(&u.status)).count()
    }

    pub fn synced(&self) -> usize {
        self.count(|s| matches!(s, UserSyncStatus::Synced))
    }

    pub fn unknown_users(&self) -> usize {
        self.count(|s| matches!(s, UserSyncStatus::UnknownUser))
    }

    pub fn failed_users(&self) -> Vec<&str> {
        self.users
            .iter()
            .filter(|u| matches!(u.status, UserSyncStatus::Failed(_)))
            .map(|u| u.participation_key.as_str())
            .collect()
    }

    /// Meals created and updated across all users.
    pub fn meals_written(&self) -> (usize, usize) {
        self.users.iter().fold((0, 0), |(c, u), r| {
            (c + r.stats.created, u + r.stats.updated)
        })
    }
}

/// Rebuilds meals from the record store and synchronizes them.
///
/// This is the offline half of the pipeline: it never talks to the partner
/// API, so it can run without credentials.
pub struct MealService<S: RecordStore, M: MealStore> {
    records: S,
    clusterer: Clusterer,
    synchronizer: MealSynchronizer<M>,
}

impl<S, M> MealService<S, M>
where
    S: RecordStore,
    M: MealStore,
{
    pub fn new(records: S, meals: M) -> Self {
        Self::with_config(records, meals, ClusterConfig::default())
    }

    pub fn with_config(records: S, meals: M, config: ClusterConfig) -> Self {
        let synchronizer = MealSynchronizer::new(meals, config.nutrient_columns.clone());
        Self {
            records,
            clusterer: Clusterer::new(config),
            synchronizer,
        }
    }

    /// Rebuilds meals from the stored record set.
    ///
    /// `participants` limits the run; `None` means every participant in the
    /// record store.
    pub async fn rebuild_meals<R: ProgressReporter>(
        &self,
        participants: Option<&[String]>,
        reporter: &R,
        cancel: &CancellationToken,
    ) -> Result<PipelineSummary, AppError> {
        let keys = match participants {
            Some(keys) => keys.to_vec(),
            None => self.records.participation_keys().await?,
        };

        let (users, cancelled) = self.sync_participants(&keys, reporter, cancel).await;
        Ok(PipelineSummary {
            harvest: None,
            users,
            cancelled,
        })
    }

    /// Clusters and synchronizes each participant in turn.
    ///
    /// Returns the per-user results and whether cancellation cut the loop.
    pub async fn sync_participants<R: ProgressReporter>(
        &self,
        keys: &[String],
        reporter: &R,
        cancel: &CancellationToken,
    ) -> (Vec<UserSyncResult>, bool) {
        let mut results = Vec::with_capacity(keys.len());

        for key in keys {
            if cancel.is_cancelled() {
                reporter.report(PipelineEvent::Cancelled { stage: "synchronize" });
                return (results, true);
            }

            let result = match self.sync_one(key, reporter).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(participant = %key, error = %e, "Meal synchronization failed");
                    UserSyncResult::failed(key, &e)
                }
            };
            reporter.report(PipelineEvent::UserSynced { result: &result });
            results.push(result);
        }

        (results, false)
    }

    async fn sync_one<R: ProgressReporter>(
        &self,
        key: &str,
        reporter: &R,
    ) -> Result<UserSyncResult, AppError> {
        let records = self.records.scan_participant(key).await?;
        let meals = self.clusterer.meals_for(&records);
        reporter.report(PipelineEvent::MealsClustered {
            participant: key,
            meals: meals.len(),
        });
        self.synchronizer.sync_participant(key, &meals).await
    }
}

/// Orchestrates the whole pipeline against injected implementations.
pub struct PipelineService<A: PartnerApi, S: RecordStore, M: MealStore> {
    harvester: Harvester<A>,
    records: S,
    meals: MealService<S, M>,
}

impl<A, S, M> PipelineService<A, S, M>
where
    A: PartnerApi,
    S: RecordStore,
    M: MealStore,
{
    pub fn new(api: A, records: S, meals: M) -> Self {
        Self::with_config(api, records, meals, PipelineConfig::default())
    }

    pub fn with_config(api: A, records: S, meals: M, config: PipelineConfig) -> Self {
        let PipelineConfig { harvest, cluster } = config;
        Self {
            harvester: Harvester::with_config(api, harvest),
            meals: MealService::with_config(records.clone(), meals, cluster),
            records,
        }
    }

    pub fn harvester(&self) -> &Harvester<A> {
        &self.harvester
    }

    pub fn meal_service(&self) -> &MealService<S, M> {
        &self.meals
    }

    /// Runs the full pipeline without progress reporting or cancellation.
    pub async fn run(
        &self,
        cohort_id: &str,
        mode: HarvestMode,
    ) -> Result<PipelineSummary, AppError> {
        self.run_with_progress_cancellable(
            cohort_id,
            mode,
            &SilentReporter,
            &CancellationToken::new(),
        )
        .await
    }

    /// Runs the full pipeline.
    ///
    /// Participants that failed to harvest are left out of meal
    /// synchronization for this run.
    pub async fn run_with_progress_cancellable<R: ProgressReporter>(
        &self,
        cohort_id: &str,
        mode: HarvestMode,
        reporter: &R,
        cancel: &CancellationToken,
    ) -> Result<PipelineSummary, AppError> {
        let harvest = self
            .harvest_and_reconcile(cohort_id, mode, reporter, cancel)
            .await?;

        if harvest.cancelled {
            return Ok(PipelineSummary {
                harvest: Some(harvest),
                users: Vec::new(),
                cancelled: true,
            });
        }

        let failed: BTreeSet<&str> = harvest.failed.iter().map(String::as_str).collect();
        let keys: Vec<String> = self
            .records
            .participation_keys()
            .await?
            .into_iter()
            .filter(|k| !failed.contains(k.as_str()))
            .collect();

        let (users, cancelled) = self.meals.sync_participants(&keys, reporter, cancel).await;

        Ok(PipelineSummary {
            harvest: Some(harvest),
            users,
            cancelled,
        })
    }

    /// Harvests the cohort and merges the result into the record store.
    ///
    /// Fails only when the nutrient catalog or the cohort listing cannot be
    /// fetched, or when the merge itself fails.
    pub async fn harvest_and_reconcile<R: ProgressReporter>(
        &self,
        cohort_id: &str,
        mode: HarvestMode,
        reporter: &R,
        cancel: &CancellationToken,
    ) -> Result<HarvestSummary, AppError> {
        let nutrient_ids = self.harvester.list_nutrient_ids(cancel).await?;
        tracing::debug!(count = nutrient_ids.len(), "Nutrient catalog loaded");

        let report = self
            .harvester
            .harvest_cohort_with_progress(cohort_id, mode, reporter, cancel)
            .await?;

        let mut summary = HarvestSummary {
            participants: report.participants.len(),
            harvested: report.harvested.len(),
            failed: report.failed.clone(),
            truncated: report
                .harvested
                .iter()
                .filter(|h| !h.termination.is_complete())
                .map(|h| (h.participant.key.clone(), h.termination))
                .collect(),
            reconcile: None,
            cancelled: false,
        };

        if report.cancelled || cancel.is_cancelled() {
            reporter.report(PipelineEvent::Cancelled { stage: "reconcile" });
            summary.cancelled = true;
            return Ok(summary);
        }

        let reconciler = Reconciler::new(nutrient_ids);
        let reconciled = reconciler.reconcile(&self.records, &report).await?;

        reporter.report(PipelineEvent::RecordsMerged {
            records: reconciled.records,
            stats: &reconciled.stats,
        });
        if !reconciled.missing_participants.is_empty() {
            reporter.report(PipelineEvent::ParticipantsMissing {
                participants: &reconciled.missing_participants,
            });
        }

        summary.reconcile = Some(reconciled);
        Ok(summary)
    }

    /// Rebuilds meals from the stored record set, without network access.
    pub async fn rebuild_meals<R: ProgressReporter>(
        &self,
        participants: Option<&[String]>,
        reporter: &R,
        cancel: &CancellationToken,
    ) -> Result<PipelineSummary, AppError> {
        self.meals.rebuild_meals(participants, reporter, cancel).await
    }

    /// Creates a participation in the cohort and returns its key.
    pub async fn create_participation(&self, cohort_id: &str) -> Result<String, AppError> {
        Ok(self.harvester.create_participation(cohort_id).await?.key)
    }
}
