//! Harvest service for the partner document API.
//!
//! The [`Harvester`] drives pagination for every participant of a cohort,
//! wraps each page fetch in [`with_retry`], and runs a bounded number of
//! participants concurrently. Pages of one participant are fetched in
//! order; nothing is guaranteed across participants.
//!
//! # Pagination
//!
//! Every listing starts at page 1 and follows `meta.next` until it is null.
//! Two anomalies end a listing early without failing it:
//! - a `next` cursor that was already fetched ([`PageTermination::CycleDetected`]);
//! - the page ceiling ([`PageTermination::PageLimitReached`]).
//!
//! Pages fetched before the anomaly are kept.
//!
//! # Cancellation
//!
//! Once the token is cancelled no new participant or page is started and
//! pending backoff sleeps are cut short. In-flight requests complete.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::HarvestConfig;
use crate::error::AppError;
use crate::models::{DocumentPage, Participant};
use crate::progress::{PipelineEvent, ProgressReporter, SilentReporter};
use crate::retry::with_retry;
use crate::traits::PartnerApi;

/// Nutrient catalog listing.
pub const NUTRIENTS_PATH: &str = "/collab/api/v1/nutrients";

/// Related resources requested with every annotation page.
pub const ANNOTATION_INCLUDE: &str = "intakes,comments,annotation_items,annotation_items.food,\
annotation_items.food.food_nutrients,annotation_items.product,\
annotation_items.product.product_nutrients";

/// Format of the `filter[created_at][gte]` parameter.
const TIME_FILTER_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn participations_path(cohort_id: &str) -> String {
    format!("/collab/api/v1/cohorts/{}/participations", cohort_id)
}

pub fn annotations_path(participation_id: &str) -> String {
    format!("/collab/api/v1/participations/{}/annotations", participation_id)
}

/// How much history a harvest requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HarvestMode {
    /// Every annotation ever created.
    Full,
    /// Annotations created in the last `days` days.
    Windowed { days: u32 },
}

impl HarvestMode {
    /// Lower bound of the creation-time filter, if any.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            HarvestMode::Full => None,
            HarvestMode::Windowed { days } => Some(now - TimeDelta::days(i64::from(*days))),
        }
    }
}

impl fmt::Display for HarvestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarvestMode::Full => write!(f, "full"),
            HarvestMode::Windowed { days } => write!(f, "windowed ({} days)", days),
        }
    }
}

/// Why a paginated listing stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageTermination {
    /// `meta.next` was null.
    Exhausted,
    /// `meta.next` pointed at an already fetched page.
    CycleDetected { page: u32 },
    /// The page ceiling was hit while `meta.next` was still set.
    PageLimitReached { limit: u32 },
    Cancelled,
}

impl PageTermination {
    pub fn is_complete(&self) -> bool {
        matches!(self, PageTermination::Exhausted)
    }
}

/// All pages of one listing, in fetch order.
#[derive(Debug, Clone, PartialEq)]
pub struct PagedDocuments {
    pub pages: Vec<DocumentPage>,
    pub termination: PageTermination,
}

/// The annotation pages harvested for one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantHarvest {
    pub participant: Participant,
    pub pages: Vec<DocumentPage>,
    pub termination: PageTermination,
}

/// Outcome of harvesting a whole cohort.
#[derive(Debug, Clone, Default)]
pub struct HarvestReport {
    pub cohort_id: String,
    /// Every participant in the cohort listing.
    pub participants: Vec<Participant>,
    pub harvested: Vec<ParticipantHarvest>,
    /// Keys of participants whose harvest failed after retries.
    pub failed: Vec<String>,
    pub cancelled: bool,
}

impl HarvestReport {
    pub fn participant_keys(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.key.clone()).collect()
    }
}

/// Paginated, retrying, concurrent harvester.
pub struct Harvester<A: PartnerApi> {
    api: A,
    config: HarvestConfig,
}

impl<A: PartnerApi + Clone> Clone for Harvester<A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            config: self.config.clone(),
        }
    }
}

impl<A: PartnerApi> Harvester<A> {
    pub fn new(api: A) -> Self {
        Self::with_config(api, HarvestConfig::default())
    }

    pub fn with_config(api: A, config: HarvestConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Follows `meta.next` from page 1 until the listing ends.
    ///
    /// `query` is sent with every page in addition to `page`. A fetch that
    /// still fails after retries fails the whole listing.
    pub async fn fetch_all(
        &self,
        path: &str,
        query: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<PagedDocuments, AppError> {
        let max_pages = self.config.max_pages.max(1);
        let mut pages = Vec::new();
        let mut seen = HashSet::new();
        let mut page = 1u32;

        let termination = loop {
            if cancel.is_cancelled() {
                break PageTermination::Cancelled;
            }
            if pages.len() >= max_pages as usize {
                tracing::error!(
                    path,
                    limit = max_pages,
                    "Page limit reached, stopping pagination"
                );
                break PageTermination::PageLimitReached { limit: max_pages };
            }

            seen.insert(page);
            let mut page_query = Vec::with_capacity(query.len() + 1);
            page_query.push(("page".to_string(), page.to_string()));
            page_query.extend_from_slice(query);

            let api = &self.api;
            let page_query = &page_query;
            let document = with_retry(&self.config.retry, cancel, path, move || {
                api.fetch_page(path, page_query)
            })
            .await?;

            let next = document.next_page();
            pages.push(document);

            match next {
                None => break PageTermination::Exhausted,
                Some(next) if seen.contains(&next) => {
                    tracing::warn!(path, page, next, "Pagination cycle detected");
                    break PageTermination::CycleDetected { page: next };
                }
                Some(next) => page = next,
            }
        };

        Ok(PagedDocuments { pages, termination })
    }

    /// Lists every participation of a cohort.
    pub async fn list_participants(
        &self,
        cohort_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Participant>, AppError> {
        let query = vec![("items".to_string(), self.config.page_size.to_string())];
        let listing = self
            .fetch_all(&participations_path(cohort_id), &query, cancel)
            .await?;

        let mut participants = Vec::new();
        for resource in listing.pages.iter().flat_map(|p| p.data.iter()) {
            match Participant::from_resource(resource) {
                Some(participant) => participants.push(participant),
                None => {
                    tracing::warn!(id = %resource.id, "Participation without key, skipping");
                }
            }
        }
        Ok(participants)
    }

    /// Lists every nutrient id in the partner catalog, in listing order.
    pub async fn list_nutrient_ids(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AppError> {
        let query = vec![("items".to_string(), self.config.page_size.to_string())];
        let listing = self.fetch_all(NUTRIENTS_PATH, &query, cancel).await?;

        let mut seen = HashSet::new();
        Ok(listing
            .pages
            .iter()
            .flat_map(|p| p.data.iter())
            .filter(|r| seen.insert(r.id.clone()))
            .map(|r| r.id.clone())
            .collect())
    }

    /// Fetches every annotation page of one participant.
    pub async fn harvest_participant(
        &self,
        participant: &Participant,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<ParticipantHarvest, AppError> {
        let mut query = vec![
            ("limit".to_string(), self.config.annotation_limit.to_string()),
            ("items".to_string(), self.config.page_size.to_string()),
            ("include".to_string(), ANNOTATION_INCLUDE.to_string()),
        ];
        if let Some(since) = since {
            query.push((
                "filter[created_at][gte]".to_string(),
                since.format(TIME_FILTER_FORMAT).to_string(),
            ));
        }

        let listing = self
            .fetch_all(&annotations_path(&participant.id), &query, cancel)
            .await?;

        Ok(ParticipantHarvest {
            participant: participant.clone(),
            pages: listing.pages,
            termination: listing.termination,
        })
    }

    /// Harvests a cohort without progress reporting.
    pub async fn harvest_cohort(
        &self,
        cohort_id: &str,
        mode: HarvestMode,
        cancel: &CancellationToken,
    ) -> Result<HarvestReport, AppError> {
        self.harvest_cohort_with_progress(cohort_id, mode, &SilentReporter, cancel)
            .await
    }

    /// Lists the cohort, then harvests its participants through a pool of
    /// `concurrency` in-flight participants.
    ///
    /// Only a failed cohort listing is an error. A participant that fails
    /// after retries is recorded in [`HarvestReport::failed`] and excluded.
    pub async fn harvest_cohort_with_progress<R: ProgressReporter>(
        &self,
        cohort_id: &str,
        mode: HarvestMode,
        reporter: &R,
        cancel: &CancellationToken,
    ) -> Result<HarvestReport, AppError> {
        let participants = self.list_participants(cohort_id, cancel).await?;
        let since = mode.since(Utc::now());

        reporter.report(PipelineEvent::HarvestStarted {
            cohort_id,
            participants: participants.len(),
            mode,
        });

        let results: Vec<(String, Option<Result<ParticipantHarvest, AppError>>)> =
            stream::iter(participants.iter())
                .map(|participant| async move {
                    if cancel.is_cancelled() {
                        return (participant.key.clone(), None);
                    }
                    let result = self.harvest_participant(participant, since, cancel).await;
                    (participant.key.clone(), Some(result))
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

        let mut harvested = Vec::new();
        let mut failed = Vec::new();
        for (key, result) in results {
            match result {
                None => {}
                Some(Ok(harvest)) => {
                    reporter.report(PipelineEvent::ParticipantHarvested {
                        participant: &key,
                        pages: harvest.pages.len(),
                        termination: harvest.termination,
                    });
                    harvested.push(harvest);
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    reporter.report(PipelineEvent::ParticipantFailed {
                        participant: &key,
                        error: &message,
                    });
                    failed.push(key);
                }
            }
        }

        failed.sort();
        if !failed.is_empty() {
            tracing::error!(
                cohort = cohort_id,
                failed = ?failed,
                "Failed to harvest {} participant(s)",
                failed.len()
            );
        }

        let cancelled = cancel.is_cancelled();
        reporter.report(PipelineEvent::HarvestCompleted {
            harvested: harvested.len(),
            failed: &failed,
        });

        Ok(HarvestReport {
            cohort_id: cohort_id.to_string(),
            participants,
            harvested,
            failed,
            cancelled,
        })
    }

    /// Creates a participation in the cohort. Not retried: the call is not
    /// idempotent.
    pub async fn create_participation(&self, cohort_id: &str) -> Result<Participant, AppError> {
        let participant = self.api.create_participation(cohort_id).await?;
        tracing::info!(cohort = cohort_id, key = %participant.key, "Participation created");
        Ok(participant)
    }
}
