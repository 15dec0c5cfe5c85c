//! Progress reporting for pipeline runs.
//!
//! Services emit [`PipelineEvent`]s through a [`ProgressReporter`] so the
//! library never decides how progress is shown. The CLI uses
//! [`TracingReporter`]; library callers default to [`SilentReporter`].

use tracing::{error, info, warn};

use crate::harvest::{HarvestMode, PageTermination};
use crate::sync::{SyncStats, UserSyncResult, UserSyncStatus};

/// Events emitted while a pipeline runs.
#[derive(Debug, Clone)]
pub enum PipelineEvent<'a> {
    HarvestStarted {
        cohort_id: &'a str,
        participants: usize,
        mode: HarvestMode,
    },
    ParticipantHarvested {
        participant: &'a str,
        pages: usize,
        termination: PageTermination,
    },
    ParticipantFailed {
        participant: &'a str,
        error: &'a str,
    },
    HarvestCompleted {
        harvested: usize,
        failed: &'a [String],
    },
    RecordsMerged {
        records: usize,
        stats: &'a SyncStats,
    },
    ParticipantsMissing {
        participants: &'a [String],
    },
    MealsClustered {
        participant: &'a str,
        meals: usize,
    },
    UserSynced {
        result: &'a UserSyncResult,
    },
    Cancelled {
        stage: &'a str,
    },
}

/// Receives pipeline events.
pub trait ProgressReporter: Send + Sync {
    /// Called for every pipeline event. The default does nothing.
    fn report(&self, event: PipelineEvent<'_>) {
        let _ = event;
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        match event {
            PipelineEvent::HarvestStarted {
                cohort_id,
                participants,
                mode,
            } => {
                info!(cohort = cohort_id, participants, %mode, "Harvest started");
            }
            PipelineEvent::ParticipantHarvested {
                participant,
                pages,
                termination,
            } => match termination {
                PageTermination::Exhausted => {
                    info!(participant, pages, "Participant harvested");
                }
                other => {
                    warn!(
                        participant,
                        pages,
                        termination = ?other,
                        "Participant harvest truncated"
                    );
                }
            },
            PipelineEvent::ParticipantFailed { participant, error } => {
                warn!(participant, %error, "Participant harvest failed");
            }
            PipelineEvent::HarvestCompleted { harvested, failed } => {
                if failed.is_empty() {
                    info!(harvested, "Harvest completed");
                } else {
                    error!(harvested, failed = ?failed, "Harvest completed with failures");
                }
            }
            PipelineEvent::RecordsMerged { records, stats } => {
                info!(
                    records,
                    created = stats.created,
                    updated = stats.updated,
                    unchanged = stats.unchanged,
                    "Records merged"
                );
            }
            PipelineEvent::ParticipantsMissing { participants } => {
                error!(missing = ?participants, "Participants missing from record set");
            }
            PipelineEvent::MealsClustered { participant, meals } => {
                tracing::debug!(participant, meals, "Meals clustered");
            }
            PipelineEvent::UserSynced { result } => match &result.status {
                UserSyncStatus::Synced => {
                    info!(
                        participant = %result.participation_key,
                        created = result.stats.created,
                        updated = result.stats.updated,
                        "User synchronized"
                    );
                }
                UserSyncStatus::UnknownUser => {
                    warn!(participant = %result.participation_key, "Unknown user, skipped");
                }
                UserSyncStatus::Failed(error) => {
                    error!(participant = %result.participation_key, %error, "User sync failed");
                }
            },
            PipelineEvent::Cancelled { stage } => {
                warn!(stage, "Pipeline cancelled");
            }
        }
    }
}
