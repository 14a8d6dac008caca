//! Error types for the scheduler.

use thiserror::Error;

use cadence_store::{CampaignId, StoreError};

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A loop already owns this campaign.
    #[error("campaign {0} is already running")]
    AlreadyRunning(CampaignId),

    /// Campaign not found.
    #[error("campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    /// Pacing configuration violates the persisted-layout constraints.
    #[error("invalid pacing configuration: {0}")]
    InvalidPacing(String),
}
