//! Repository traits consumed by the scheduler and the web layer.
//!
//! The scheduler only depends on these traits; the Postgres implementation
//! lives in [`crate::postgres`] and an in-memory implementation for tests
//! in [`crate::memory`]. All mutations are single-row read-then-write; no
//! method spans multiple targets in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{
    Campaign, CampaignExecution, CampaignId, CampaignStats, CampaignStatus, RateLimitState,
    Target, TargetId, UserId,
};

/// CRUD over campaign aggregate fields used by the scheduler.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Load a campaign regardless of status.
    async fn fetch(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError>;

    /// Load a campaign joined with its account credential, only while its
    /// persisted status is `active`. Returns `None` when the campaign was
    /// deleted or moved out of `active` concurrently.
    async fn fetch_for_execution(
        &self,
        id: CampaignId,
    ) -> Result<Option<CampaignExecution>, StoreError>;

    /// Persist a new lifecycle status. Writing to a missing row is a no-op.
    async fn set_status(&self, id: CampaignId, status: CampaignStatus) -> Result<(), StoreError>;

    /// Ids of all campaigns whose persisted status is `active`, for restart
    /// recovery.
    async fn active_ids(&self) -> Result<Vec<CampaignId>, StoreError>;

    /// Record one rate-limit response: bump the consecutive counter, stamp
    /// the time, reset the success streak. Returns the new consecutive count.
    async fn record_rate_limit(&self, id: CampaignId) -> Result<i32, StoreError>;

    /// Record one successful delivery: `stats_sent += 1`, success streak
    /// `+= 1`. Returns the post-update rate-limit state so the caller can
    /// decide whether trust has been earned back.
    async fn record_delivery(&self, id: CampaignId) -> Result<RateLimitState, StoreError>;

    /// Clear the consecutive rate-limit counter after a sustained clean
    /// streak.
    async fn reset_rate_limit_counter(&self, id: CampaignId) -> Result<(), StoreError>;

    /// Record one terminally failed target: `stats_failed += 1`. Returns the
    /// post-update aggregate counters.
    async fn record_terminal_failure(&self, id: CampaignId) -> Result<CampaignStats, StoreError>;

    /// Owner of the campaign, for request authorization.
    async fn fetch_owner(&self, id: CampaignId) -> Result<Option<UserId>, StoreError>;
}

/// CRUD over target rows scoped by campaign.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Next target eligible for an attempt: earliest-created `pending` row,
    /// or earliest-created `failed` row with `retry_count < max_attempts`.
    /// Pending rows win over retriable-failed rows.
    async fn next_eligible(
        &self,
        campaign: CampaignId,
        max_attempts: i32,
    ) -> Result<Option<Target>, StoreError>;

    /// Whether this campaign already delivered to the given username.
    async fn has_delivery_for_username(
        &self,
        campaign: CampaignId,
        username: &str,
    ) -> Result<bool, StoreError>;

    /// Consume one attempt before invoking the action client:
    /// `retry_count += 1`, `last_attempt_at = now`.
    async fn begin_attempt(&self, id: TargetId) -> Result<(), StoreError>;

    /// Give an attempt back after a rate-limit response: `retry_count -= 1`
    /// floored at zero, recording a transient error message.
    async fn cancel_attempt(&self, id: TargetId, error: &str) -> Result<(), StoreError>;

    /// Terminal success: status `sent`/`followed` plus delivery timestamp.
    async fn mark_delivered(
        &self,
        id: TargetId,
        status: crate::types::TargetStatus,
    ) -> Result<(), StoreError>;

    /// Terminal skip with a human-readable reason (dedup hit or permanent
    /// platform rejection).
    async fn mark_skipped(&self, id: TargetId, reason: &str) -> Result<(), StoreError>;

    /// Record a generic failure: status `failed` plus the error message.
    /// Whether the failure is terminal is derived from `retry_count` against
    /// the campaign's budget, not stored separately.
    async fn record_failure(&self, id: TargetId, error: &str) -> Result<(), StoreError>;

    /// Count attempts whose effective timestamp
    /// (`COALESCE(delivered_at, last_attempt_at)`) falls in `[start, end)`.
    /// Used for the daily cap.
    async fn attempts_between(
        &self,
        campaign: CampaignId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError>;
}

/// Advisory usage metering, keyed by owning user and action kind.
///
/// Failures here must never fail or delay the action itself; callers log
/// and move on.
#[async_trait]
pub trait UsageMeter: Send + Sync {
    async fn increment(&self, user: UserId, kind: &str) -> Result<(), StoreError>;
}
