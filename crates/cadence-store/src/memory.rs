//! In-memory implementation of the repository traits.
//!
//! Backs the scheduler's integration tests and mirrors the observable
//! ordering/filter semantics of the Postgres queries. Not intended for
//! production use.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::repo::{CampaignStore, TargetStore, UsageMeter};
use crate::types::{
    Campaign, CampaignExecution, CampaignId, CampaignStats, CampaignStatus, RateLimitState,
    Target, TargetId, TargetStatus, UserId,
};

#[derive(Default)]
struct Inner {
    campaigns: HashMap<CampaignId, Campaign>,
    credentials: HashMap<CampaignId, String>,
    targets: Vec<Target>,
    usage: HashMap<(UserId, String), i64>,
    next_target_id: TargetId,
}

/// Shared in-memory store implementing all repository traits.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a campaign with the credential its account would carry.
    pub fn insert_campaign(&self, campaign: Campaign, credential: &str) {
        let mut inner = self.lock();
        inner.credentials.insert(campaign.id, credential.to_string());
        inner.campaigns.insert(campaign.id, campaign);
    }

    /// Seed a pending target, returning its id. Creation order defines
    /// FIFO processing order.
    pub fn insert_target(&self, campaign: CampaignId, username: &str) -> TargetId {
        let mut inner = self.lock();
        inner.next_target_id += 1;
        let id = inner.next_target_id;
        let sequence = inner.targets.len() as i64;
        inner.targets.push(Target {
            id,
            campaign_id: campaign,
            external_id: format!("ext-{id}"),
            username: username.to_string(),
            display_name: None,
            status: TargetStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            delivered_at: None,
            error_message: None,
            // Strictly increasing timestamps so ordering is deterministic
            // even when targets are seeded within the same instant.
            created_at: Utc::now() + chrono::Duration::microseconds(sequence),
        });
        id
    }

    /// Snapshot of a target row.
    pub fn target(&self, id: TargetId) -> Option<Target> {
        self.lock().targets.iter().find(|t| t.id == id).cloned()
    }

    /// Snapshot of a campaign row.
    pub fn campaign(&self, id: CampaignId) -> Option<Campaign> {
        self.lock().campaigns.get(&id).cloned()
    }

    /// Total metered usage for a user and action kind.
    pub fn usage(&self, user: UserId, kind: &str) -> i64 {
        self.lock()
            .usage
            .get(&(user, kind.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a test already panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_target<F>(&self, id: TargetId, apply: F)
    where
        F: FnOnce(&mut Target),
    {
        let mut inner = self.lock();
        if let Some(target) = inner.targets.iter_mut().find(|t| t.id == id) {
            apply(target);
        }
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn fetch(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        Ok(self.campaign(id))
    }

    async fn fetch_for_execution(
        &self,
        id: CampaignId,
    ) -> Result<Option<CampaignExecution>, StoreError> {
        let inner = self.lock();
        let campaign = match inner.campaigns.get(&id) {
            Some(c) if c.status == CampaignStatus::Active => c.clone(),
            _ => return Ok(None),
        };
        let credential = inner.credentials.get(&id).cloned().unwrap_or_default();
        Ok(Some(CampaignExecution {
            campaign,
            credential,
        }))
    }

    async fn set_status(&self, id: CampaignId, status: CampaignStatus) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(campaign) = inner.campaigns.get_mut(&id) {
            campaign.status = status;
        }
        Ok(())
    }

    async fn active_ids(&self) -> Result<Vec<CampaignId>, StoreError> {
        let mut ids: Vec<CampaignId> = self
            .lock()
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Active)
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn record_rate_limit(&self, id: CampaignId) -> Result<i32, StoreError> {
        let mut inner = self.lock();
        let campaign = inner
            .campaigns
            .get_mut(&id)
            .ok_or(sqlx::Error::RowNotFound)?;
        campaign.rate_limit.consecutive_rate_limits += 1;
        campaign.rate_limit.last_rate_limit_at = Some(Utc::now());
        campaign.rate_limit.successes_since_rate_limit = 0;
        Ok(campaign.rate_limit.consecutive_rate_limits)
    }

    async fn record_delivery(&self, id: CampaignId) -> Result<RateLimitState, StoreError> {
        let mut inner = self.lock();
        let campaign = inner
            .campaigns
            .get_mut(&id)
            .ok_or(sqlx::Error::RowNotFound)?;
        campaign.stats.sent += 1;
        campaign.rate_limit.successes_since_rate_limit += 1;
        Ok(campaign.rate_limit)
    }

    async fn reset_rate_limit_counter(&self, id: CampaignId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(campaign) = inner.campaigns.get_mut(&id) {
            campaign.rate_limit.consecutive_rate_limits = 0;
        }
        Ok(())
    }

    async fn record_terminal_failure(&self, id: CampaignId) -> Result<CampaignStats, StoreError> {
        let mut inner = self.lock();
        let campaign = inner
            .campaigns
            .get_mut(&id)
            .ok_or(sqlx::Error::RowNotFound)?;
        campaign.stats.failed += 1;
        Ok(campaign.stats)
    }

    async fn fetch_owner(&self, id: CampaignId) -> Result<Option<UserId>, StoreError> {
        Ok(self.campaign(id).map(|c| c.user_id))
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn next_eligible(
        &self,
        campaign: CampaignId,
        max_attempts: i32,
    ) -> Result<Option<Target>, StoreError> {
        let inner = self.lock();
        let eligible = inner
            .targets
            .iter()
            .filter(|t| t.campaign_id == campaign)
            .filter(|t| match t.status {
                TargetStatus::Pending => true,
                TargetStatus::Failed => t.retry_count < max_attempts,
                _ => false,
            })
            .min_by_key(|t| {
                let class = if t.status == TargetStatus::Pending { 0 } else { 1 };
                (class, t.created_at, t.id)
            });
        Ok(eligible.cloned())
    }

    async fn has_delivery_for_username(
        &self,
        campaign: CampaignId,
        username: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.lock().targets.iter().any(|t| {
            t.campaign_id == campaign && t.username == username && t.status.is_delivered()
        }))
    }

    async fn begin_attempt(&self, id: TargetId) -> Result<(), StoreError> {
        self.update_target(id, |t| {
            t.retry_count += 1;
            t.last_attempt_at = Some(Utc::now());
        });
        Ok(())
    }

    async fn cancel_attempt(&self, id: TargetId, error: &str) -> Result<(), StoreError> {
        self.update_target(id, |t| {
            t.retry_count = (t.retry_count - 1).max(0);
            t.error_message = Some(error.to_string());
        });
        Ok(())
    }

    async fn mark_delivered(&self, id: TargetId, status: TargetStatus) -> Result<(), StoreError> {
        self.update_target(id, |t| {
            t.status = status;
            t.delivered_at = Some(Utc::now());
            t.error_message = None;
        });
        Ok(())
    }

    async fn mark_skipped(&self, id: TargetId, reason: &str) -> Result<(), StoreError> {
        self.update_target(id, |t| {
            t.status = TargetStatus::Skipped;
            t.error_message = Some(reason.to_string());
        });
        Ok(())
    }

    async fn record_failure(&self, id: TargetId, error: &str) -> Result<(), StoreError> {
        self.update_target(id, |t| {
            t.status = TargetStatus::Failed;
            t.error_message = Some(error.to_string());
        });
        Ok(())
    }

    async fn attempts_between(
        &self,
        campaign: CampaignId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count = self
            .lock()
            .targets
            .iter()
            .filter(|t| t.campaign_id == campaign)
            .filter(|t| t.status.is_delivered() || t.retry_count > 0)
            .filter_map(|t| t.delivered_at.or(t.last_attempt_at))
            .filter(|at| *at >= start && *at < end)
            .count();
        Ok(count as i64)
    }
}

#[async_trait]
impl UsageMeter for MemoryStore {
    async fn increment(&self, user: UserId, kind: &str) -> Result<(), StoreError> {
        *self
            .lock()
            .usage
            .entry((user, kind.to_string()))
            .or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CampaignKind, PacingConfig};
    use pretty_assertions::assert_eq;

    fn test_campaign(id: CampaignId) -> Campaign {
        Campaign {
            id,
            user_id: 1,
            account_id: 1,
            name: format!("campaign {id}"),
            kind: CampaignKind::Dm,
            status: CampaignStatus::Active,
            message_template: Some("hi {{name}}".to_string()),
            pacing: PacingConfig {
                per_minute: 3,
                delay_min_secs: 0,
                delay_max_secs: 0,
                daily_cap: 50,
                retry_attempts: 1,
            },
            rate_limit: RateLimitState::default(),
            stats: CampaignStats::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn selection_is_fifo_within_pending() {
        let store = MemoryStore::new();
        store.insert_campaign(test_campaign(1), "cred");
        let first = store.insert_target(1, "alice");
        store.insert_target(1, "bob");

        let picked = store.next_eligible(1, 1).await.unwrap().unwrap();
        assert_eq!(picked.id, first);
    }

    #[tokio::test]
    async fn pending_preferred_over_retriable_failed() {
        let store = MemoryStore::new();
        store.insert_campaign(test_campaign(1), "cred");
        let failed = store.insert_target(1, "alice");
        let pending = store.insert_target(1, "bob");

        store.begin_attempt(failed).await.unwrap();
        store.record_failure(failed, "boom").await.unwrap();

        // The failed target was created first, but pending wins.
        let picked = store.next_eligible(1, 2).await.unwrap().unwrap();
        assert_eq!(picked.id, pending);

        store.mark_delivered(pending, TargetStatus::Sent).await.unwrap();
        let picked = store.next_eligible(1, 2).await.unwrap().unwrap();
        assert_eq!(picked.id, failed);
    }

    #[tokio::test]
    async fn exhausted_failed_target_is_not_eligible() {
        let store = MemoryStore::new();
        store.insert_campaign(test_campaign(1), "cred");
        let id = store.insert_target(1, "alice");

        store.begin_attempt(id).await.unwrap();
        store.record_failure(id, "boom").await.unwrap();

        // max_attempts = 1: the single consumed attempt exhausts the budget.
        assert!(store.next_eligible(1, 1).await.unwrap().is_none());
        // A budget of two attempts keeps it eligible.
        assert!(store.next_eligible(1, 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancel_attempt_floors_at_zero() {
        let store = MemoryStore::new();
        store.insert_campaign(test_campaign(1), "cred");
        let id = store.insert_target(1, "alice");

        store.cancel_attempt(id, "rate limited").await.unwrap();
        let target = store.target(id).unwrap();
        assert_eq!(target.retry_count, 0);
        assert_eq!(target.error_message.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn dedup_sees_only_delivered_rows() {
        let store = MemoryStore::new();
        store.insert_campaign(test_campaign(1), "cred");
        let first = store.insert_target(1, "alice");
        store.insert_target(1, "alice");

        assert!(!store.has_delivery_for_username(1, "alice").await.unwrap());
        store.mark_delivered(first, TargetStatus::Sent).await.unwrap();
        assert!(store.has_delivery_for_username(1, "alice").await.unwrap());
        assert!(!store.has_delivery_for_username(1, "bob").await.unwrap());
    }

    #[tokio::test]
    async fn attempts_between_counts_attempted_rows_only() {
        let store = MemoryStore::new();
        store.insert_campaign(test_campaign(1), "cred");
        let attempted = store.insert_target(1, "alice");
        let delivered = store.insert_target(1, "bob");
        store.insert_target(1, "carol"); // untouched

        store.begin_attempt(attempted).await.unwrap();
        store.mark_delivered(delivered, TargetStatus::Sent).await.unwrap();

        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(store.attempts_between(1, start, end).await.unwrap(), 2);

        // Outside the window, nothing counts.
        let past_end = Utc::now() - chrono::Duration::minutes(30);
        assert_eq!(store.attempts_between(1, start, past_end).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fetch_for_execution_requires_active_status() {
        let store = MemoryStore::new();
        let mut campaign = test_campaign(1);
        campaign.status = CampaignStatus::Paused;
        store.insert_campaign(campaign, "cred");

        assert!(store.fetch_for_execution(1).await.unwrap().is_none());

        store.set_status(1, CampaignStatus::Active).await.unwrap();
        let execution = store.fetch_for_execution(1).await.unwrap().unwrap();
        assert_eq!(execution.credential, "cred");
    }

    #[tokio::test]
    async fn delivery_tracks_success_streak() {
        let store = MemoryStore::new();
        store.insert_campaign(test_campaign(1), "cred");

        store.record_rate_limit(1).await.unwrap();
        let state = store.record_delivery(1).await.unwrap();
        assert_eq!(state.consecutive_rate_limits, 1);
        assert_eq!(state.successes_since_rate_limit, 1);

        store.record_rate_limit(1).await.unwrap();
        let campaign = store.campaign(1).unwrap();
        assert_eq!(campaign.rate_limit.consecutive_rate_limits, 2);
        assert_eq!(campaign.rate_limit.successes_since_rate_limit, 0);
    }
}
