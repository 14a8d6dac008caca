//! Domain types for campaigns and their targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a campaign row.
pub type CampaignId = i64;

/// Identifier of a target row.
pub type TargetId = i64;

/// Identifier of the user owning a campaign.
pub type UserId = i64;

/// What kind of outreach a campaign performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignKind {
    /// Direct-message campaign; renders `message_template` per target.
    Dm,
    /// Follow campaign; no message involved.
    Follow,
}

impl CampaignKind {
    /// Column value as stored in `campaigns.kind`.
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignKind::Dm => "dm",
            CampaignKind::Follow => "follow",
        }
    }

    /// Terminal success status a target of this kind reaches.
    pub fn delivered_status(&self) -> TargetStatus {
        match self {
            CampaignKind::Dm => TargetStatus::Sent,
            CampaignKind::Follow => TargetStatus::Followed,
        }
    }

    /// Key used by the usage meter for this action kind.
    pub fn usage_key(&self) -> &'static str {
        match self {
            CampaignKind::Dm => "dms",
            CampaignKind::Follow => "follows",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dm" => Some(CampaignKind::Dm),
            "follow" => Some(CampaignKind::Follow),
            _ => None,
        }
    }
}

/// Lifecycle state of a campaign.
///
/// Transitions: `draft -> ready -> active <-> paused -> completed`.
/// Nothing leaves `completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    #[default]
    Draft,
    /// Targets uploaded, waiting for the user to press start.
    Ready,
    /// A scheduler loop owns this campaign.
    Active,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Ready => "ready",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(CampaignStatus::Draft),
            "ready" => Some(CampaignStatus::Ready),
            "active" => Some(CampaignStatus::Active),
            "paused" => Some(CampaignStatus::Paused),
            "completed" => Some(CampaignStatus::Completed),
            _ => None,
        }
    }
}

/// Lifecycle state of a single target.
///
/// `Sent`/`Followed`/`Skipped` are terminal. `Failed` is terminal only once
/// the target's retry budget is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    #[default]
    Pending,
    Sent,
    Followed,
    Failed,
    Skipped,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Sent => "sent",
            TargetStatus::Followed => "followed",
            TargetStatus::Failed => "failed",
            TargetStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TargetStatus::Pending),
            "sent" => Some(TargetStatus::Sent),
            "followed" => Some(TargetStatus::Followed),
            "failed" => Some(TargetStatus::Failed),
            "skipped" => Some(TargetStatus::Skipped),
            _ => None,
        }
    }

    /// True for statuses a delivered action counts under.
    pub fn is_delivered(&self) -> bool {
        matches!(self, TargetStatus::Sent | TargetStatus::Followed)
    }
}

/// Per-campaign pacing knobs, persisted on the campaign row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Hard ceiling on actions per trailing 60 seconds.
    pub per_minute: i32,
    /// Lower bound of the post-action delay, in seconds.
    pub delay_min_secs: i32,
    /// Upper bound of the post-action delay, in seconds.
    pub delay_max_secs: i32,
    /// Maximum attempts per local calendar day.
    pub daily_cap: i32,
    /// Additional attempts allowed beyond the first. Zero means exactly
    /// one attempt per target.
    pub retry_attempts: i32,
}

impl PacingConfig {
    /// Check the persisted-layout constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.per_minute <= 0 {
            return Err(format!("per_minute must be positive, got {}", self.per_minute));
        }
        if self.delay_min_secs < 0 {
            return Err(format!(
                "delay_min_secs must be non-negative, got {}",
                self.delay_min_secs
            ));
        }
        if self.delay_max_secs < self.delay_min_secs {
            return Err(format!(
                "delay_max_secs ({}) must be >= delay_min_secs ({})",
                self.delay_max_secs, self.delay_min_secs
            ));
        }
        if self.daily_cap <= 0 {
            return Err(format!("daily_cap must be positive, got {}", self.daily_cap));
        }
        if self.retry_attempts < 0 {
            return Err(format!(
                "retry_attempts must be non-negative, got {}",
                self.retry_attempts
            ));
        }
        Ok(())
    }
}

/// Rate-limit bookkeeping tracked per campaign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Rate-limit responses seen without an intervening trust reset.
    pub consecutive_rate_limits: i32,
    pub last_rate_limit_at: Option<DateTime<Utc>>,
    /// Successful deliveries since the last rate-limit response.
    pub successes_since_rate_limit: i32,
}

/// Aggregate delivery counters for a campaign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub total_targets: i64,
    pub sent: i64,
    pub failed: i64,
}

/// One outreach run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub user_id: UserId,
    pub account_id: i64,
    pub name: String,
    pub kind: CampaignKind,
    pub status: CampaignStatus,
    /// Template with `{{name}}` / `{{username}}` placeholders (DM campaigns).
    pub message_template: Option<String>,
    pub pacing: PacingConfig,
    pub rate_limit: RateLimitState,
    pub stats: CampaignStats,
    pub created_at: DateTime<Utc>,
}

/// Campaign joined with the credential of its platform account, as loaded
/// at the top of each tick.
#[derive(Debug, Clone)]
pub struct CampaignExecution {
    pub campaign: Campaign,
    /// Opaque credential handed to the action client. Encryption at rest
    /// is handled by the account layer.
    pub credential: String,
}

/// One recipient/candidate within a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub campaign_id: CampaignId,
    /// Platform-side user id.
    pub external_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub status: TargetStatus,
    /// Attempts consumed so far.
    pub retry_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(CampaignStatus::Draft, "draft")]
    #[test_case(CampaignStatus::Ready, "ready")]
    #[test_case(CampaignStatus::Active, "active")]
    #[test_case(CampaignStatus::Paused, "paused")]
    #[test_case(CampaignStatus::Completed, "completed")]
    fn campaign_status_round_trips(status: CampaignStatus, column: &str) {
        assert_eq!(status.as_str(), column);
        assert_eq!(CampaignStatus::parse(column), Some(status));
    }

    #[test]
    fn unknown_status_does_not_parse() {
        assert_eq!(CampaignStatus::parse("running"), None);
        assert_eq!(TargetStatus::parse("delivered"), None);
        assert_eq!(CampaignKind::parse("like"), None);
    }

    #[test]
    fn delivered_status_matches_kind() {
        assert_eq!(CampaignKind::Dm.delivered_status(), TargetStatus::Sent);
        assert_eq!(CampaignKind::Follow.delivered_status(), TargetStatus::Followed);
        assert!(TargetStatus::Sent.is_delivered());
        assert!(TargetStatus::Followed.is_delivered());
        assert!(!TargetStatus::Failed.is_delivered());
    }

    fn valid_pacing() -> PacingConfig {
        PacingConfig {
            per_minute: 3,
            delay_min_secs: 15,
            delay_max_secs: 30,
            daily_cap: 50,
            retry_attempts: 0,
        }
    }

    #[test]
    fn pacing_validation_accepts_defaults() {
        assert!(valid_pacing().validate().is_ok());
    }

    #[test]
    fn pacing_validation_rejects_bad_fields() {
        let mut pacing = valid_pacing();
        pacing.per_minute = 0;
        assert!(pacing.validate().is_err());

        let mut pacing = valid_pacing();
        pacing.delay_max_secs = pacing.delay_min_secs - 1;
        assert!(pacing.validate().is_err());

        let mut pacing = valid_pacing();
        pacing.daily_cap = 0;
        assert!(pacing.validate().is_err());

        let mut pacing = valid_pacing();
        pacing.retry_attempts = -1;
        assert!(pacing.validate().is_err());
    }

    #[test]
    fn zero_delay_window_is_valid() {
        let mut pacing = valid_pacing();
        pacing.delay_min_secs = 0;
        pacing.delay_max_secs = 0;
        assert!(pacing.validate().is_ok());
    }
}
