//! PostgreSQL implementation of the repository traits.
//!
//! Queries are runtime-checked (`query_as`/`query_scalar`) against the
//! schema in `migrations/`. Row structs mirror the columns and convert into
//! domain types, rejecting unknown status values instead of guessing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use crate::error::StoreError;
use crate::repo::{CampaignStore, TargetStore, UsageMeter};
use crate::types::{
    Campaign, CampaignExecution, CampaignId, CampaignKind, CampaignStats, CampaignStatus,
    PacingConfig, RateLimitState, Target, TargetId, TargetStatus, UserId,
};

/// Maximum connections in the pool.
const MAX_CONNECTIONS: u32 = 20;

/// Connect a pool to the given database URL.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed implementation of all repository traits.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct CampaignRow {
    id: i64,
    user_id: i64,
    account_id: i64,
    name: String,
    kind: String,
    status: String,
    message_template: Option<String>,
    pacing_per_minute: i32,
    pacing_delay_min: i32,
    pacing_delay_max: i32,
    pacing_daily_cap: i32,
    pacing_retry_attempts: i32,
    stats_total: i64,
    stats_sent: i64,
    stats_failed: i64,
    consecutive_rate_limits: i32,
    last_rate_limit_at: Option<DateTime<Utc>>,
    successes_since_rate_limit: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = StoreError;

    fn try_from(row: CampaignRow) -> Result<Self, StoreError> {
        let kind = CampaignKind::parse(&row.kind).ok_or(StoreError::InvalidColumn {
            column: "campaigns.kind",
            value: row.kind.clone(),
        })?;
        let status = CampaignStatus::parse(&row.status).ok_or(StoreError::InvalidColumn {
            column: "campaigns.status",
            value: row.status.clone(),
        })?;

        Ok(Campaign {
            id: row.id,
            user_id: row.user_id,
            account_id: row.account_id,
            name: row.name,
            kind,
            status,
            message_template: row.message_template,
            pacing: PacingConfig {
                per_minute: row.pacing_per_minute,
                delay_min_secs: row.pacing_delay_min,
                delay_max_secs: row.pacing_delay_max,
                daily_cap: row.pacing_daily_cap,
                retry_attempts: row.pacing_retry_attempts,
            },
            rate_limit: RateLimitState {
                consecutive_rate_limits: row.consecutive_rate_limits,
                last_rate_limit_at: row.last_rate_limit_at,
                successes_since_rate_limit: row.successes_since_rate_limit,
            },
            stats: CampaignStats {
                total_targets: row.stats_total,
                sent: row.stats_sent,
                failed: row.stats_failed,
            },
            created_at: row.created_at,
        })
    }
}

const CAMPAIGN_COLUMNS: &str = "id, user_id, account_id, name, kind, status, message_template, \
     pacing_per_minute, pacing_delay_min, pacing_delay_max, pacing_daily_cap, \
     pacing_retry_attempts, stats_total, stats_sent, stats_failed, \
     consecutive_rate_limits, last_rate_limit_at, successes_since_rate_limit, created_at";

#[async_trait]
impl CampaignStore for PostgresStore {
    async fn fetch(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1");
        let row: Option<CampaignRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Campaign::try_from).transpose()
    }

    async fn fetch_for_execution(
        &self,
        id: CampaignId,
    ) -> Result<Option<CampaignExecution>, StoreError> {
        #[derive(FromRow)]
        struct ExecutionRow {
            #[sqlx(flatten)]
            campaign: CampaignRow,
            credential: String,
        }

        let sql = "SELECT c.id, c.user_id, c.account_id, c.name, c.kind, c.status, \
                    c.message_template, c.pacing_per_minute, c.pacing_delay_min, \
                    c.pacing_delay_max, c.pacing_daily_cap, c.pacing_retry_attempts, \
                    c.stats_total, c.stats_sent, c.stats_failed, c.consecutive_rate_limits, \
                    c.last_rate_limit_at, c.successes_since_rate_limit, c.created_at, \
                    a.credential AS credential \
             FROM campaigns c JOIN accounts a ON c.account_id = a.id \
             WHERE c.id = $1 AND c.status = 'active'";
        let row: Option<ExecutionRow> = sqlx::query_as(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            Ok(CampaignExecution {
                campaign: Campaign::try_from(r.campaign)?,
                credential: r.credential,
            })
        })
        .transpose()
    }

    async fn set_status(&self, id: CampaignId, status: CampaignStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE campaigns SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn active_ids(&self) -> Result<Vec<CampaignId>, StoreError> {
        let ids = sqlx::query_scalar("SELECT id FROM campaigns WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn record_rate_limit(&self, id: CampaignId) -> Result<i32, StoreError> {
        let count = sqlx::query_scalar(
            "UPDATE campaigns SET \
                 consecutive_rate_limits = consecutive_rate_limits + 1, \
                 last_rate_limit_at = NOW(), \
                 successes_since_rate_limit = 0 \
             WHERE id = $1 \
             RETURNING consecutive_rate_limits",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn record_delivery(&self, id: CampaignId) -> Result<RateLimitState, StoreError> {
        #[derive(FromRow)]
        struct StateRow {
            consecutive_rate_limits: i32,
            last_rate_limit_at: Option<DateTime<Utc>>,
            successes_since_rate_limit: i32,
        }

        let row: StateRow = sqlx::query_as(
            "UPDATE campaigns SET \
                 stats_sent = stats_sent + 1, \
                 successes_since_rate_limit = successes_since_rate_limit + 1 \
             WHERE id = $1 \
             RETURNING consecutive_rate_limits, last_rate_limit_at, successes_since_rate_limit",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(RateLimitState {
            consecutive_rate_limits: row.consecutive_rate_limits,
            last_rate_limit_at: row.last_rate_limit_at,
            successes_since_rate_limit: row.successes_since_rate_limit,
        })
    }

    async fn reset_rate_limit_counter(&self, id: CampaignId) -> Result<(), StoreError> {
        sqlx::query("UPDATE campaigns SET consecutive_rate_limits = 0 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_terminal_failure(&self, id: CampaignId) -> Result<CampaignStats, StoreError> {
        #[derive(FromRow)]
        struct StatsRow {
            stats_total: i64,
            stats_sent: i64,
            stats_failed: i64,
        }

        let row: StatsRow = sqlx::query_as(
            "UPDATE campaigns SET stats_failed = stats_failed + 1 \
             WHERE id = $1 \
             RETURNING stats_total, stats_sent, stats_failed",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(CampaignStats {
            total_targets: row.stats_total,
            sent: row.stats_sent,
            failed: row.stats_failed,
        })
    }

    async fn fetch_owner(&self, id: CampaignId) -> Result<Option<UserId>, StoreError> {
        let owner = sqlx::query_scalar("SELECT user_id FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(owner)
    }
}

#[derive(Debug, FromRow)]
struct TargetRow {
    id: i64,
    campaign_id: i64,
    external_id: String,
    username: String,
    display_name: Option<String>,
    status: String,
    retry_count: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TargetRow> for Target {
    type Error = StoreError;

    fn try_from(row: TargetRow) -> Result<Self, StoreError> {
        let status = TargetStatus::parse(&row.status).ok_or(StoreError::InvalidColumn {
            column: "targets.status",
            value: row.status.clone(),
        })?;

        Ok(Target {
            id: row.id,
            campaign_id: row.campaign_id,
            external_id: row.external_id,
            username: row.username,
            display_name: row.display_name,
            status,
            retry_count: row.retry_count,
            last_attempt_at: row.last_attempt_at,
            delivered_at: row.delivered_at,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl TargetStore for PostgresStore {
    async fn next_eligible(
        &self,
        campaign: CampaignId,
        max_attempts: i32,
    ) -> Result<Option<Target>, StoreError> {
        let row: Option<TargetRow> = sqlx::query_as(
            "SELECT id, campaign_id, external_id, username, display_name, status, \
                    retry_count, last_attempt_at, delivered_at, error_message, created_at \
             FROM targets \
             WHERE campaign_id = $1 \
               AND (status = 'pending' \
                    OR (status = 'failed' AND retry_count < $2)) \
             ORDER BY CASE WHEN status = 'pending' THEN 0 ELSE 1 END, \
                      created_at ASC, id ASC \
             LIMIT 1",
        )
        .bind(campaign)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Target::try_from).transpose()
    }

    async fn has_delivery_for_username(
        &self,
        campaign: CampaignId,
        username: &str,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM targets \
             WHERE campaign_id = $1 AND username = $2 AND status IN ('sent', 'followed')",
        )
        .bind(campaign)
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn begin_attempt(&self, id: TargetId) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE targets SET retry_count = retry_count + 1, last_attempt_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_attempt(&self, id: TargetId, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE targets SET retry_count = GREATEST(retry_count - 1, 0), error_message = $2 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_delivered(&self, id: TargetId, status: TargetStatus) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE targets SET status = $2, delivered_at = NOW(), error_message = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_skipped(&self, id: TargetId, reason: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE targets SET status = 'skipped', error_message = $2 WHERE id = $1")
            .bind(id)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: TargetId, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE targets SET status = 'failed', error_message = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn attempts_between(
        &self,
        campaign: CampaignId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM targets \
             WHERE campaign_id = $1 \
               AND (status IN ('sent', 'followed') OR retry_count > 0) \
               AND COALESCE(delivered_at, last_attempt_at) >= $2 \
               AND COALESCE(delivered_at, last_attempt_at) < $3",
        )
        .bind(campaign)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl UsageMeter for PostgresStore {
    async fn increment(&self, user: UserId, kind: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO usage_counters (user_id, day, dms, follows) \
             VALUES ($1, CURRENT_DATE, \
                     CASE WHEN $2 = 'dms' THEN 1 ELSE 0 END, \
                     CASE WHEN $2 = 'follows' THEN 1 ELSE 0 END) \
             ON CONFLICT (user_id, day) DO UPDATE SET \
                 dms = usage_counters.dms + EXCLUDED.dms, \
                 follows = usage_counters.follows + EXCLUDED.follows",
        )
        .bind(user)
        .bind(kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
