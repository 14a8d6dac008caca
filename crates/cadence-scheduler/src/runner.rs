//! Per-campaign control loop.
//!
//! One loop per active campaign ticks on a fixed one-second period. Each
//! fire spawns a tick task that bounces off the campaign's in-flight guard,
//! so a slow tick (action call, pacing sleep, backoff sleep) never overlaps
//! the next one. Campaigns run concurrently with respect to each other; a
//! sleeping tick suspends only its own campaign.
//!
//! `pause`/`stop` cancel future ticks; a tick already inside the action
//! client call or a pacing sleep completes and writes its result.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use cadence_store::{
    Campaign, CampaignId, CampaignKind, CampaignStats, CampaignStatus, CampaignStore, Target,
    TargetStore, UsageMeter,
};

use crate::action::{ActionClient, ActionOutcome, ActionRequest};
use crate::error::SchedulerError;
use crate::pacing;
use crate::registry::CampaignRegistry;

/// Fixed tick period. Deliberately not configurable.
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Attempts before the follow-campaign failure-rate check applies.
const FAILURE_RATE_MIN_ATTEMPTS: i64 = 10;

/// Failure share beyond which a follow campaign auto-pauses.
const FAILURE_RATE_THRESHOLD: f64 = 0.2;

/// The campaign scheduler: lifecycle API plus the per-campaign tick loop.
pub struct CampaignScheduler {
    campaigns: Arc<dyn CampaignStore>,
    targets: Arc<dyn TargetStore>,
    client: Arc<dyn ActionClient>,
    usage: Arc<dyn UsageMeter>,
    registry: CampaignRegistry,
}

impl CampaignScheduler {
    /// Create a new scheduler. Constructed once at process start and shared
    /// behind an `Arc`.
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        targets: Arc<dyn TargetStore>,
        client: Arc<dyn ActionClient>,
        usage: Arc<dyn UsageMeter>,
    ) -> Self {
        Self {
            campaigns,
            targets,
            client,
            usage,
            registry: CampaignRegistry::new(),
        }
    }

    /// Number of loops currently running.
    pub fn running_count(&self) -> usize {
        self.registry.running_count()
    }

    /// Whether a loop currently owns this campaign.
    pub fn is_running(&self, id: CampaignId) -> bool {
        self.registry.is_running(id)
    }

    /// Start the campaign's loop: persist status `active`, register a
    /// recurring one-second tick, and return immediately.
    ///
    /// Fails with [`SchedulerError::AlreadyRunning`] when a loop already
    /// owns the campaign.
    #[tracing::instrument(skip(self))]
    pub async fn start(self: &Arc<Self>, id: CampaignId) -> Result<(), SchedulerError> {
        let campaign = self
            .campaigns
            .fetch(id)
            .await?
            .ok_or(SchedulerError::CampaignNotFound(id))?;
        campaign
            .pacing
            .validate()
            .map_err(SchedulerError::InvalidPacing)?;

        let Some(shutdown_rx) = self.registry.register(id) else {
            return Err(SchedulerError::AlreadyRunning(id));
        };

        if let Err(e) = self
            .campaigns
            .set_status(id, CampaignStatus::Active)
            .await
        {
            self.registry.cancel(id);
            return Err(e.into());
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_loop(id, shutdown_rx).await;
        });

        info!(campaign_id = id, "campaign started");
        Ok(())
    }

    /// Cancel the recurring tick and persist status `paused`. Idempotent:
    /// pausing a non-running campaign is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn pause(&self, id: CampaignId) -> Result<(), SchedulerError> {
        let was_running = self.registry.cancel(id);

        // Only an active campaign moves to paused; completed stays terminal.
        if let Some(campaign) = self.campaigns.fetch(id).await?
            && campaign.status == CampaignStatus::Active
        {
            self.campaigns.set_status(id, CampaignStatus::Paused).await?;
        }

        if was_running {
            info!(campaign_id = id, "campaign paused");
        }
        Ok(())
    }

    /// Cancel the recurring tick, clear the campaign's in-memory rate
    /// window and in-flight guard, and persist status `completed`. Stopping
    /// an already-completed campaign is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, id: CampaignId) -> Result<(), SchedulerError> {
        self.registry.cancel(id);
        self.registry.clear_runtime_state(id);

        if let Some(campaign) = self.campaigns.fetch(id).await?
            && campaign.status != CampaignStatus::Completed
        {
            self.campaigns
                .set_status(id, CampaignStatus::Completed)
                .await?;
            info!(campaign_id = id, "campaign stopped");
        }
        Ok(())
    }

    /// Restart a loop for every campaign whose persisted status is
    /// `active`. Called exactly once at process startup to recover from a
    /// restart; nothing else auto-starts campaigns.
    pub async fn resume_all(self: &Arc<Self>) -> Result<usize, SchedulerError> {
        let ids = self.campaigns.active_ids().await?;
        let mut resumed = 0;
        for id in ids {
            match self.start(id).await {
                Ok(()) => resumed += 1,
                Err(SchedulerError::AlreadyRunning(_)) => {}
                Err(e) => warn!(campaign_id = id, error = %e, "failed to resume campaign"),
            }
        }
        info!(count = resumed, "resumed active campaigns");
        Ok(resumed)
    }

    /// The recurring timer owned by one campaign. Each fire spawns a tick
    /// task; overlap protection lives in the in-flight guard, not here.
    async fn run_loop(self: Arc<Self>, id: CampaignId, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(campaign_id = id, "campaign loop running");

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move {
                        scheduler.tick(id).await;
                    });
                }
            }
        }

        debug!(campaign_id = id, "campaign loop stopped");
    }

    /// One scheduled invocation of the control-loop body.
    async fn tick(self: Arc<Self>, id: CampaignId) {
        let guard = self.registry.guard(id);
        // A previous tick still inside the action call or a pacing sleep
        // owns the guard; skip silently. The permit drops on every exit
        // path, including errors and panics.
        let Ok(_in_flight) = guard.try_lock() else {
            return;
        };

        if let Err(e) = self.run_tick(id).await {
            error!(campaign_id = id, error = %e, "tick failed");
        }
    }

    async fn run_tick(&self, id: CampaignId) -> Result<(), SchedulerError> {
        // Deleted, paused, or stopped behind our back: stop scheduling.
        let Some(execution) = self.campaigns.fetch_for_execution(id).await? else {
            debug!(campaign_id = id, "campaign no longer active, cancelling loop");
            self.registry.cancel(id);
            return Ok(());
        };
        let campaign = execution.campaign;
        let pacing_cfg = campaign.pacing;

        let window = self.registry.window(id);
        let in_last_minute = window.count_in_last_minute();
        if in_last_minute >= pacing_cfg.per_minute as usize {
            return Ok(());
        }

        let (day_start, day_end) = local_day_bounds(Local::now());
        let attempts_today = self.targets.attempts_between(id, day_start, day_end).await?;
        if attempts_today >= i64::from(pacing_cfg.daily_cap) {
            warn!(
                campaign_id = id,
                cap = pacing_cfg.daily_cap,
                "daily cap reached, pausing campaign"
            );
            self.pause(id).await?;
            return Ok(());
        }

        let max_attempts = pacing::max_attempts(pacing_cfg.retry_attempts);
        let Some(target) = self.targets.next_eligible(id, max_attempts).await? else {
            info!(campaign_id = id, "no targets left, campaign completed");
            self.stop(id).await?;
            return Ok(());
        };

        if self
            .targets
            .has_delivery_for_username(id, &target.username)
            .await?
        {
            let reason = match campaign.kind {
                CampaignKind::Dm => "Already sent to this user",
                CampaignKind::Follow => "Already followed",
            };
            self.targets.mark_skipped(target.id, reason).await?;
            debug!(
                campaign_id = id,
                username = %target.username,
                "duplicate target skipped"
            );
            return Ok(());
        }

        // Consume the attempt before the call so a crash mid-send counts as
        // an attempt instead of retrying forever.
        self.targets.begin_attempt(target.id).await?;
        let attempt_number = target.retry_count + 1;

        info!(
            campaign_id = id,
            username = %target.username,
            attempt = attempt_number,
            per_minute = in_last_minute + 1,
            per_minute_cap = pacing_cfg.per_minute,
            today = attempts_today + 1,
            daily_cap = pacing_cfg.daily_cap,
            "attempting action"
        );

        let message = match (campaign.kind, campaign.message_template.as_deref()) {
            (CampaignKind::Dm, Some(template)) => Some(pacing::render_template(
                template,
                &target.username,
                target.display_name.as_deref(),
            )),
            _ => None,
        };
        let outcome = self
            .client
            .send_action(ActionRequest {
                kind: campaign.kind,
                credential: execution.credential,
                username: target.username.clone(),
                message,
            })
            .await;

        match outcome {
            ActionOutcome::Delivered => self.handle_delivered(&campaign, &target).await,
            ActionOutcome::RateLimited { message } => {
                self.handle_rate_limited(&campaign, &target, message).await
            }
            ActionOutcome::Failed { message } => {
                self.handle_failed(&campaign, &target, attempt_number, &message)
                    .await
            }
        }
    }

    async fn handle_delivered(
        &self,
        campaign: &Campaign,
        target: &Target,
    ) -> Result<(), SchedulerError> {
        self.registry.window(campaign.id).record();
        self.targets
            .mark_delivered(target.id, campaign.kind.delivered_status())
            .await?;

        let state = self.campaigns.record_delivery(campaign.id).await?;
        if state.successes_since_rate_limit >= pacing::TRUST_RESTORE_STREAK
            && state.consecutive_rate_limits > 0
        {
            self.campaigns.reset_rate_limit_counter(campaign.id).await?;
            info!(
                campaign_id = campaign.id,
                streak = state.successes_since_rate_limit,
                "rate limit counter cleared after sustained success"
            );
        }

        // Advisory only: metering failures never fail the action.
        if let Err(e) = self
            .usage
            .increment(campaign.user_id, campaign.kind.usage_key())
            .await
        {
            warn!(campaign_id = campaign.id, error = %e, "usage metering failed");
        }

        let delay = pacing::pacing_delay(&campaign.pacing);
        debug!(
            campaign_id = campaign.id,
            username = %target.username,
            delay_secs = delay.as_secs(),
            "delivered, pacing"
        );
        sleep(delay).await;
        Ok(())
    }

    async fn handle_rate_limited(
        &self,
        campaign: &Campaign,
        target: &Target,
        message: Option<String>,
    ) -> Result<(), SchedulerError> {
        let consecutive = self.campaigns.record_rate_limit(campaign.id).await?;

        // Rate limiting is the account's problem, not the target's: give
        // the consumed attempt back.
        let note = message.unwrap_or_else(|| "Platform rate limit".to_string());
        self.targets.cancel_attempt(target.id, &note).await?;

        let backoff = pacing::backoff_duration(consecutive);
        warn!(
            campaign_id = campaign.id,
            consecutive,
            backoff_secs = backoff.as_secs(),
            "rate limited, backing off"
        );
        sleep(backoff).await;
        Ok(())
    }

    async fn handle_failed(
        &self,
        campaign: &Campaign,
        target: &Target,
        attempt_number: i32,
        message: &str,
    ) -> Result<(), SchedulerError> {
        if let Some(reason) = pacing::classify_permanent(message) {
            // Never retried, regardless of remaining budget.
            self.targets.mark_skipped(target.id, reason).await?;
            warn!(
                campaign_id = campaign.id,
                username = %target.username,
                reason,
                "permanent rejection, target skipped"
            );
        } else {
            self.targets.record_failure(target.id, message).await?;
            let max_attempts = pacing::max_attempts(campaign.pacing.retry_attempts);
            if attempt_number >= max_attempts {
                let stats = self.campaigns.record_terminal_failure(campaign.id).await?;
                warn!(
                    campaign_id = campaign.id,
                    username = %target.username,
                    attempts = attempt_number,
                    error = %message,
                    "target failed permanently"
                );
                self.maybe_pause_on_failure_rate(campaign, stats).await?;
            } else {
                debug!(
                    campaign_id = campaign.id,
                    username = %target.username,
                    attempt = attempt_number,
                    max_attempts,
                    error = %message,
                    "attempt failed, will retry"
                );
            }
        }

        sleep(pacing::pacing_delay(&campaign.pacing)).await;
        Ok(())
    }

    /// Follow campaigns pause themselves once failures dominate; a high
    /// failure rate usually means the account is flagged.
    async fn maybe_pause_on_failure_rate(
        &self,
        campaign: &Campaign,
        stats: CampaignStats,
    ) -> Result<(), SchedulerError> {
        if campaign.kind != CampaignKind::Follow {
            return Ok(());
        }
        let attempts = stats.sent + stats.failed;
        if attempts < FAILURE_RATE_MIN_ATTEMPTS {
            return Ok(());
        }
        let failure_rate = stats.failed as f64 / attempts as f64;
        if failure_rate > FAILURE_RATE_THRESHOLD {
            warn!(
                campaign_id = campaign.id,
                failure_rate = format!("{:.1}%", failure_rate * 100.0),
                "high failure rate, pausing campaign"
            );
            self.pause(campaign.id).await?;
        }
        Ok(())
    }
}

/// UTC bounds `[start, end)` of the local calendar day containing `now`.
/// The daily cap counts attempts by the operator's civil date, so the span
/// is 23 to 25 hours on a DST transition day.
fn local_day_bounds(now: DateTime<Local>) -> (DateTime<Utc>, DateTime<Utc>) {
    let day = now.date_naive();
    (
        local_midnight(day),
        local_midnight(day + ChronoDuration::days(1)),
    )
}

/// First valid instant of the local day. Some zones skip midnight on a
/// spring-forward day; step ahead until the wall time exists.
fn local_midnight(day: NaiveDate) -> DateTime<Utc> {
    let mut wall = day.and_time(NaiveTime::MIN);
    loop {
        if let Some(local) = Local.from_local_datetime(&wall).earliest() {
            return local.with_timezone(&Utc);
        }
        wall += ChronoDuration::hours(1);
    }
}
