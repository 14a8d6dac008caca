//! Campaign pacing and retry scheduler.
//!
//! Drives one timer loop per active campaign: each tick enforces the
//! per-minute window and daily cap, picks the next eligible target, invokes
//! the action client, and applies the delivery/rate-limit/failure policy.

pub mod action;
pub mod error;
pub mod pacing;
pub mod rate_window;
pub mod registry;
pub mod runner;

pub use action::{ActionClient, ActionOutcome, ActionRequest};
pub use error::SchedulerError;
pub use rate_window::RateWindow;
pub use registry::CampaignRegistry;
pub use runner::CampaignScheduler;
