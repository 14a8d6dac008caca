//! Domain model and persistence for cadence campaigns.
//!
//! This crate provides:
//! - Campaign/target domain types and their status machines
//! - Repository traits the scheduler and web layers depend on
//! - A PostgreSQL implementation with embedded migrations
//! - An in-memory implementation mirroring the same query semantics,
//!   used by scheduler tests

mod error;
pub mod memory;
pub mod postgres;
mod repo;
mod types;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::{PostgresStore, connect, run_migrations};
pub use repo::{CampaignStore, TargetStore, UsageMeter};
pub use types::{
    Campaign, CampaignExecution, CampaignId, CampaignKind, CampaignStats, CampaignStatus,
    PacingConfig, RateLimitState, Target, TargetId, TargetStatus, UserId,
};
