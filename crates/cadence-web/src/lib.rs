//! HTTP API for campaign lifecycle control.
//!
//! Thin layer over the scheduler: owner-scoped start/pause/stop plus a
//! read-only campaign view. Authentication is delegated to a fronting
//! proxy that injects `x-user-id`.

pub mod error;
pub mod routes;

pub use error::WebError;
pub use routes::{AppState, AuthedUser, create_router};
