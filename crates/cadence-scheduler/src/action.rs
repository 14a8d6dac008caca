//! Contract for the capability that performs one unit of work against the
//! external platform.

use async_trait::async_trait;

use cadence_store::CampaignKind;

/// Tri-state result of one platform action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The message was sent / the user was followed.
    Delivered,
    /// The platform throttled the account. Not the target's fault; must not
    /// consume the target's retry budget.
    RateLimited { message: Option<String> },
    /// Any other failure, with the platform's error text.
    Failed { message: String },
}

/// One unit of work handed to the action client.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub kind: CampaignKind,
    /// Opaque account credential.
    pub credential: String,
    pub username: String,
    /// Rendered message body (DM campaigns only).
    pub message: Option<String>,
}

/// Capability invoked by the scheduler to act against the platform.
#[async_trait]
pub trait ActionClient: Send + Sync {
    /// Perform one action. Implementations must classify rate-limit
    /// responses distinctly from generic failures, and must return promptly:
    /// the calling tick blocks on this.
    async fn send_action(&self, request: ActionRequest) -> ActionOutcome;
}
