//! Action clients: the HTTP dispatcher bridge and a dry-run stand-in.

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use cadence_scheduler::{ActionClient, ActionOutcome, ActionRequest};

/// Forwards actions to the dispatcher service that holds the platform
/// integrations. A 429 response is reported as a rate limit; any other
/// non-success status or transport error is a plain failure.
pub struct HttpActionClient {
    client: reqwest::Client,
    dispatch_url: String,
}

impl HttpActionClient {
    pub fn new(dispatch_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            dispatch_url: dispatch_url.into(),
        }
    }
}

#[async_trait]
impl ActionClient for HttpActionClient {
    async fn send_action(&self, request: ActionRequest) -> ActionOutcome {
        let body = json!({
            "kind": request.kind.as_str(),
            "credential": request.credential,
            "username": request.username,
            "message": request.message,
        });

        let response = match self
            .client
            .post(format!("{}/dispatch", self.dispatch_url))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "dispatcher unreachable");
                return ActionOutcome::Failed {
                    message: format!("dispatcher unreachable: {e}"),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            return ActionOutcome::Delivered;
        }

        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ActionOutcome::RateLimited {
                message: (!text.is_empty()).then_some(text),
            }
        } else {
            ActionOutcome::Failed {
                message: if text.is_empty() {
                    format!("dispatcher returned {status}")
                } else {
                    text
                },
            }
        }
    }
}

/// Logs every action and reports success. Used with `--dry-run` and when
/// no dispatcher is configured.
pub struct DryRunClient;

#[async_trait]
impl ActionClient for DryRunClient {
    async fn send_action(&self, request: ActionRequest) -> ActionOutcome {
        info!(
            kind = request.kind.as_str(),
            username = %request.username,
            has_message = request.message.is_some(),
            "dry run, skipping dispatch"
        );
        ActionOutcome::Delivered
    }
}
