//! Lifecycle API routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::request::Parts,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tracing::info;

use cadence_scheduler::CampaignScheduler;
use cadence_store::{CampaignId, CampaignStore, UserId};

use crate::error::WebError;

/// Shared state for the API server.
pub struct AppState {
    pub scheduler: Arc<CampaignScheduler>,
    pub campaigns: Arc<dyn CampaignStore>,
}

/// Requesting user, taken from the `x-user-id` header the auth proxy sets.
pub struct AuthedUser(pub UserId);

impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = WebError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<UserId>().ok())
            .map(AuthedUser)
            .ok_or(WebError::Unauthorized)
    }
}

/// Create the API router.
pub fn create_router(
    scheduler: Arc<CampaignScheduler>,
    campaigns: Arc<dyn CampaignStore>,
) -> Router {
    let state = Arc::new(AppState {
        scheduler,
        campaigns,
    });

    Router::new()
        .route("/health", get(health))
        .route("/api/campaigns/{id}", get(campaign_detail))
        .route("/api/campaigns/{id}/start", post(start_campaign))
        .route("/api/campaigns/{id}/pause", post(pause_campaign))
        .route("/api/campaigns/{id}/stop", post(stop_campaign))
        .with_state(state)
}

/// Ensure the campaign exists and belongs to the requesting user.
async fn authorize(state: &AppState, id: CampaignId, user: UserId) -> Result<(), WebError> {
    match state.campaigns.fetch_owner(id).await? {
        None => Err(WebError::NotFound),
        Some(owner) if owner != user => Err(WebError::Forbidden),
        Some(_) => Ok(()),
    }
}

/// Current persisted status plus whether a loop is live, after a lifecycle
/// change.
async fn status_response(
    state: &AppState,
    id: CampaignId,
) -> Result<Json<serde_json::Value>, WebError> {
    let campaign = state.campaigns.fetch(id).await?.ok_or(WebError::NotFound)?;
    Ok(Json(json!({
        "id": campaign.id,
        "status": campaign.status,
        "running": state.scheduler.is_running(id),
    })))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "running_campaigns": state.scheduler.running_count(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn campaign_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
    AuthedUser(user): AuthedUser,
) -> Result<Json<serde_json::Value>, WebError> {
    authorize(&state, id, user).await?;
    let campaign = state.campaigns.fetch(id).await?.ok_or(WebError::NotFound)?;
    Ok(Json(json!({
        "campaign": campaign,
        "running": state.scheduler.is_running(id),
    })))
}

async fn start_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
    AuthedUser(user): AuthedUser,
) -> Result<Json<serde_json::Value>, WebError> {
    authorize(&state, id, user).await?;
    state.scheduler.start(id).await?;
    info!(campaign_id = id, user_id = user, "campaign started via api");
    status_response(&state, id).await
}

async fn pause_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
    AuthedUser(user): AuthedUser,
) -> Result<Json<serde_json::Value>, WebError> {
    authorize(&state, id, user).await?;
    state.scheduler.pause(id).await?;
    info!(campaign_id = id, user_id = user, "campaign paused via api");
    status_response(&state, id).await
}

async fn stop_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
    AuthedUser(user): AuthedUser,
) -> Result<Json<serde_json::Value>, WebError> {
    authorize(&state, id, user).await?;
    state.scheduler.stop(id).await?;
    info!(campaign_id = id, user_id = user, "campaign stopped via api");
    status_response(&state, id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    use cadence_scheduler::{ActionClient, ActionOutcome, ActionRequest};
    use cadence_store::{
        Campaign, CampaignKind, CampaignStats, CampaignStatus, MemoryStore, PacingConfig,
        RateLimitState,
    };

    /// Never completes an action, so started campaigns stay mid-flight for
    /// the duration of a test.
    struct PendingClient;

    #[async_trait]
    impl ActionClient for PendingClient {
        async fn send_action(&self, _request: ActionRequest) -> ActionOutcome {
            std::future::pending().await
        }
    }

    fn seed_campaign(store: &MemoryStore, id: CampaignId, owner: UserId) {
        store.insert_campaign(
            Campaign {
                id,
                user_id: owner,
                account_id: 1,
                name: format!("campaign {id}"),
                kind: CampaignKind::Dm,
                status: CampaignStatus::Ready,
                message_template: Some("Hey {{name}}!".to_string()),
                pacing: PacingConfig {
                    per_minute: 5,
                    delay_min_secs: 0,
                    delay_max_secs: 0,
                    daily_cap: 100,
                    retry_attempts: 1,
                },
                rate_limit: RateLimitState::default(),
                stats: CampaignStats::default(),
                created_at: Utc::now(),
            },
            "cred",
        );
        store.insert_target(id, "alice");
    }

    fn app(store: &Arc<MemoryStore>) -> Router {
        let scheduler = Arc::new(CampaignScheduler::new(
            store.clone(),
            store.clone(),
            Arc::new(PendingClient),
            store.clone(),
        ));
        create_router(scheduler, store.clone())
    }

    fn post(uri: &str, user: Option<i64>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user.to_string());
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn lifecycle_requires_user_header() {
        let store = Arc::new(MemoryStore::new());
        seed_campaign(&store, 1, 7);

        let response = app(&store)
            .oneshot(post("/api/campaigns/1/start", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            store.campaign(1).unwrap().status,
            CampaignStatus::Ready,
            "unauthorized request must not start the campaign"
        );
    }

    #[tokio::test]
    async fn owner_starts_a_campaign() {
        let store = Arc::new(MemoryStore::new());
        seed_campaign(&store, 1, 7);

        let response = app(&store)
            .oneshot(post("/api/campaigns/1/start", Some(7)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "active");
        assert_eq!(body["running"], true);
        assert_eq!(store.campaign(1).unwrap().status, CampaignStatus::Active);
    }

    #[tokio::test]
    async fn foreign_user_is_forbidden() {
        let store = Arc::new(MemoryStore::new());
        seed_campaign(&store, 1, 7);

        let response = app(&store)
            .oneshot(post("/api/campaigns/1/start", Some(8)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(store.campaign(1).unwrap().status, CampaignStatus::Ready);
    }

    #[tokio::test]
    async fn unknown_campaign_is_not_found() {
        let store = Arc::new(MemoryStore::new());

        let response = app(&store)
            .oneshot(post("/api/campaigns/42/start", Some(7)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn double_start_conflicts() {
        let store = Arc::new(MemoryStore::new());
        seed_campaign(&store, 1, 7);
        let app = app(&store);

        let first = app
            .clone()
            .oneshot(post("/api/campaigns/1/start", Some(7)))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(post("/api/campaigns/1/start", Some(7)))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn pause_and_stop_transition_status() {
        let store = Arc::new(MemoryStore::new());
        seed_campaign(&store, 1, 7);
        let app = app(&store);

        app.clone()
            .oneshot(post("/api/campaigns/1/start", Some(7)))
            .await
            .unwrap();

        let paused = app
            .clone()
            .oneshot(post("/api/campaigns/1/pause", Some(7)))
            .await
            .unwrap();
        assert_eq!(paused.status(), StatusCode::OK);
        let body = body_json(paused).await;
        assert_eq!(body["status"], "paused");
        assert_eq!(body["running"], false);

        let stopped = app
            .oneshot(post("/api/campaigns/1/stop", Some(7)))
            .await
            .unwrap();
        let body = body_json(stopped).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(store.campaign(1).unwrap().status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn campaign_detail_returns_the_row() {
        let store = Arc::new(MemoryStore::new());
        seed_campaign(&store, 1, 7);

        let request = Request::builder()
            .method("GET")
            .uri("/api/campaigns/1")
            .header("x-user-id", "7")
            .body(Body::empty())
            .unwrap();
        let response = app(&store).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["campaign"]["name"], "campaign 1");
        assert_eq!(body["campaign"]["status"], "ready");
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn health_reports_running_count() {
        let store = Arc::new(MemoryStore::new());

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app(&store).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["running_campaigns"], 0);
    }
}
