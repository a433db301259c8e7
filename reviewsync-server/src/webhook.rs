use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};

use reviewsync_core::policy::{evaluate, PolicyDecision, TriggerContext, DEFAULT_POLICIES};
use reviewsync_core::{PullRequestRef, SyncOutcome};

use crate::http::CorrelationId;
use crate::AppState;

const EVENT_HEADER: &str = "x-github-event";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Deserialize)]
pub struct GitHubWebhookPayload {
    pub action: Option<String>,
    pub pull_request: Option<PullRequest>,
    pub repository: Option<Repository>,
    pub installation: Option<Installation>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub body: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub name: String,
    pub owner: User,
}

#[derive(Debug, Deserialize, Clone)]
pub struct User {
    pub login: String,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

/// A webhook delivery that passed every policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub pull_request: PullRequestRef,
    pub body: String,
    pub installation_id: Option<u64>,
}

type HmacSha256 = Hmac<Sha256>;

fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Use constant-time verification
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_github_signature(&state.webhook_secret, &bytes, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let request = Request::from_parts(parts, axum::body::Body::from(bytes));
    Ok(next.run(request).await)
}

/// Apply the policies to a delivery. `Err` carries the name of the policy
/// that rejected it.
pub fn evaluate_trigger(
    event: &str,
    payload: &GitHubWebhookPayload,
) -> Result<Trigger, &'static str> {
    let ctx = TriggerContext {
        event: event.to_string(),
        action: payload.action.clone().unwrap_or_default(),
        pull_request_body: payload
            .pull_request
            .as_ref()
            .and_then(|pr| pr.body.clone()),
        has_pull_request: payload.pull_request.is_some(),
        has_repository: payload.repository.is_some(),
    };

    if let PolicyDecision::Deny { policy } = evaluate(DEFAULT_POLICIES, &ctx) {
        return Err(policy);
    }

    match (&payload.pull_request, &payload.repository) {
        (Some(pr), Some(repo)) => Ok(Trigger {
            pull_request: PullRequestRef::new(&repo.owner.login, &repo.name, pr.number),
            body: pr.body.clone().unwrap_or_default(),
            installation_id: payload.installation.as_ref().map(|i| i.id),
        }),
        _ => Err("has_pull_request"),
    }
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let event = headers
        .get(EVENT_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::BAD_REQUEST)?
        .to_string();

    let payload: GitHubWebhookPayload =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    let trigger = match evaluate_trigger(&event, &payload) {
        Ok(trigger) => trigger,
        Err(policy) => {
            info!(
                "Ignoring {} event (action {:?}): rejected by {}",
                event, payload.action, policy
            );
            return Ok(Json(WebhookResponse {
                message: format!("Ignored: {}", policy),
            }));
        }
    };

    let correlation_id = CorrelationId::new();
    info!(
        "Accepted {} event for {} (correlation id {})",
        event, trigger.pull_request, correlation_id.0
    );

    tokio::spawn(process_trigger(state, trigger, correlation_id));

    Ok(Json(WebhookResponse {
        message: "Sync scheduled".to_string(),
    }))
}

async fn process_trigger(state: Arc<AppState>, trigger: Trigger, correlation_id: CorrelationId) {
    let engine = state.engine(trigger.installation_id, correlation_id);

    match engine
        .sync_linked(&trigger.body, Some(&trigger.pull_request))
        .await
    {
        Ok(SyncOutcome::Applied(report)) => {
            if let Some(e) = report.transition_error {
                warn!(
                    "Sync for {} completed but the state change failed: {}",
                    trigger.pull_request, e
                );
            }
            info!(
                "Sync for {} completed: {} deleted, {} created, {} updated",
                trigger.pull_request, report.deleted, report.created, report.updated
            );
        }
        Ok(SyncOutcome::NoLink) => {
            info!("No work item linked from {}", trigger.pull_request);
        }
        Ok(SyncOutcome::Superseded) | Ok(SyncOutcome::Contended) => {
            info!(
                "Sync for {} skipped, another trigger handles it",
                trigger.pull_request
            );
        }
        Err(e) => {
            error!("Sync for {} failed: {:#}", trigger.pull_request, e);
        }
    }
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}
