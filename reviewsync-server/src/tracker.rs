//! Pivotal Tracker v5 API client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

use reviewsync_core::{
    NewReviewRecord, ProjectMember, PullRequestRef, ReviewRecord, ReviewType, Tracker,
    TrackerReviewStatus, WorkItem,
};

use crate::http::{ensure_success, CorrelationId};

const TOKEN_HEADER: &str = "X-TrackerToken";
const STORY_FIELDS: &str = "current_state,project_id,owner_ids,reviews,pull_requests";

#[derive(Clone)]
pub struct TrackerClient {
    client: ClientWithMiddleware,
    api_url: String,
    token: String,
    correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Deserialize)]
struct StoryResponse {
    id: u64,
    current_state: String,
    project_id: u64,
    #[serde(default)]
    owner_ids: Vec<u64>,
    #[serde(default)]
    reviews: Vec<StoryReviewResponse>,
    #[serde(default)]
    pull_requests: Vec<StoryPullRequestResponse>,
}

#[derive(Debug, Deserialize)]
struct StoryReviewResponse {
    id: u64,
    review_type_id: u64,
    reviewer_id: u64,
    status: TrackerReviewStatus,
}

#[derive(Debug, Deserialize)]
struct StoryPullRequestResponse {
    owner: String,
    repo: String,
    number: u64,
}

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    #[serde(default)]
    review_types: Vec<ReviewTypeResponse>,
}

#[derive(Debug, Deserialize)]
struct ReviewTypeResponse {
    id: u64,
    name: String,
    #[serde(default)]
    hidden: bool,
}

#[derive(Debug, Deserialize)]
struct MembershipResponse {
    person: PersonResponse,
}

#[derive(Debug, Deserialize)]
struct PersonResponse {
    id: u64,
    username: String,
}

#[derive(Debug, Serialize)]
struct CreateReviewRequest {
    review_type_id: u64,
    reviewer_id: u64,
    status: TrackerReviewStatus,
}

#[derive(Debug, Serialize)]
struct UpdateReviewRequest {
    status: TrackerReviewStatus,
}

#[derive(Debug, Serialize)]
struct UpdateStoryRequest<'a> {
    current_state: &'a str,
}

impl TrackerClient {
    pub fn new(
        client: ClientWithMiddleware,
        api_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            token: token.into(),
            correlation_id: None,
        }
    }

    /// Copy of this client tagging its requests with `correlation_id`.
    pub fn with_correlation_id(&self, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..self.clone()
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}/{}", self.api_url, path))
            .header(TOKEN_HEADER, &self.token);

        if let Some(cid) = &self.correlation_id {
            builder = builder.with_extension(cid.clone());
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;
        ensure_success(response, what).await
    }
}

#[async_trait]
impl Tracker for TrackerClient {
    async fn get_work_item(&self, id: &str) -> Result<WorkItem> {
        info!("Fetching story {}", id);

        let builder = self
            .request(Method::GET, &format!("stories/{}", id))
            .query(&[("fields", STORY_FIELDS)]);
        let story: StoryResponse = self
            .send(builder, "Tracker fetch story")
            .await?
            .json()
            .await
            .context("Failed to parse story response")?;

        Ok(WorkItem {
            id: story.id.to_string(),
            lifecycle_state: story.current_state,
            project_id: story.project_id,
            owner_ids: story.owner_ids,
            review_records: story
                .reviews
                .into_iter()
                .map(|review| ReviewRecord {
                    id: review.id,
                    review_type_id: review.review_type_id,
                    reviewer_id: review.reviewer_id,
                    status: review.status,
                })
                .collect(),
            linked_pull_requests: story
                .pull_requests
                .into_iter()
                .map(|pr| PullRequestRef::new(pr.owner, pr.repo, pr.number))
                .collect(),
        })
    }

    async fn get_review_types(&self, project_id: u64) -> Result<Vec<ReviewType>> {
        let builder = self
            .request(Method::GET, &format!("projects/{}", project_id))
            .query(&[("fields", "review_types")]);
        let project: ProjectResponse = self
            .send(builder, "Tracker fetch review types")
            .await?
            .json()
            .await
            .context("Failed to parse project response")?;

        Ok(project
            .review_types
            .into_iter()
            .filter(|review_type| !review_type.hidden)
            .map(|review_type| ReviewType {
                id: review_type.id,
                name: review_type.name,
            })
            .collect())
    }

    async fn get_project_members(&self, project_id: u64) -> Result<Vec<ProjectMember>> {
        let builder = self.request(
            Method::GET,
            &format!("projects/{}/memberships", project_id),
        );
        let memberships: Vec<MembershipResponse> = self
            .send(builder, "Tracker fetch memberships")
            .await?
            .json()
            .await
            .context("Failed to parse memberships response")?;

        Ok(memberships
            .into_iter()
            .map(|membership| ProjectMember {
                id: membership.person.id,
                username: membership.person.username,
            })
            .collect())
    }

    async fn create_review_record(&self, work_item_id: &str, review: &NewReviewRecord) -> Result<()> {
        let builder = self
            .request(Method::POST, &format!("stories/{}/reviews", work_item_id))
            .json(&CreateReviewRequest {
                review_type_id: review.review_type_id,
                reviewer_id: review.reviewer_id,
                status: review.status,
            });
        self.send(builder, "Tracker create review").await?;
        Ok(())
    }

    async fn update_review_record(
        &self,
        work_item_id: &str,
        record_id: u64,
        status: TrackerReviewStatus,
    ) -> Result<()> {
        let builder = self
            .request(
                Method::PUT,
                &format!("stories/{}/reviews/{}", work_item_id, record_id),
            )
            .json(&UpdateReviewRequest { status });
        self.send(builder, "Tracker update review").await?;
        Ok(())
    }

    async fn delete_review_record(&self, work_item_id: &str, record_id: u64) -> Result<()> {
        let builder = self.request(
            Method::DELETE,
            &format!("stories/{}/reviews/{}", work_item_id, record_id),
        );
        self.send(builder, "Tracker delete review").await?;
        Ok(())
    }

    async fn set_lifecycle_state(&self, work_item_id: &str, state: &str) -> Result<()> {
        info!("Setting story {} to {}", work_item_id, state);

        let builder = self
            .request(Method::PUT, &format!("stories/{}", work_item_id))
            .json(&UpdateStoryRequest {
                current_state: state,
            });
        self.send(builder, "Tracker update story").await?;
        Ok(())
    }
}
