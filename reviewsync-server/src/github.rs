use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use reviewsync_core::{
    CodeHost, PullRequestDetails, PullRequestRef, ReviewEvent, ReviewEventState,
};

use crate::http::{ensure_success, CorrelationId};

const REVIEWS_PER_PAGE: usize = 100;
const ACCEPT: &str = "application/vnd.github.v3+json";

/// How requests to GitHub are authenticated.
#[derive(Clone)]
pub enum GitHubAuth {
    /// Personal access or other static token.
    Token(String),
    /// GitHub App credentials; installation tokens are minted on demand.
    App { app_id: u64, private_key: String },
}

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_url: String,
    auth: GitHubAuth,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
    installation_cache: Arc<RwLock<HashMap<String, u64>>>,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct InstallationResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct LabelResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    repo: Option<RepoResponse>,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    user: UserResponse,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    labels: Vec<LabelResponse>,
    #[serde(default)]
    requested_reviewers: Vec<UserResponse>,
    head: BranchResponse,
    base: BranchResponse,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    id: u64,
    user: Option<UserResponse>,
    state: ReviewEventState,
    submitted_at: Option<DateTime<Utc>>,
}

impl GitHubClient {
    pub fn new(client: ClientWithMiddleware, api_url: impl Into<String>, auth: GitHubAuth) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            auth,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
            installation_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A [`CodeHost`] view of this client bound to one App installation.
    ///
    /// Without an installation id the installation is looked up per
    /// repository; with token auth the id is ignored.
    pub fn scoped(
        &self,
        installation_id: Option<u64>,
        correlation_id: Option<CorrelationId>,
    ) -> InstallationScope {
        InstallationScope {
            client: self.clone(),
            installation_id,
            correlation_id,
        }
    }

    fn generate_jwt(app_id: u64, private_key: &str) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    async fn installation_for_repo(&self, jwt: &str, owner: &str, repo: &str) -> Result<u64> {
        let cache_key = format!("{}/{}", owner, repo);
        if let Some(id) = self.installation_cache.read().await.get(&cache_key) {
            return Ok(*id);
        }

        let url = format!("{}/repos/{}/{}/installation", self.api_url, owner, repo);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", ACCEPT)
            .send()
            .await
            .context("Failed to send installation lookup request")?;

        let installation: InstallationResponse =
            ensure_success(response, "GitHub installation lookup")
                .await?
                .json()
                .await
                .context("Failed to parse installation response")?;

        self.installation_cache
            .write()
            .await
            .insert(cache_key, installation.id);
        Ok(installation.id)
    }

    async fn get_installation_token(
        &self,
        app_id: u64,
        private_key: &str,
        installation_id: Option<u64>,
        pr: &PullRequestRef,
    ) -> Result<(u64, String)> {
        let jwt = Self::generate_jwt(app_id, private_key)?;
        let installation_id = match installation_id {
            Some(id) => id,
            None => self.installation_for_repo(&jwt, &pr.owner, &pr.repo).await?,
        };

        // Check if current token is still valid (with 5 minute buffer)
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok((installation_id, token.clone()));
                }
            }
        }

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        );

        info!("Requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", ACCEPT)
            .send()
            .await
            .context("Failed to send installation token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(
                "GitHub App token request failed: {} - {}",
                status, error_text
            );
            return Err(anyhow!(
                "GitHub App token request failed: {} - {}",
                status,
                error_text
            ));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);

        let expires_at_system =
            UNIX_EPOCH + std::time::Duration::from_secs(expires_at.timestamp().max(0) as u64);

        self.token_cache.write().await.insert(
            installation_id,
            (token_response.token.clone(), expires_at_system),
        );

        info!("Successfully obtained installation access token");
        Ok((installation_id, token_response.token))
    }

    async fn token(&self, installation_id: Option<u64>, pr: &PullRequestRef) -> Result<(Option<u64>, String)> {
        match &self.auth {
            GitHubAuth::Token(token) => Ok((None, token.clone())),
            GitHubAuth::App {
                app_id,
                private_key,
            } => {
                let (id, token) = self
                    .get_installation_token(*app_id, private_key, installation_id, pr)
                    .await?;
                Ok((Some(id), token))
            }
        }
    }

    /// GET `url`, retrying once with a fresh installation token on 401.
    async fn get(
        &self,
        url: &str,
        installation_id: Option<u64>,
        correlation_id: Option<&CorrelationId>,
        pr: &PullRequestRef,
    ) -> Result<reqwest::Response> {
        let (resolved_installation, token) = self.token(installation_id, pr).await?;
        let response = self.send_get(url, &token, correlation_id).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(installation_id) = resolved_installation else {
            return Ok(response);
        };

        warn!("Got 401 from {}, retrying with fresh token", url);
        self.token_cache.write().await.remove(&installation_id);
        let (_, fresh_token) = self.token(Some(installation_id), pr).await?;
        self.send_get(url, &fresh_token, correlation_id).await
    }

    async fn send_get(
        &self,
        url: &str,
        token: &str,
        correlation_id: Option<&CorrelationId>,
    ) -> Result<reqwest::Response> {
        let mut request_builder = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", ACCEPT);

        if let Some(cid) = correlation_id {
            request_builder = request_builder.with_extension(cid.clone());
        }

        request_builder
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))
    }

    pub async fn get_pull_request(
        &self,
        installation_id: Option<u64>,
        correlation_id: Option<&CorrelationId>,
        pr: &PullRequestRef,
    ) -> Result<PullRequestDetails> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}",
            self.api_url, pr.owner, pr.repo, pr.number
        );

        info!("Fetching PR {}", pr);

        let response = self.get(&url, installation_id, correlation_id, pr).await?;
        let pr_response: PullRequestResponse = ensure_success(response, "GitHub fetch PR")
            .await?
            .json()
            .await
            .context("Failed to parse pull request response")?;

        let repo_name = pr_response
            .head
            .repo
            .or(pr_response.base.repo)
            .map(|repo| repo.name)
            .unwrap_or_else(|| pr.repo.clone());

        Ok(PullRequestDetails {
            repo_name,
            author: pr_response.user.login,
            merged: pr_response.merged,
            draft: pr_response.draft,
            labels: pr_response.labels.into_iter().map(|l| l.name).collect(),
            requested_reviewers: pr_response
                .requested_reviewers
                .into_iter()
                .map(|u| u.login)
                .collect(),
        })
    }

    pub async fn list_reviews(
        &self,
        installation_id: Option<u64>,
        correlation_id: Option<&CorrelationId>,
        pr: &PullRequestRef,
    ) -> Result<Vec<ReviewEvent>> {
        let mut all_reviews = Vec::new();
        let mut page = 1;

        loop {
            let url = format!(
                "{}/repos/{}/{}/pulls/{}/reviews?page={}&per_page={}",
                self.api_url, pr.owner, pr.repo, pr.number, page, REVIEWS_PER_PAGE
            );

            let response = self.get(&url, installation_id, correlation_id, pr).await?;
            let reviews: Vec<ReviewResponse> = ensure_success(response, "GitHub list reviews")
                .await?
                .json()
                .await
                .context("Failed to parse reviews response")?;
            let reviews_count = reviews.len();

            // Reviews by deleted accounts have no user
            all_reviews.extend(reviews.into_iter().filter_map(|review| {
                review.user.map(|user| {
                    ReviewEvent::new(review.id, user.login, review.state, review.submitted_at)
                })
            }));

            // If we got fewer reviews than per_page, we've reached the last page
            if reviews_count < REVIEWS_PER_PAGE {
                break;
            }
            page += 1;
        }

        info!("Found {} total reviews on PR {}", all_reviews.len(), pr);
        Ok(all_reviews)
    }
}

/// [`GitHubClient`] bound to the installation and trigger a run belongs to.
#[derive(Clone)]
pub struct InstallationScope {
    client: GitHubClient,
    installation_id: Option<u64>,
    correlation_id: Option<CorrelationId>,
}

#[async_trait]
impl CodeHost for InstallationScope {
    async fn get_pull_request(&self, pr: &PullRequestRef) -> Result<PullRequestDetails> {
        self.client
            .get_pull_request(self.installation_id, self.correlation_id.as_ref(), pr)
            .await
    }

    async fn list_reviews(&self, pr: &PullRequestRef) -> Result<Vec<ReviewEvent>> {
        self.client
            .list_reviews(self.installation_id, self.correlation_id.as_ref(), pr)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::create_http_client;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> GitHubClient {
        GitHubClient::new(
            create_http_client().unwrap(),
            server.base_url(),
            GitHubAuth::Token("test-token".to_string()),
        )
    }

    fn review_json(id: u64, login: &str, state: &str) -> serde_json::Value {
        json!({
            "id": id,
            "user": { "login": login },
            "state": state,
            "submitted_at": "2024-05-01T12:00:00Z"
        })
    }

    #[tokio::test]
    async fn test_get_pull_request_maps_fields() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/acme/web/pulls/7")
                    .header("Authorization", "Bearer test-token");
                then.status(200).json_body(json!({
                    "number": 7,
                    "user": { "login": "hero" },
                    "merged": false,
                    "draft": true,
                    "labels": [{ "name": "WIP" }, { "name": "backend" }],
                    "requested_reviewers": [{ "login": "u1" }],
                    "head": { "repo": { "name": "web-fork" } },
                    "base": { "repo": { "name": "web" } }
                }));
            })
            .await;

        let pr = PullRequestRef::new("acme", "web", 7);
        let details = client(&server).scoped(None, None).get_pull_request(&pr).await.unwrap();

        mock.assert_async().await;
        assert_eq!(details.repo_name, "web-fork");
        assert_eq!(details.author, "hero");
        assert!(details.draft);
        assert!(!details.merged);
        assert_eq!(details.labels, vec!["WIP", "backend"]);
        assert_eq!(details.requested_reviewers, vec!["u1"]);
    }

    #[tokio::test]
    async fn test_get_pull_request_without_head_repo_uses_base() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/web/pulls/7");
                then.status(200).json_body(json!({
                    "user": { "login": "hero" },
                    "merged": true,
                    "head": { "repo": null },
                    "base": { "repo": { "name": "web" } }
                }));
            })
            .await;

        let pr = PullRequestRef::new("acme", "web", 7);
        let details = client(&server).get_pull_request(None, None, &pr).await.unwrap();

        assert_eq!(details.repo_name, "web");
        assert!(details.merged);
        assert!(details.labels.is_empty());
    }

    #[tokio::test]
    async fn test_list_reviews_pages_through_all_results() {
        let server = MockServer::start_async().await;
        let first_page: Vec<_> = (0..100)
            .map(|i| review_json(i, &format!("user{}", i), "COMMENTED"))
            .collect();
        let page_one = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/acme/web/pulls/7/reviews")
                    .query_param("page", "1")
                    .query_param("per_page", "100");
                then.status(200).json_body(json!(first_page));
            })
            .await;
        let page_two = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/acme/web/pulls/7/reviews")
                    .query_param("page", "2");
                then.status(200).json_body(json!([
                    review_json(100, "last", "APPROVED"),
                    { "id": 101, "user": null, "state": "COMMENTED", "submitted_at": null }
                ]));
            })
            .await;

        let pr = PullRequestRef::new("acme", "web", 7);
        let reviews = client(&server).list_reviews(None, None, &pr).await.unwrap();

        page_one.assert_async().await;
        page_two.assert_async().await;
        assert_eq!(reviews.len(), 101);
        assert_eq!(reviews[100].reviewer, "last");
        assert_eq!(reviews[100].state, ReviewEventState::Approved);
    }

    #[tokio::test]
    async fn test_unknown_review_state_is_tolerated() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/web/pulls/7/reviews");
                then.status(200)
                    .json_body(json!([review_json(1, "u1", "PENDING")]));
            })
            .await;

        let pr = PullRequestRef::new("acme", "web", 7);
        let reviews = client(&server).list_reviews(None, None, &pr).await.unwrap();

        assert_eq!(reviews[0].state, ReviewEventState::Unknown);
    }

    #[tokio::test]
    async fn test_error_response_is_propagated() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/web/pulls/7");
                then.status(404).body("Not Found");
            })
            .await;

        let pr = PullRequestRef::new("acme", "web", 7);
        let err = client(&server)
            .get_pull_request(None, None, &pr)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("404"));
    }
}
