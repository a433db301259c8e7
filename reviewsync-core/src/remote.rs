//! Interfaces of the two remote services the engine talks to.
//!
//! Concrete HTTP clients live in `reviewsync-server`; tests use the fakes in
//! [`crate::testing`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pull::{PullRequestDetails, PullRequestRef};
use crate::reconcile::{NewReviewRecord, ProjectMember, ReviewRecord, ReviewType};
use crate::review::ReviewEvent;
use crate::target::TrackerReviewStatus;

/// Tracker-side entity a set of pull requests is linked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub lifecycle_state: String,
    pub project_id: u64,
    pub owner_ids: Vec<u64>,
    pub review_records: Vec<ReviewRecord>,
    pub linked_pull_requests: Vec<PullRequestRef>,
}

/// Read access to the code host.
#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn get_pull_request(&self, pr: &PullRequestRef) -> Result<PullRequestDetails>;

    /// Every review submitted on the pull request, across all pages.
    async fn list_reviews(&self, pr: &PullRequestRef) -> Result<Vec<ReviewEvent>>;
}

/// Read/write access to the project tracker.
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn get_work_item(&self, id: &str) -> Result<WorkItem>;

    /// Visible review types of the project.
    async fn get_review_types(&self, project_id: u64) -> Result<Vec<ReviewType>>;

    async fn get_project_members(&self, project_id: u64) -> Result<Vec<ProjectMember>>;

    async fn create_review_record(&self, work_item_id: &str, review: &NewReviewRecord)
        -> Result<()>;

    async fn update_review_record(
        &self,
        work_item_id: &str,
        record_id: u64,
        status: TrackerReviewStatus,
    ) -> Result<()>;

    async fn delete_review_record(&self, work_item_id: &str, record_id: u64) -> Result<()>;

    async fn set_lifecycle_state(&self, work_item_id: &str, state: &str) -> Result<()>;
}
