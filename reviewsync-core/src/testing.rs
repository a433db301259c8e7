//! In-memory [`CodeHost`] and [`Tracker`] for tests.
//!
//! The tracker fake applies writes to its stored work items, so running the
//! engine twice against it behaves like running it twice against the real
//! service.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::pull::{PullRequestDetails, PullRequestRef};
use crate::reconcile::{NewReviewRecord, ProjectMember, ReviewRecord, ReviewType};
use crate::remote::{CodeHost, Tracker, WorkItem};
use crate::review::ReviewEvent;
use crate::target::TrackerReviewStatus;

#[derive(Debug, Default)]
pub struct FakeCodeHost {
    pulls: Mutex<HashMap<PullRequestRef, (PullRequestDetails, Vec<ReviewEvent>)>>,
    fetches: Mutex<Vec<PullRequestRef>>,
}

impl FakeCodeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pr: PullRequestRef, details: PullRequestDetails, reviews: Vec<ReviewEvent>) {
        lock(&self.pulls).insert(pr, (details, reviews));
    }

    /// Pull requests whose details were fetched, in order.
    pub fn fetched(&self) -> Vec<PullRequestRef> {
        lock(&self.fetches).clone()
    }
}

#[async_trait]
impl CodeHost for FakeCodeHost {
    async fn get_pull_request(&self, pr: &PullRequestRef) -> Result<PullRequestDetails> {
        lock(&self.fetches).push(pr.clone());
        lock(&self.pulls)
            .get(pr)
            .map(|(details, _)| details.clone())
            .ok_or_else(|| anyhow!("pull request {} not found", pr))
    }

    async fn list_reviews(&self, pr: &PullRequestRef) -> Result<Vec<ReviewEvent>> {
        lock(&self.pulls)
            .get(pr)
            .map(|(_, reviews)| reviews.clone())
            .ok_or_else(|| anyhow!("pull request {} not found", pr))
    }
}

/// A write the tracker fake received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerWrite {
    Create {
        work_item_id: String,
        review: NewReviewRecord,
    },
    Update {
        work_item_id: String,
        record_id: u64,
        status: TrackerReviewStatus,
    },
    Delete {
        work_item_id: String,
        record_id: u64,
    },
    SetState {
        work_item_id: String,
        state: String,
    },
}

#[derive(Debug, Default)]
struct TrackerState {
    work_items: HashMap<String, WorkItem>,
    review_types: HashMap<u64, Vec<ReviewType>>,
    members: HashMap<u64, Vec<ProjectMember>>,
    writes: Vec<TrackerWrite>,
    metadata_fetches: usize,
    next_record_id: u64,
    fail_review_writes: bool,
    fail_state_writes: bool,
}

#[derive(Debug)]
pub struct FakeTracker {
    state: Mutex<TrackerState>,
}

impl Default for FakeTracker {
    fn default() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                next_record_id: 1000,
                ..TrackerState::default()
            }),
        }
    }
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_work_item(&self, work_item: WorkItem) {
        lock(&self.state)
            .work_items
            .insert(work_item.id.clone(), work_item);
    }

    pub fn set_project(&self, project_id: u64, review_types: Vec<ReviewType>, members: Vec<ProjectMember>) {
        let mut state = lock(&self.state);
        state.review_types.insert(project_id, review_types);
        state.members.insert(project_id, members);
    }

    /// Make every review create/update/delete fail.
    pub fn fail_review_writes(&self, fail: bool) {
        lock(&self.state).fail_review_writes = fail;
    }

    /// Make every lifecycle state write fail.
    pub fn fail_state_writes(&self, fail: bool) {
        lock(&self.state).fail_state_writes = fail;
    }

    pub fn work_item(&self, id: &str) -> Option<WorkItem> {
        lock(&self.state).work_items.get(id).cloned()
    }

    pub fn writes(&self) -> Vec<TrackerWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }

    /// How many times review types or members were requested.
    pub fn metadata_fetches(&self) -> usize {
        lock(&self.state).metadata_fetches
    }
}

#[async_trait]
impl Tracker for FakeTracker {
    async fn get_work_item(&self, id: &str) -> Result<WorkItem> {
        self.work_item(id)
            .ok_or_else(|| anyhow!("work item {} not found", id))
    }

    async fn get_review_types(&self, project_id: u64) -> Result<Vec<ReviewType>> {
        let mut state = lock(&self.state);
        state.metadata_fetches += 1;
        Ok(state.review_types.get(&project_id).cloned().unwrap_or_default())
    }

    async fn get_project_members(&self, project_id: u64) -> Result<Vec<ProjectMember>> {
        let mut state = lock(&self.state);
        state.metadata_fetches += 1;
        Ok(state.members.get(&project_id).cloned().unwrap_or_default())
    }

    async fn create_review_record(&self, work_item_id: &str, review: &NewReviewRecord) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_review_writes {
            return Err(anyhow!("review write rejected"));
        }
        let id = state.next_record_id;
        state.next_record_id += 1;
        let item = state
            .work_items
            .get_mut(work_item_id)
            .ok_or_else(|| anyhow!("work item {} not found", work_item_id))?;
        item.review_records.push(ReviewRecord {
            id,
            review_type_id: review.review_type_id,
            reviewer_id: review.reviewer_id,
            status: review.status,
        });
        state.writes.push(TrackerWrite::Create {
            work_item_id: work_item_id.to_string(),
            review: review.clone(),
        });
        Ok(())
    }

    async fn update_review_record(
        &self,
        work_item_id: &str,
        record_id: u64,
        status: TrackerReviewStatus,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_review_writes {
            return Err(anyhow!("review write rejected"));
        }
        let record = state
            .work_items
            .get_mut(work_item_id)
            .and_then(|item| item.review_records.iter_mut().find(|r| r.id == record_id))
            .ok_or_else(|| anyhow!("review record {} not found", record_id))?;
        record.status = status;
        state.writes.push(TrackerWrite::Update {
            work_item_id: work_item_id.to_string(),
            record_id,
            status,
        });
        Ok(())
    }

    async fn delete_review_record(&self, work_item_id: &str, record_id: u64) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_review_writes {
            return Err(anyhow!("review write rejected"));
        }
        let item = state
            .work_items
            .get_mut(work_item_id)
            .ok_or_else(|| anyhow!("work item {} not found", work_item_id))?;
        item.review_records.retain(|r| r.id != record_id);
        state.writes.push(TrackerWrite::Delete {
            work_item_id: work_item_id.to_string(),
            record_id,
        });
        Ok(())
    }

    async fn set_lifecycle_state(&self, work_item_id: &str, new_state: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_state_writes {
            return Err(anyhow!("state write rejected"));
        }
        let item = state
            .work_items
            .get_mut(work_item_id)
            .ok_or_else(|| anyhow!("work item {} not found", work_item_id))?;
        item.lifecycle_state = new_state.to_string();
        state.writes.push(TrackerWrite::SetState {
            work_item_id: work_item_id.to_string(),
            state: new_state.to_string(),
        });
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
