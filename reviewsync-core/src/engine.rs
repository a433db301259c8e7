//! One reconciliation run, end to end.
//!
//! gate → fetch work item and pull requests → aggregate → build target →
//! plan → execute → release. Everything fetched is discarded after the run.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::{join_all, try_join_all};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::lease::{CoordinationGate, GateOutcome};
use crate::link::extract_work_item_link;
use crate::pull::{PullRequestRef, PullRequestSnapshot, DEFAULT_WIP_LABEL};
use crate::reconcile::{plan_reconciliation, ProjectDirectory, ReconcilePlan, ReviewTypeNaming};
use crate::remote::{CodeHost, Tracker, WorkItem};
use crate::target::build_target_state;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub naming: ReviewTypeNaming,
    pub wip_label: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            naming: ReviewTypeNaming::default(),
            wip_label: DEFAULT_WIP_LABEL.to_string(),
        }
    }
}

/// What a completed run wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub deleted: usize,
    pub created: usize,
    pub updated: usize,
    pub transitioned_to: Option<String>,
    /// Set when the lifecycle write failed; the review writes still count.
    pub transition_error: Option<String>,
    pub unresolved: usize,
}

/// How a trigger ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied(SyncReport),
    /// The text carried no work item link.
    NoLink,
    /// A more recent trigger for the same work item took over.
    Superseded,
    /// Another run holds the work item's lease.
    Contended,
}

/// A computed plan together with the state it was computed from.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedSync {
    pub work_item: WorkItem,
    pub snapshots: Vec<PullRequestSnapshot>,
    pub plan: ReconcilePlan,
}

pub struct SyncEngine {
    code_host: Arc<dyn CodeHost>,
    tracker: Arc<dyn Tracker>,
    gate: CoordinationGate,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(
        code_host: Arc<dyn CodeHost>,
        tracker: Arc<dyn Tracker>,
        gate: CoordinationGate,
        settings: EngineSettings,
    ) -> Self {
        Self {
            code_host,
            tracker,
            gate,
            settings,
        }
    }

    /// Sync the work item linked from `text` (typically a pull request
    /// description). Text without a link is a no-op.
    pub async fn sync_linked(
        &self,
        text: &str,
        initiator: Option<&PullRequestRef>,
    ) -> Result<SyncOutcome> {
        match extract_work_item_link(text) {
            Some(link) => self.sync(&link.id, initiator).await,
            None => Ok(SyncOutcome::NoLink),
        }
    }

    /// Reconcile one work item under its lease.
    ///
    /// `initiator` is the pull request whose event triggered the run; it is
    /// included even if the tracker does not list it as linked yet.
    pub async fn sync(
        &self,
        work_item_id: &str,
        initiator: Option<&PullRequestRef>,
    ) -> Result<SyncOutcome> {
        let outcome = self
            .gate
            .run(work_item_id, || async {
                let planned = self.plan(work_item_id, initiator).await?;
                self.execute(work_item_id, &planned.plan).await
            })
            .await?;

        Ok(match outcome {
            GateOutcome::Completed(report) => SyncOutcome::Applied(report),
            GateOutcome::Superseded { .. } => SyncOutcome::Superseded,
            GateOutcome::Contended { .. } => SyncOutcome::Contended,
        })
    }

    /// Fetch everything and compute the plan without writing anything.
    pub async fn plan(
        &self,
        work_item_id: &str,
        initiator: Option<&PullRequestRef>,
    ) -> Result<PlannedSync> {
        let work_item = self
            .tracker
            .get_work_item(work_item_id)
            .await
            .with_context(|| format!("Failed to fetch work item {}", work_item_id))?;

        let pull_refs = pull_requests_to_fetch(&work_item, initiator);
        info!(
            "Work item {} ({}) has {} pull request(s) to inspect",
            work_item_id,
            work_item.lifecycle_state,
            pull_refs.len()
        );

        let snapshots =
            try_join_all(pull_refs.iter().map(|pr| self.fetch_snapshot(pr))).await?;

        let target = build_target_state(&work_item.lifecycle_state, &snapshots);

        let plan = if target.reviews_per_repo.is_empty() {
            plan_reconciliation(&target, &work_item.review_records, &self.empty_directory())
        } else {
            let directory = self.fetch_directory(&work_item).await?;
            plan_reconciliation(&target, &work_item.review_records, &directory)
        };

        if !plan.unresolved.is_empty() {
            warn!(
                "{} target entr(ies) for work item {} could not be resolved and were dropped",
                plan.unresolved.len(),
                work_item_id
            );
        }

        Ok(PlannedSync {
            work_item,
            snapshots,
            plan,
        })
    }

    /// Issue the plan's writes.
    ///
    /// Review writes run concurrently; the first failure is returned after
    /// all of them have finished. A failed lifecycle write is logged and
    /// reported but does not fail the run.
    pub async fn execute(&self, work_item_id: &str, plan: &ReconcilePlan) -> Result<SyncReport> {
        let tracker = &self.tracker;

        let deletes = plan.deletes.iter().map(|record| async move {
            tracker
                .delete_review_record(work_item_id, record.id)
                .await
                .with_context(|| format!("Failed to delete review record {}", record.id))
        });
        let creates = plan.creates.iter().map(|review| async move {
            tracker
                .create_review_record(work_item_id, review)
                .await
                .with_context(|| {
                    format!(
                        "Failed to create review for reviewer {} (type {})",
                        review.reviewer_id, review.review_type_id
                    )
                })
        });
        let updates = plan.updates.iter().map(|update| async move {
            tracker
                .update_review_record(work_item_id, update.record_id, update.status)
                .await
                .with_context(|| format!("Failed to update review record {}", update.record_id))
        });

        let review_writes = async {
            let (deleted, created, updated) =
                tokio::join!(join_all(deletes), join_all(creates), join_all(updates));
            deleted
                .into_iter()
                .chain(created)
                .chain(updated)
                .collect::<Result<Vec<()>>>()
        };

        let transition = async {
            match &plan.transition {
                Some(state) => Some(
                    tracker
                        .set_lifecycle_state(work_item_id, state)
                        .await
                        .map(|()| state.clone()),
                ),
                None => None,
            }
        };

        let (review_result, transition_result) = tokio::join!(review_writes, transition);

        let mut report = SyncReport {
            deleted: plan.deletes.len(),
            created: plan.creates.len(),
            updated: plan.updates.len(),
            unresolved: plan.unresolved.len(),
            ..SyncReport::default()
        };

        match transition_result {
            Some(Ok(state)) => {
                info!("Moved work item {} to {}", work_item_id, state);
                report.transitioned_to = Some(state);
            }
            Some(Err(e)) => {
                error!(
                    "Failed to set lifecycle state of work item {}: {:#}",
                    work_item_id, e
                );
                report.transition_error = Some(format!("{:#}", e));
            }
            None => {}
        }

        review_result?;

        info!(
            "Synced work item {}: {} deleted, {} created, {} updated",
            work_item_id, report.deleted, report.created, report.updated
        );
        Ok(report)
    }

    async fn fetch_snapshot(&self, pr: &PullRequestRef) -> Result<PullRequestSnapshot> {
        let (details, reviews) = tokio::try_join!(
            self.code_host.get_pull_request(pr),
            self.code_host.list_reviews(pr)
        )
        .with_context(|| format!("Failed to fetch pull request {}", pr))?;

        Ok(PullRequestSnapshot::build(
            &details,
            &reviews,
            &self.settings.wip_label,
        ))
    }

    async fn fetch_directory(&self, work_item: &WorkItem) -> Result<ProjectDirectory> {
        let (review_types, members) = tokio::try_join!(
            self.tracker.get_review_types(work_item.project_id),
            self.tracker.get_project_members(work_item.project_id)
        )
        .with_context(|| format!("Failed to fetch metadata of project {}", work_item.project_id))?;

        Ok(ProjectDirectory::new(
            review_types,
            members,
            work_item.owner_ids.iter().copied(),
            self.settings.naming.clone(),
        ))
    }

    fn empty_directory(&self) -> ProjectDirectory {
        ProjectDirectory::new(Vec::new(), Vec::new(), [], self.settings.naming.clone())
    }
}

/// Linked pull requests plus the initiator, without duplicates, in order.
fn pull_requests_to_fetch(
    work_item: &WorkItem,
    initiator: Option<&PullRequestRef>,
) -> Vec<PullRequestRef> {
    let mut refs: Vec<PullRequestRef> = Vec::new();
    for pr in work_item.linked_pull_requests.iter().chain(initiator) {
        if !refs.contains(pr) {
            refs.push(pr.clone());
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work_item(linked: Vec<PullRequestRef>) -> WorkItem {
        WorkItem {
            id: "1".to_string(),
            lifecycle_state: "started".to_string(),
            project_id: 7,
            owner_ids: vec![],
            review_records: vec![],
            linked_pull_requests: linked,
        }
    }

    #[test]
    fn test_initiator_is_appended_once() {
        let a = PullRequestRef::new("acme", "one", 1);
        let b = PullRequestRef::new("acme", "two", 2);
        let item = work_item(vec![a.clone(), b.clone()]);

        assert_eq!(pull_requests_to_fetch(&item, Some(&a)), vec![a.clone(), b.clone()]);

        let c = PullRequestRef::new("acme", "one", 3);
        assert_eq!(pull_requests_to_fetch(&item, Some(&c)), vec![a, b, c]);
    }

    #[test]
    fn test_no_initiator() {
        let item = work_item(vec![]);
        assert!(pull_requests_to_fetch(&item, None).is_empty());
    }
}
