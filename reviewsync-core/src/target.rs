//! Folding every linked pull request into one desired state for a work item.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pull::PullRequestSnapshot;
use crate::review::CanonicalStatus;

/// Lifecycle state a work item sits in once its work is done but not shipped.
pub const STATE_FINISHED: &str = "finished";
/// Lifecycle state a work item moves to once every linked pull request is merged.
pub const STATE_DELIVERED: &str = "delivered";

/// Review status in the tracker's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerReviewStatus {
    Unstarted,
    InReview,
    Pass,
    Revise,
}

impl TrackerReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerReviewStatus::Unstarted => "unstarted",
            TrackerReviewStatus::InReview => "in_review",
            TrackerReviewStatus::Pass => "pass",
            TrackerReviewStatus::Revise => "revise",
        }
    }
}

impl fmt::Display for TrackerReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CanonicalStatus> for TrackerReviewStatus {
    fn from(status: CanonicalStatus) -> Self {
        match status {
            CanonicalStatus::Approved => TrackerReviewStatus::Pass,
            CanonicalStatus::Commented => TrackerReviewStatus::InReview,
            CanonicalStatus::ChangesRequested => TrackerReviewStatus::Revise,
            CanonicalStatus::New => TrackerReviewStatus::Unstarted,
        }
    }
}

/// Repository name → reviewer login → desired status.
pub type TargetReviewState = BTreeMap<String, BTreeMap<String, TrackerReviewStatus>>;

/// Desired state of a work item, computed once per reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    /// Lifecycle state to move the work item to, if any. `None` means "leave
    /// the current state alone", never "clear it".
    pub terminal_state: Option<String>,
    pub reviews_per_repo: TargetReviewState,
}

/// Build the target state from the work item's lifecycle state and every
/// pull request linked to it.
///
/// Snapshots of the same repository are folded merged-first (stable), with
/// later snapshots overwriting earlier ones per reviewer. Work-in-progress
/// snapshots contribute nothing, but their repository still gets an entry.
pub fn build_target_state(
    current_state: &str,
    snapshots: &[PullRequestSnapshot],
) -> TargetState {
    let terminal_state = (all_merged(snapshots) && current_state == STATE_FINISHED)
        .then(|| STATE_DELIVERED.to_string());

    let mut per_repo: BTreeMap<&str, Vec<&PullRequestSnapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        per_repo
            .entry(snapshot.repo_name.as_str())
            .or_default()
            .push(snapshot);
    }

    let reviews_per_repo = per_repo
        .into_iter()
        .map(|(repo, mut repo_snapshots)| {
            // `sort_by_key` is stable; `false < true`, hence the negation.
            repo_snapshots.sort_by_key(|snapshot| !snapshot.merged);

            let mut reviewers = BTreeMap::new();
            for snapshot in repo_snapshots.into_iter().filter(|s| !s.wip) {
                for (login, status) in &snapshot.reviews_by_user {
                    reviewers.insert(login.clone(), TrackerReviewStatus::from(*status));
                }
            }
            (repo.to_string(), reviewers)
        })
        .collect();

    TargetState {
        terminal_state,
        reviews_per_repo,
    }
}

fn all_merged(snapshots: &[PullRequestSnapshot]) -> bool {
    !snapshots.is_empty() && snapshots.iter().all(|snapshot| snapshot.merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use CanonicalStatus::*;

    fn pull(repo: &str, merged: bool, reviews: &[(&str, CanonicalStatus)]) -> PullRequestSnapshot {
        PullRequestSnapshot {
            repo_name: repo.to_string(),
            author: "author".to_string(),
            merged,
            wip: false,
            reviews_by_user: reviews
                .iter()
                .map(|(login, status)| (login.to_string(), *status))
                .collect(),
        }
    }

    fn statuses(
        entries: &[(&str, TrackerReviewStatus)],
    ) -> BTreeMap<String, TrackerReviewStatus> {
        entries
            .iter()
            .map(|(login, status)| (login.to_string(), *status))
            .collect()
    }

    #[test]
    fn test_no_pulls() {
        let result = build_target_state(STATE_FINISHED, &[]);
        assert_eq!(result, TargetState::default());
    }

    #[test]
    fn test_single_pull_translation() {
        let result = build_target_state(
            "started",
            &[pull("one", false, &[("u1", Approved), ("u2", Commented), ("u3", New)])],
        );

        assert_eq!(
            result.reviews_per_repo["one"],
            statuses(&[
                ("u1", TrackerReviewStatus::Pass),
                ("u2", TrackerReviewStatus::InReview),
                ("u3", TrackerReviewStatus::Unstarted),
            ])
        );
        assert_eq!(result.terminal_state, None);
    }

    #[test]
    fn test_unique_repositories() {
        let result = build_target_state(
            "started",
            &[
                pull("one", false, &[("u1", Approved), ("u2", Commented)]),
                pull(
                    "two",
                    true,
                    &[("u2", ChangesRequested), ("u3", Commented), ("u1", New)],
                ),
            ],
        );

        assert_eq!(result.reviews_per_repo.len(), 2);
        assert_eq!(
            result.reviews_per_repo["two"],
            statuses(&[
                ("u1", TrackerReviewStatus::Unstarted),
                ("u2", TrackerReviewStatus::Revise),
                ("u3", TrackerReviewStatus::InReview),
            ])
        );
    }

    #[test]
    fn test_same_repository_later_pull_overwrites() {
        let result = build_target_state(
            "started",
            &[
                pull("one", false, &[("u1", Approved), ("u2", Commented), ("u3", New)]),
                pull("one", false, &[("u1", New), ("u2", Approved)]),
            ],
        );

        assert_eq!(
            result.reviews_per_repo["one"],
            statuses(&[
                ("u1", TrackerReviewStatus::Unstarted),
                ("u2", TrackerReviewStatus::Pass),
                ("u3", TrackerReviewStatus::Unstarted),
            ])
        );
    }

    #[test]
    fn test_merged_pull_is_folded_first_when_listed_last() {
        let result = build_target_state(
            "started",
            &[
                pull("one", false, &[("u1", Approved), ("u2", Commented), ("u3", New)]),
                pull("one", true, &[("u1", New), ("u2", Approved)]),
            ],
        );

        assert_eq!(
            result.reviews_per_repo["one"],
            statuses(&[
                ("u1", TrackerReviewStatus::Pass),
                ("u2", TrackerReviewStatus::InReview),
                ("u3", TrackerReviewStatus::Unstarted),
            ])
        );
    }

    #[test]
    fn test_merged_pull_is_folded_first_when_listed_first() {
        let result = build_target_state(
            "started",
            &[
                pull("one", true, &[("u1", Approved), ("u2", Commented), ("u3", New)]),
                pull("one", false, &[("u1", New), ("u2", Approved)]),
            ],
        );

        assert_eq!(
            result.reviews_per_repo["one"],
            statuses(&[
                ("u1", TrackerReviewStatus::Unstarted),
                ("u2", TrackerReviewStatus::Pass),
                ("u3", TrackerReviewStatus::Unstarted),
            ])
        );
    }

    #[test]
    fn test_wip_pull_contributes_nothing() {
        let mut wip = pull("two", false, &[("u", New)]);
        wip.wip = true;

        let result = build_target_state("started", &[pull("one", false, &[("u", New)]), wip]);

        assert_eq!(
            result.reviews_per_repo["one"],
            statuses(&[("u", TrackerReviewStatus::Unstarted)])
        );
        assert!(result.reviews_per_repo["two"].is_empty());
    }

    #[test]
    fn test_wip_pull_is_skipped_among_same_repository() {
        let mut wip = pull("one", false, &[("u1", ChangesRequested), ("u2", Commented)]);
        wip.wip = true;

        let result = build_target_state("started", &[pull("one", true, &[("u1", Approved)]), wip]);

        assert_eq!(
            result.reviews_per_repo["one"],
            statuses(&[("u1", TrackerReviewStatus::Pass)])
        );
    }

    #[test]
    fn test_terminal_state_null_when_one_pull_unmerged() {
        let result = build_target_state(
            STATE_FINISHED,
            &[pull("a", false, &[]), pull("b", true, &[]), pull("c", false, &[])],
        );
        assert_eq!(result.terminal_state, None);
    }

    #[test]
    fn test_terminal_state_null_when_not_finished() {
        let result = build_target_state("unstarted", &[pull("a", true, &[])]);
        assert_eq!(result.terminal_state, None);
    }

    #[test]
    fn test_terminal_state_delivered_when_all_merged_and_finished() {
        let result = build_target_state(
            STATE_FINISHED,
            &[pull("a", true, &[]), pull("b", true, &[]), pull("c", true, &[])],
        );
        assert_eq!(result.terminal_state.as_deref(), Some(STATE_DELIVERED));
    }

    #[test]
    fn test_status_serializes_in_tracker_vocabulary() {
        let json = serde_json::to_string(&TrackerReviewStatus::InReview).unwrap();
        assert_eq!(json, "\"in_review\"");
        let parsed: TrackerReviewStatus = serde_json::from_str("\"revise\"").unwrap();
        assert_eq!(parsed, TrackerReviewStatus::Revise);
    }

    #[test]
    fn test_status_records_sort_by_pair_then_status() {
        let mut records = vec![
            (11, 2, TrackerReviewStatus::Revise),
            (10, 3, TrackerReviewStatus::Pass),
            (10, 3, TrackerReviewStatus::Unstarted),
        ];
        records.sort();
        assert_eq!(
            records,
            vec![
                (10, 3, TrackerReviewStatus::Unstarted),
                (10, 3, TrackerReviewStatus::Pass),
                (11, 2, TrackerReviewStatus::Revise),
            ]
        );
    }
}
