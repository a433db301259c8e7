//! Diffing the target state against the tracker's current review records.
//!
//! Everything here is pure: the resolvers are plain lookups over project
//! metadata fetched beforehand, and the output is a [`ReconcilePlan`] that the
//! engine executes. Keeping the diff free of I/O makes it auditable and
//! directly testable.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::target::{TargetState, TrackerReviewStatus};

/// Default name of the review type used when a repository has no dedicated one.
pub const DEFAULT_REVIEW_TYPE_NAME: &str = "Code";
/// Default prefix of per-repository review type names (`PR:web-services`).
pub const DEFAULT_REVIEW_TYPE_PREFIX: &str = "PR:";

/// Tracker-side row representing one reviewer's status against one review type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: u64,
    pub review_type_id: u64,
    pub reviewer_id: u64,
    pub status: TrackerReviewStatus,
}

impl ReviewRecord {
    pub fn key(&self) -> ReviewKey {
        ReviewKey {
            review_type_id: self.review_type_id,
            reviewer_id: self.reviewer_id,
        }
    }
}

/// The reconciliation key: at most one record exists per pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReviewKey {
    pub review_type_id: u64,
    pub reviewer_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewType {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMember {
    pub id: u64,
    pub username: String,
}

/// A review record to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReviewRecord {
    pub review_type_id: u64,
    pub reviewer_id: u64,
    pub status: TrackerReviewStatus,
}

impl NewReviewRecord {
    pub fn key(&self) -> ReviewKey {
        ReviewKey {
            review_type_id: self.review_type_id,
            reviewer_id: self.reviewer_id,
        }
    }
}

/// A status change on an existing review record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecordUpdate {
    pub record_id: u64,
    pub key: ReviewKey,
    pub status: TrackerReviewStatus,
}

/// A target entry that could not be mapped onto tracker identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnresolvedMapping {
    /// Neither a dedicated nor the default review type exists for the repository.
    ReviewType { repo: String },
    /// The login has no matching project member.
    Reviewer { repo: String, login: String },
}

/// Maps a repository name to the id of the review type its reviews are filed under.
pub trait ReviewTypeResolver {
    fn review_type_for_repo(&self, repo: &str) -> Option<u64>;
}

/// Maps a code-host login to a tracker member id.
pub trait MemberResolver {
    fn member_id(&self, login: &str) -> Option<u64>;

    /// Owners of the work item cannot review it.
    fn is_owner(&self, _member_id: u64) -> bool {
        false
    }
}

/// How repository names translate into review type names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewTypeNaming {
    /// Explicit repository → review type name mappings.
    pub overrides: HashMap<String, String>,
    /// Prefix for repositories without an override.
    pub prefix: String,
    /// Review type used when the repository's own type does not exist.
    pub default_type: String,
}

impl Default for ReviewTypeNaming {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            prefix: DEFAULT_REVIEW_TYPE_PREFIX.to_string(),
            default_type: DEFAULT_REVIEW_TYPE_NAME.to_string(),
        }
    }
}

impl ReviewTypeNaming {
    pub fn type_name_for_repo(&self, repo: &str) -> String {
        self.overrides
            .get(repo)
            .cloned()
            .unwrap_or_else(|| format!("{}{}", self.prefix, repo))
    }
}

/// Tracker project metadata needed to resolve a target state.
#[derive(Debug, Clone)]
pub struct ProjectDirectory {
    review_types: Vec<ReviewType>,
    members: Vec<ProjectMember>,
    owner_ids: HashSet<u64>,
    naming: ReviewTypeNaming,
}

impl ProjectDirectory {
    pub fn new(
        review_types: Vec<ReviewType>,
        members: Vec<ProjectMember>,
        owner_ids: impl IntoIterator<Item = u64>,
        naming: ReviewTypeNaming,
    ) -> Self {
        Self {
            review_types,
            members,
            owner_ids: owner_ids.into_iter().collect(),
            naming,
        }
    }

    fn review_type_by_name(&self, name: &str) -> Option<u64> {
        self.review_types
            .iter()
            .find(|review_type| review_type.name == name)
            .map(|review_type| review_type.id)
    }
}

impl ReviewTypeResolver for ProjectDirectory {
    fn review_type_for_repo(&self, repo: &str) -> Option<u64> {
        self.review_type_by_name(&self.naming.type_name_for_repo(repo))
            .or_else(|| self.review_type_by_name(&self.naming.default_type))
    }
}

impl MemberResolver for ProjectDirectory {
    fn member_id(&self, login: &str) -> Option<u64> {
        self.members
            .iter()
            .find(|member| member.username == login)
            .map(|member| member.id)
    }

    fn is_owner(&self, member_id: u64) -> bool {
        self.owner_ids.contains(&member_id)
    }
}

/// The minimal set of writes that brings the tracker in line with the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePlan {
    pub deletes: Vec<ReviewRecord>,
    pub creates: Vec<NewReviewRecord>,
    pub updates: Vec<ReviewRecordUpdate>,
    /// Lifecycle state to set, independent of the review writes.
    pub transition: Option<String>,
    /// Target entries dropped because they could not be resolved.
    pub unresolved: Vec<UnresolvedMapping>,
}

impl ReconcilePlan {
    /// True when there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of writes in the plan.
    pub fn len(&self) -> usize {
        self.deletes.len()
            + self.creates.len()
            + self.updates.len()
            + usize::from(self.transition.is_some())
    }
}

/// Compute the writes needed to move `existing` to `target`.
///
/// When the target has no repositories at all (no linked pull requests), no
/// review writes are planned and existing records are left untouched.
pub fn plan_reconciliation<R>(
    target: &TargetState,
    existing: &[ReviewRecord],
    resolver: &R,
) -> ReconcilePlan
where
    R: ReviewTypeResolver + MemberResolver,
{
    let mut plan = ReconcilePlan {
        transition: target.terminal_state.clone(),
        ..ReconcilePlan::default()
    };

    if target.reviews_per_repo.is_empty() {
        return plan;
    }

    let desired = resolve_desired(target, resolver, &mut plan.unresolved);

    let mut current: BTreeMap<ReviewKey, &ReviewRecord> = BTreeMap::new();
    for record in existing {
        if current.contains_key(&record.key()) {
            warn!(
                "Duplicate review record {} for review type {} and reviewer {}, deleting it",
                record.id, record.review_type_id, record.reviewer_id
            );
            plan.deletes.push(record.clone());
        } else {
            current.insert(record.key(), record);
        }
    }

    for (key, record) in &current {
        if !desired.contains_key(key) {
            plan.deletes.push((*record).clone());
        }
    }

    for (key, status) in &desired {
        match current.get(key) {
            None => plan.creates.push(NewReviewRecord {
                review_type_id: key.review_type_id,
                reviewer_id: key.reviewer_id,
                status: *status,
            }),
            Some(record) if record.status != *status => plan.updates.push(ReviewRecordUpdate {
                record_id: record.id,
                key: *key,
                status: *status,
            }),
            Some(_) => {}
        }
    }

    plan
}

/// Resolve the target's `(repo, login, status)` triples to tracker keys.
///
/// Repositories are visited in name order, so when two repositories resolve
/// to the same key the one sorting last wins.
fn resolve_desired<R>(
    target: &TargetState,
    resolver: &R,
    unresolved: &mut Vec<UnresolvedMapping>,
) -> BTreeMap<ReviewKey, TrackerReviewStatus>
where
    R: ReviewTypeResolver + MemberResolver,
{
    let mut desired = BTreeMap::new();

    for (repo, reviewers) in &target.reviews_per_repo {
        if reviewers.is_empty() {
            continue;
        }

        let Some(review_type_id) = resolver.review_type_for_repo(repo) else {
            warn!(
                "No review type found for repository '{}', dropping {} reviewer(s)",
                repo,
                reviewers.len()
            );
            unresolved.push(UnresolvedMapping::ReviewType { repo: repo.clone() });
            continue;
        };

        for (login, status) in reviewers {
            let Some(reviewer_id) = resolver.member_id(login) else {
                warn!(
                    "No project member found for reviewer '{}' on '{}', dropping",
                    login, repo
                );
                unresolved.push(UnresolvedMapping::Reviewer {
                    repo: repo.clone(),
                    login: login.clone(),
                });
                continue;
            };

            if resolver.is_owner(reviewer_id) {
                continue;
            }

            desired.insert(
                ReviewKey {
                    review_type_id,
                    reviewer_id,
                },
                *status,
            );
        }
    }

    desired
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use TrackerReviewStatus::*;

    const CODE: u64 = 500;
    const PR_ONE: u64 = 501;
    const PR_SERVICES: u64 = 502;

    fn directory() -> ProjectDirectory {
        let naming = ReviewTypeNaming {
            overrides: HashMap::from([("web-services".to_string(), "PR:services".to_string())]),
            ..ReviewTypeNaming::default()
        };
        ProjectDirectory::new(
            vec![
                ReviewType { id: CODE, name: "Code".to_string() },
                ReviewType { id: PR_ONE, name: "PR:one".to_string() },
                ReviewType { id: PR_SERVICES, name: "PR:services".to_string() },
            ],
            vec![
                ProjectMember { id: 1, username: "u1".to_string() },
                ProjectMember { id: 2, username: "u2".to_string() },
                ProjectMember { id: 3, username: "u3".to_string() },
                ProjectMember { id: 9, username: "owner".to_string() },
            ],
            [9],
            naming,
        )
    }

    fn target(entries: &[(&str, &[(&str, TrackerReviewStatus)])]) -> TargetState {
        TargetState {
            terminal_state: None,
            reviews_per_repo: entries
                .iter()
                .map(|(repo, reviewers)| {
                    (
                        repo.to_string(),
                        reviewers
                            .iter()
                            .map(|(login, status)| (login.to_string(), *status))
                            .collect(),
                    )
                })
                .collect(),
        }
    }

    fn record(id: u64, review_type_id: u64, reviewer_id: u64, status: TrackerReviewStatus) -> ReviewRecord {
        ReviewRecord {
            id,
            review_type_id,
            reviewer_id,
            status,
        }
    }

    /// Apply a plan the way the tracker would, assigning fresh ids to creates.
    fn apply(plan: &ReconcilePlan, existing: &[ReviewRecord]) -> Vec<ReviewRecord> {
        let deleted: HashSet<u64> = plan.deletes.iter().map(|r| r.id).collect();
        let mut next_id = existing.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let mut records: Vec<ReviewRecord> = existing
            .iter()
            .filter(|r| !deleted.contains(&r.id))
            .cloned()
            .map(|mut r| {
                if let Some(update) = plan.updates.iter().find(|u| u.record_id == r.id) {
                    r.status = update.status;
                }
                r
            })
            .collect();
        for create in &plan.creates {
            records.push(record(next_id, create.review_type_id, create.reviewer_id, create.status));
            next_id += 1;
        }
        records
    }

    #[test]
    fn test_review_type_resolution() {
        let dir = directory();
        assert_eq!(dir.review_type_for_repo("one"), Some(PR_ONE));
        assert_eq!(dir.review_type_for_repo("web-services"), Some(PR_SERVICES));
        assert_eq!(dir.review_type_for_repo("unknown-repo"), Some(CODE));
    }

    #[test]
    fn test_no_default_review_type_is_unresolved() {
        let dir = ProjectDirectory::new(
            vec![],
            vec![ProjectMember { id: 1, username: "u1".to_string() }],
            [],
            ReviewTypeNaming::default(),
        );
        let plan = plan_reconciliation(&target(&[("one", &[("u1", Pass)])]), &[], &dir);

        assert!(plan.creates.is_empty());
        assert_eq!(
            plan.unresolved,
            vec![UnresolvedMapping::ReviewType { repo: "one".to_string() }]
        );
    }

    #[test]
    fn test_creates_for_new_reviewers() {
        let plan = plan_reconciliation(
            &target(&[("one", &[("u1", Pass), ("u2", InReview)])]),
            &[],
            &directory(),
        );

        assert_eq!(
            plan.creates,
            vec![
                NewReviewRecord { review_type_id: PR_ONE, reviewer_id: 1, status: Pass },
                NewReviewRecord { review_type_id: PR_ONE, reviewer_id: 2, status: InReview },
            ]
        );
        assert!(plan.updates.is_empty());
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn test_updates_changed_status_and_leaves_matching_alone() {
        let existing = vec![record(10, PR_ONE, 1, InReview), record(11, PR_ONE, 2, Pass)];
        let plan = plan_reconciliation(
            &target(&[("one", &[("u1", Pass), ("u2", Pass)])]),
            &existing,
            &directory(),
        );

        assert_eq!(
            plan.updates,
            vec![ReviewRecordUpdate {
                record_id: 10,
                key: ReviewKey { review_type_id: PR_ONE, reviewer_id: 1 },
                status: Pass,
            }]
        );
        assert!(plan.creates.is_empty());
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn test_deletes_records_absent_from_target() {
        let existing = vec![record(10, PR_ONE, 1, Pass), record(11, CODE, 3, Revise)];
        let plan = plan_reconciliation(&target(&[("one", &[("u1", Pass)])]), &existing, &directory());

        assert_eq!(plan.deletes, vec![record(11, CODE, 3, Revise)]);
        assert!(plan.creates.is_empty());
        assert!(plan.updates.is_empty());
    }

    #[test]
    fn test_unknown_reviewer_is_dropped_not_written() {
        let plan = plan_reconciliation(
            &target(&[("one", &[("ghost", Pass), ("u1", Pass)])]),
            &[],
            &directory(),
        );

        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.creates[0].reviewer_id, 1);
        assert_eq!(
            plan.unresolved,
            vec![UnresolvedMapping::Reviewer {
                repo: "one".to_string(),
                login: "ghost".to_string(),
            }]
        );
    }

    #[test]
    fn test_owner_is_never_a_reviewer() {
        let existing = vec![record(10, PR_ONE, 9, InReview)];
        let plan = plan_reconciliation(&target(&[("one", &[("owner", Pass)])]), &existing, &directory());

        assert!(plan.creates.is_empty());
        assert!(plan.updates.is_empty());
        assert_eq!(plan.deletes, existing);
    }

    #[test]
    fn test_empty_target_leaves_records_alone() {
        let existing = vec![record(10, PR_ONE, 1, Pass)];
        let plan = plan_reconciliation(&TargetState::default(), &existing, &directory());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_wip_only_repository_clears_its_records() {
        let existing = vec![record(10, PR_ONE, 1, Pass)];
        let plan = plan_reconciliation(&target(&[("one", &[])]), &existing, &directory());
        assert_eq!(plan.deletes, existing);
    }

    #[test]
    fn test_duplicate_existing_records_are_collapsed() {
        let existing = vec![record(10, PR_ONE, 1, Pass), record(11, PR_ONE, 1, Revise)];
        let plan = plan_reconciliation(&target(&[("one", &[("u1", Pass)])]), &existing, &directory());

        assert_eq!(plan.deletes, vec![record(11, PR_ONE, 1, Revise)]);
        assert!(plan.updates.is_empty());
        assert!(plan.creates.is_empty());
    }

    #[test]
    fn test_repositories_sharing_default_type_last_wins() {
        // Both fall back to "Code".
        let plan = plan_reconciliation(
            &target(&[("alpha", &[("u1", Revise)]), ("beta", &[("u1", Pass)])]),
            &[],
            &directory(),
        );

        assert_eq!(
            plan.creates,
            vec![NewReviewRecord { review_type_id: CODE, reviewer_id: 1, status: Pass }]
        );
    }

    #[test]
    fn test_transition_is_carried_independently() {
        let mut t = target(&[]);
        t.terminal_state = Some("delivered".to_string());
        let plan = plan_reconciliation(&t, &[], &directory());

        assert_eq!(plan.transition.as_deref(), Some("delivered"));
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_second_pass_is_empty() {
        let existing = vec![
            record(10, PR_ONE, 1, InReview),
            record(11, CODE, 3, Revise),
            record(12, PR_SERVICES, 2, Pass),
        ];
        let t = target(&[
            ("one", &[("u1", Pass), ("u2", Unstarted)]),
            ("web-services", &[("u2", Pass), ("u3", InReview)]),
        ]);
        let dir = directory();

        let first = plan_reconciliation(&t, &existing, &dir);
        assert!(!first.is_empty());

        let after = apply(&first, &existing);
        let second = plan_reconciliation(&t, &after, &dir);
        assert!(second.is_empty(), "second pass should be a no-op: {:?}", second);
    }

    // =========================================================================
    // Property-based tests
    // =========================================================================

    fn arb_status() -> impl Strategy<Value = TrackerReviewStatus> {
        prop_oneof![Just(Unstarted), Just(InReview), Just(Pass), Just(Revise)]
    }

    fn arb_target() -> impl Strategy<Value = TargetState> {
        let repo = prop_oneof![
            Just("one".to_string()),
            Just("web-services".to_string()),
            Just("other".to_string()),
            Just("misc".to_string()),
        ];
        let login = prop_oneof![
            Just("u1".to_string()),
            Just("u2".to_string()),
            Just("u3".to_string()),
            Just("owner".to_string()),
            Just("ghost".to_string()),
        ];
        prop::collection::btree_map(
            repo,
            prop::collection::btree_map(login, arb_status(), 0..5),
            0..4,
        )
        .prop_map(|reviews_per_repo| TargetState {
            terminal_state: None,
            reviews_per_repo,
        })
    }

    fn arb_existing() -> impl Strategy<Value = Vec<ReviewRecord>> {
        prop::collection::vec(
            (
                prop_oneof![Just(CODE), Just(PR_ONE), Just(PR_SERVICES)],
                prop_oneof![Just(1u64), Just(2u64), Just(3u64), Just(9u64)],
                arb_status(),
            ),
            0..8,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, (t, r, s))| record(100 + i as u64, t, r, s))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_reconcile_is_idempotent(t in arb_target(), existing in arb_existing()) {
            let dir = directory();
            let first = plan_reconciliation(&t, &existing, &dir);
            let after = apply(&first, &existing);
            let second = plan_reconciliation(&t, &after, &dir);
            prop_assert!(second.is_empty(), "second pass not empty: {:?}", second);
        }

        #[test]
        fn prop_no_pair_is_both_created_and_updated(t in arb_target(), existing in arb_existing()) {
            let plan = plan_reconciliation(&t, &existing, &directory());
            let created: HashSet<ReviewKey> = plan.creates.iter().map(NewReviewRecord::key).collect();
            prop_assert_eq!(created.len(), plan.creates.len());
            for update in &plan.updates {
                prop_assert!(!created.contains(&update.key));
            }
        }

        #[test]
        fn prop_owner_is_never_written(t in arb_target(), existing in arb_existing()) {
            let plan = plan_reconciliation(&t, &existing, &directory());
            prop_assert!(plan.creates.iter().all(|c| c.reviewer_id != 9));
            prop_assert!(plan.updates.iter().all(|u| u.key.reviewer_id != 9));
        }
    }
}
