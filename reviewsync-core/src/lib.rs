pub mod engine;
pub mod lease;
pub mod link;
pub mod policy;
pub mod pull;
pub mod reconcile;
pub mod remote;
pub mod review;
pub mod target;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use engine::{EngineSettings, PlannedSync, SyncEngine, SyncOutcome, SyncReport};
pub use lease::{
    CoordinationGate, GateConfig, GateOutcome, InMemoryLeaseStore, Lease, LeaseStore,
    LeaseStoreError,
};
pub use link::{extract_work_item_link, WorkItemLink};
pub use pull::{PullRequestDetails, PullRequestRef, PullRequestSnapshot};
pub use reconcile::{
    plan_reconciliation, NewReviewRecord, ProjectDirectory, ProjectMember, ReconcilePlan,
    ReviewRecord, ReviewType, ReviewTypeNaming,
};
pub use remote::{CodeHost, Tracker, WorkItem};
pub use review::{aggregate_reviews, CanonicalStatus, ReviewEvent, ReviewEventState};
pub use target::{build_target_state, TargetState, TrackerReviewStatus};
