//! Declarative guards deciding whether a trigger should start a sync.
//!
//! Each policy is a pure predicate over an immutable [`TriggerContext`].
//! Policies are evaluated in order and the first failing one short-circuits.

use crate::link::extract_work_item_link;

/// Event/action pairs that can change a work item's review state.
pub const SUPPORTED_TRIGGERS: &[(&str, &str)] = &[
    ("pull_request", "opened"),
    ("pull_request", "edited"),
    ("pull_request", "labeled"),
    ("pull_request", "unlabeled"),
    ("pull_request", "review_requested"),
    ("pull_request", "review_request_removed"),
    ("pull_request", "synchronize"),
    ("pull_request", "closed"),
    ("pull_request", "reopened"),
    ("pull_request", "ready_for_review"),
    ("pull_request", "converted_to_draft"),
    ("pull_request_review", "submitted"),
    ("pull_request_review", "dismissed"),
    ("pull_request_review", "edited"),
];

/// What a policy gets to look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerContext {
    pub event: String,
    pub action: String,
    pub pull_request_body: Option<String>,
    pub has_pull_request: bool,
    pub has_repository: bool,
}

#[derive(Clone, Copy)]
pub struct Policy {
    pub name: &'static str,
    pub check: fn(&TriggerContext) -> bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { policy: &'static str },
}

/// Policies applied to every incoming webhook, in order.
pub const DEFAULT_POLICIES: &[Policy] = &[
    Policy {
        name: "supported_trigger",
        check: is_supported_trigger,
    },
    Policy {
        name: "has_pull_request",
        check: has_pull_request,
    },
    Policy {
        name: "has_work_item_link",
        check: has_work_item_link,
    },
];

pub fn evaluate(policies: &[Policy], ctx: &TriggerContext) -> PolicyDecision {
    policies
        .iter()
        .find(|policy| !(policy.check)(ctx))
        .map_or(PolicyDecision::Allow, |policy| PolicyDecision::Deny {
            policy: policy.name,
        })
}

pub fn is_supported_trigger(ctx: &TriggerContext) -> bool {
    SUPPORTED_TRIGGERS
        .iter()
        .any(|(event, action)| *event == ctx.event && *action == ctx.action)
}

pub fn has_pull_request(ctx: &TriggerContext) -> bool {
    ctx.has_pull_request && ctx.has_repository
}

pub fn has_work_item_link(ctx: &TriggerContext) -> bool {
    ctx.pull_request_body
        .as_deref()
        .and_then(extract_work_item_link)
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(event: &str, action: &str, body: Option<&str>) -> TriggerContext {
        TriggerContext {
            event: event.to_string(),
            action: action.to_string(),
            pull_request_body: body.map(str::to_string),
            has_pull_request: true,
            has_repository: true,
        }
    }

    const LINKED: &str = "https://www.pivotaltracker.com/story/show/1";

    #[test]
    fn test_allows_linked_review_submission() {
        let ctx = context("pull_request_review", "submitted", Some(LINKED));
        assert_eq!(evaluate(DEFAULT_POLICIES, &ctx), PolicyDecision::Allow);
    }

    #[test]
    fn test_denies_unsupported_action() {
        let ctx = context("pull_request", "assigned", Some(LINKED));
        assert_eq!(
            evaluate(DEFAULT_POLICIES, &ctx),
            PolicyDecision::Deny { policy: "supported_trigger" }
        );
    }

    #[test]
    fn test_denies_missing_link() {
        let ctx = context("pull_request", "labeled", Some("no link here"));
        assert_eq!(
            evaluate(DEFAULT_POLICIES, &ctx),
            PolicyDecision::Deny { policy: "has_work_item_link" }
        );

        let ctx = context("pull_request", "labeled", None);
        assert_eq!(
            evaluate(DEFAULT_POLICIES, &ctx),
            PolicyDecision::Deny { policy: "has_work_item_link" }
        );
    }

    #[test]
    fn test_first_failing_policy_is_reported() {
        let mut ctx = context("issues", "opened", None);
        ctx.has_pull_request = false;
        assert_eq!(
            evaluate(DEFAULT_POLICIES, &ctx),
            PolicyDecision::Deny { policy: "supported_trigger" }
        );
    }

    #[test]
    fn test_missing_repository_is_denied() {
        let mut ctx = context("pull_request", "edited", Some(LINKED));
        ctx.has_repository = false;
        assert_eq!(
            evaluate(DEFAULT_POLICIES, &ctx),
            PolicyDecision::Deny { policy: "has_pull_request" }
        );
    }

    #[test]
    fn test_empty_policy_list_allows() {
        assert_eq!(
            evaluate(&[], &TriggerContext::default()),
            PolicyDecision::Allow
        );
    }
}
