//! Collapsing a pull request's review history into one status per reviewer.
//!
//! The code host records reviews as an append-only list of events. A reviewer
//! may comment several times, approve, get dismissed, and be re-requested.
//! The tracker only cares about where each reviewer stands *now*, which is
//! what [`aggregate_reviews`] computes.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw state of a submitted review, as reported by the code host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewEventState {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
    /// Anything else the code host may report (e.g. `PENDING`). Treated like
    /// a dismissal: it never decides a reviewer's status.
    #[serde(other)]
    Unknown,
}

/// One submitted review on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewEvent {
    pub id: u64,
    pub reviewer: String,
    pub state: ReviewEventState,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ReviewEvent {
    pub fn new(
        id: u64,
        reviewer: impl Into<String>,
        state: ReviewEventState,
        submitted_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            reviewer: reviewer.into(),
            state,
            submitted_at,
        }
    }
}

/// The single derived review outcome for a reviewer on one pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalStatus {
    /// The reviewer has an outstanding review request.
    New,
    Approved,
    ChangesRequested,
    Commented,
}

/// Derive the canonical status of every reviewer on a pull request.
///
/// Rules, per reviewer:
/// 1. An outstanding review request always yields [`CanonicalStatus::New`],
///    whatever the reviewer said before.
/// 2. Otherwise the most recent approval or change request wins. Dismissed
///    reviews are skipped, so they neither count nor hide older verdicts.
/// 3. Otherwise, if the reviewer commented at all, [`CanonicalStatus::Commented`].
/// 4. Otherwise the reviewer is omitted.
///
/// `events` may be passed in any order; they are sorted newest first. Events
/// without a timestamp are treated as the oldest. The pull request's author
/// never appears in the result.
pub fn aggregate_reviews(
    events: &[ReviewEvent],
    requested_reviewers: &[String],
    author: &str,
) -> BTreeMap<String, CanonicalStatus> {
    let mut newest_first: Vec<&ReviewEvent> = events.iter().collect();
    // Stable, so same-timestamp events keep their relative order.
    newest_first.sort_by_key(|event| Reverse(event.submitted_at));

    let requested: BTreeSet<&str> = requested_reviewers
        .iter()
        .map(String::as_str)
        .filter(|login| *login != author)
        .collect();

    let mut by_reviewer: BTreeMap<&str, Vec<ReviewEventState>> = BTreeMap::new();
    for event in newest_first {
        if event.reviewer == author {
            continue;
        }
        by_reviewer
            .entry(event.reviewer.as_str())
            .or_default()
            .push(event.state);
    }

    let mut result = BTreeMap::new();

    for login in &requested {
        result.insert((*login).to_string(), CanonicalStatus::New);
    }

    for (login, states) in by_reviewer {
        if requested.contains(login) {
            continue;
        }
        if let Some(status) = status_from_history(&states) {
            result.insert(login.to_string(), status);
        }
    }

    result
}

/// Resolve a newest-first list of review states to a canonical status.
fn status_from_history(states: &[ReviewEventState]) -> Option<CanonicalStatus> {
    let verdict = states.iter().find_map(|state| match state {
        ReviewEventState::Approved => Some(CanonicalStatus::Approved),
        ReviewEventState::ChangesRequested => Some(CanonicalStatus::ChangesRequested),
        _ => None,
    });

    verdict.or_else(|| {
        states
            .contains(&ReviewEventState::Commented)
            .then_some(CanonicalStatus::Commented)
    })
}
