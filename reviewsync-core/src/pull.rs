//! Pull request addressing and per-run snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::review::{aggregate_reviews, CanonicalStatus, ReviewEvent};

/// Label that marks a pull request as work in progress.
pub const DEFAULT_WIP_LABEL: &str = "WIP";

/// Address of a pull request on the code host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PullRequestRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, number: u64) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            number,
        }
    }
}

impl fmt::Display for PullRequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

impl FromStr for PullRequestRef {
    type Err = String;

    /// Parses `owner/repo#number`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, number) = s
            .rsplit_once('#')
            .ok_or_else(|| format!("expected owner/repo#number, got '{}'", s))?;
        let (owner, repo) = path
            .split_once('/')
            .ok_or_else(|| format!("expected owner/repo#number, got '{}'", s))?;
        if owner.is_empty() || repo.is_empty() {
            return Err(format!("expected owner/repo#number, got '{}'", s));
        }
        let number = number
            .parse::<u64>()
            .map_err(|_| format!("invalid pull request number in '{}'", s))?;
        Ok(Self::new(owner, repo, number))
    }
}

/// Pull request details as fetched from the code host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestDetails {
    pub repo_name: String,
    pub author: String,
    pub merged: bool,
    pub draft: bool,
    pub labels: Vec<String>,
    pub requested_reviewers: Vec<String>,
}

impl PullRequestDetails {
    /// A pull request is work in progress when it is a draft or carries the WIP label.
    pub fn is_wip(&self, wip_label: &str) -> bool {
        self.draft || self.labels.iter().any(|label| label == wip_label)
    }
}

/// Everything the target state builder needs to know about one pull request.
///
/// Built fresh for every reconciliation run and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSnapshot {
    pub repo_name: String,
    pub author: String,
    pub merged: bool,
    pub wip: bool,
    pub reviews_by_user: BTreeMap<String, CanonicalStatus>,
}

impl PullRequestSnapshot {
    /// Combine pull request details with its review history.
    pub fn build(details: &PullRequestDetails, reviews: &[ReviewEvent], wip_label: &str) -> Self {
        Self {
            repo_name: details.repo_name.clone(),
            author: details.author.clone(),
            merged: details.merged,
            wip: details.is_wip(wip_label),
            reviews_by_user: aggregate_reviews(
                reviews,
                &details.requested_reviewers,
                &details.author,
            ),
        }
    }
}
