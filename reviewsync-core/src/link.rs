//! Finding the linked work item in free text such as a pull request description.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static WORK_ITEM_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\s]*pivotaltracker\.com/(?:n/projects/\d+/)?stories?/(?:show/)?(\d+)")
        .expect("work item URL pattern is valid")
});

/// A work item reference found in text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItemLink {
    pub url: String,
    pub id: String,
}

/// Find the first work item URL in `text`.
///
/// Returns `None` when there is no link; that is the normal case for pull
/// requests not tied to a work item.
pub fn extract_work_item_link(text: &str) -> Option<WorkItemLink> {
    let captures = WORK_ITEM_URL.captures(text)?;
    Some(WorkItemLink {
        url: captures.get(0)?.as_str().to_string(),
        id: captures.get(1)?.as_str().to_string(),
    })
}
