//! The ticket-ingestion data model: the handful of fields the scheduler
//! needs from a tracker ticket, and the shapes it exchanges with the
//! handler and the merge waiter.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Opaque, tracker-unique identifier. GitHub/GitLab issue numbers are
/// integers; Jira keys (`PROJ-42`) are strings. The scheduler only ever
/// uses this as an equality/hash key and a deterministic sort tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TicketId {
    Int(i64),
    Str(String),
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketId::Int(n) => write!(f, "{n}"),
            TicketId::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for TicketId {
    fn from(n: i64) -> Self {
        TicketId::Int(n)
    }
}

impl From<String> for TicketId {
    fn from(s: String) -> Self {
        TicketId::Str(s)
    }
}

impl From<&str> for TicketId {
    fn from(s: &str) -> Self {
        TicketId::Str(s.to_owned())
    }
}

/// The subset of a ticket's labels the scheduler cares about. These map
/// to the exact contract strings in `AddLabel`/`RemoveLabel` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusLabel {
    InProgress,
    Done,
    Failed,
}

impl StatusLabel {
    pub const ALL: [StatusLabel; 3] = [StatusLabel::InProgress, StatusLabel::Done, StatusLabel::Failed];

    /// The exact, non-configurable label string shared with human operators.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusLabel::InProgress => "pilot-in-progress",
            StatusLabel::Done => "pilot-done",
            StatusLabel::Failed => "pilot-failed",
        }
    }
}

impl fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unrecognized status label: {0:?}")]
pub struct ParseLabelError(String);

impl FromStr for StatusLabel {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pilot-in-progress" => Ok(StatusLabel::InProgress),
            "pilot-done" => Ok(StatusLabel::Done),
            "pilot-failed" => Ok(StatusLabel::Failed),
            other => Err(ParseLabelError(other.to_owned())),
        }
    }
}

/// A candidate work item, as seen by the scheduler. Opaque beyond the
/// five fields below.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: TicketId,
    pub created_at: Option<DateTime<Utc>>,
    pub status_labels: HashSet<StatusLabel>,
    pub matches_selector: bool,
    pub summary: String,
}

impl Ticket {
    pub fn has_label(&self, label: StatusLabel) -> bool {
        self.status_labels.contains(&label)
    }
}

/// What the handler produced for a single ticket.
#[derive(Debug, Clone, Default)]
pub struct IssueResult {
    pub success: bool,
    pub work_item_id: Option<TicketId>,
    pub work_item_url: Option<String>,
    pub head_sha: Option<String>,
    pub branch_name: Option<String>,
    pub error: Option<String>,
}

/// The current state of a work item (PR/MR) as reported by the tracker.
#[derive(Debug, Clone, Default)]
pub struct WorkItem {
    pub merged: bool,
    pub closed: bool,
    pub has_conflicts: bool,
    pub pipeline_status: Option<PipelineStatus>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Non-terminal pipeline state, surfaced only through the merge waiter's
/// per-tick callback. It never ends the wait on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Running,
    Failed,
}

/// The four terminal outcomes a merge wait can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    ClosedWithoutMerge,
    HasConflicts,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct MergeWaitResult {
    pub outcome: MergeOutcome,
    pub work_item_id: TicketId,
    pub work_item_url: Option<String>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_label_round_trips_through_display_and_parse() {
        for label in StatusLabel::ALL {
            let parsed: StatusLabel = label.to_string().parse().unwrap();
            assert_eq!(parsed, label);
        }
    }

    #[test]
    fn unrecognized_label_is_an_error() {
        assert!("wontfix".parse::<StatusLabel>().is_err());
    }

    #[test]
    fn ticket_id_display_matches_variant() {
        assert_eq!(TicketId::Int(42).to_string(), "42");
        assert_eq!(TicketId::from("PROJ-7").to_string(), "PROJ-7");
    }
}
