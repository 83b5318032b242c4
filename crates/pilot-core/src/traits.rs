//! The external collaborators the scheduler needs: a tracker client, a
//! code-generation handler, an optional persistent store, and a cheap
//! oracle of "what is this process currently executing."
//!
//! Concrete implementations (REST clients, webhook parsers, a real
//! code-gen executor) are out of scope for this core; these traits are
//! the entire contract.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{IssueResult, StatusLabel, Ticket, TicketId, WorkItem};

/// Everything the scheduler needs from the tracker adapter.
///
/// Implementations are treated as thread-safe by contract: each worker
/// may call any method independently without external synchronization.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// List open tickets bearing `selector`. Oldest-first if the
    /// underlying API supports it; the scheduler re-sorts regardless.
    async fn list_open_tickets(&self, selector: &str) -> Result<Vec<Ticket>>;

    /// Idempotent: adding a label that is already present succeeds as a
    /// no-op.
    async fn add_label(&self, id: &TicketId, label: StatusLabel) -> Result<()>;

    /// Idempotent: removing an absent label succeeds as a no-op.
    async fn remove_label(&self, id: &TicketId, label: StatusLabel) -> Result<()>;

    async fn get_work_item(&self, id: &TicketId) -> Result<WorkItem>;

    /// Used only by the stale-label cleaner, for operator visibility.
    async fn post_note(&self, id: &TicketId, text: &str) -> Result<()>;
}

/// The code-generation executor. One call per ticket; the scheduler
/// interprets only `success`, `work_item_id`, and `error` on the result.
#[async_trait]
pub trait IssueHandler: Send + Sync {
    async fn handle(&self, cancel: CancellationToken, ticket: Ticket) -> Result<IssueResult>;
}

/// Optional write-through persistence for the processed set. Ticket ids
/// are always exchanged as strings so that one store schema can serve
/// both integer-keyed and string-keyed trackers.
#[async_trait]
pub trait ProcessedStore: Send + Sync {
    async fn mark(&self, id: &TicketId, outcome_tag: &str) -> Result<()>;
    async fn unmark(&self, id: &TicketId) -> Result<()>;
    async fn is_processed(&self, id: &TicketId) -> Result<bool>;
    async fn load_all(&self) -> Result<HashSet<TicketId>>;
}

/// A cheap, synchronous oracle of which tickets this process is
/// currently executing, consulted by the stale-label cleaner so it
/// never races with a handler that has just started.
pub trait ActiveExecutions: Send + Sync {
    fn is_active(&self, id: &TicketId) -> bool;
}

#[cfg(test)]
mod object_safety {
    use super::*;

    // Compile-time assertion: these traits must remain object-safe,
    // since the scheduler stores them as `Arc<dyn Trait>`.
    fn _assert_tracker_object_safe(_: &dyn TrackerClient) {}
    fn _assert_handler_object_safe(_: &dyn IssueHandler) {}
    fn _assert_store_object_safe(_: &dyn ProcessedStore) {}
    fn _assert_active_object_safe(_: &dyn ActiveExecutions) {}
}
