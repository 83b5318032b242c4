//! In-memory test doubles for the scheduler's external collaborators.
//!
//! A plain (non-`cfg(test)`) module so that the `#[cfg(test)] mod
//! tests` blocks scattered across `scheduler/`, `merge_waiter.rs`,
//! `processed.rs`, and `stale_cleaner.rs` can all `use crate::mock::..`
//! without a separate test-support crate. No network, process, or
//! database access — everything is `Arc<Mutex<..>>`-backed shared
//! state, configured per-test by pushing queued responses or toggling
//! flags before the scheduler runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{IssueResult, StatusLabel, Ticket, TicketId, WorkItem};
use crate::traits::{ActiveExecutions, IssueHandler, ProcessedStore, TrackerClient};

/// A scriptable `TrackerClient`. Tests seed it with a fixed ticket list
/// and work-item states and then assert on the labels mutated and
/// notes posted over the run.
#[derive(Default)]
pub struct MockTrackerClient {
    inner: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    tickets: Vec<Ticket>,
    work_items: HashMap<TicketId, WorkItem>,
    work_item_errors: HashMap<TicketId, String>,
    label_calls: Vec<(TicketId, StatusLabel, bool)>, // bool: true = add, false = remove
    notes: Vec<(TicketId, String)>,
    list_calls: usize,
}

impl MockTrackerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tickets(&self, tickets: Vec<Ticket>) {
        self.inner.lock().unwrap().tickets = tickets;
    }

    pub fn set_work_item(&self, id: TicketId, item: WorkItem) {
        self.inner.lock().unwrap().work_items.insert(id, item);
    }

    pub fn fail_get_work_item(&self, id: TicketId, message: &str) {
        self.inner
            .lock()
            .unwrap()
            .work_item_errors
            .insert(id, message.to_owned());
    }

    pub fn label_calls(&self) -> Vec<(TicketId, StatusLabel, bool)> {
        self.inner.lock().unwrap().label_calls.clone()
    }

    pub fn notes(&self) -> Vec<(TicketId, String)> {
        self.inner.lock().unwrap().notes.clone()
    }

    pub fn list_call_count(&self) -> usize {
        self.inner.lock().unwrap().list_calls
    }

    /// Remove a label from a ticket's in-memory state, as if an
    /// `add_label`/`remove_label` call had actually mutated the tracker.
    /// The scheduler's own `add_label`/`remove_label` calls already
    /// mutate `tickets` directly so re-listing reflects the change.
    fn mutate_label(tickets: &mut [Ticket], id: &TicketId, label: StatusLabel, add: bool) {
        for ticket in tickets.iter_mut() {
            if &ticket.id == id {
                if add {
                    ticket.status_labels.insert(label);
                } else {
                    ticket.status_labels.remove(&label);
                }
            }
        }
    }
}

#[async_trait]
impl TrackerClient for MockTrackerClient {
    async fn list_open_tickets(&self, selector: &str) -> Result<Vec<Ticket>> {
        let mut inner = self.inner.lock().unwrap();
        inner.list_calls += 1;
        Ok(inner
            .tickets
            .iter()
            .filter(|t| t.matches_selector || selector.is_empty())
            .cloned()
            .collect())
    }

    async fn add_label(&self, id: &TicketId, label: StatusLabel) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::mutate_label(&mut inner.tickets, id, label, true);
        inner.label_calls.push((id.clone(), label, true));
        Ok(())
    }

    async fn remove_label(&self, id: &TicketId, label: StatusLabel) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::mutate_label(&mut inner.tickets, id, label, false);
        inner.label_calls.push((id.clone(), label, false));
        Ok(())
    }

    async fn get_work_item(&self, id: &TicketId) -> Result<WorkItem> {
        let inner = self.inner.lock().unwrap();
        if let Some(message) = inner.work_item_errors.get(id) {
            return Err(anyhow!("{message}"));
        }
        Ok(inner.work_items.get(id).cloned().unwrap_or_default())
    }

    async fn post_note(&self, id: &TicketId, text: &str) -> Result<()> {
        self.inner.lock().unwrap().notes.push((id.clone(), text.to_owned()));
        Ok(())
    }
}

/// A scriptable `IssueHandler`. By default returns success with no
/// work item; tests can queue per-call results or a fixed delay.
#[derive(Default)]
pub struct MockIssueHandler {
    inner: Mutex<HandlerState>,
}

#[derive(Default)]
struct HandlerState {
    queued: VecDeque<IssueResult>,
    default_result: Option<IssueResult>,
    delay: Option<std::time::Duration>,
    calls: Vec<TicketId>,
}

impl MockIssueHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_result(&self, result: IssueResult) {
        self.inner.lock().unwrap().queued.push_back(result);
    }

    pub fn set_default_result(&self, result: IssueResult) {
        self.inner.lock().unwrap().default_result = Some(result);
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        self.inner.lock().unwrap().delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<TicketId> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }
}

#[async_trait]
impl IssueHandler for MockIssueHandler {
    async fn handle(&self, _cancel: CancellationToken, ticket: Ticket) -> Result<IssueResult> {
        let (delay, result) = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(ticket.id.clone());
            let result = inner
                .queued
                .pop_front()
                .or_else(|| inner.default_result.clone())
                .unwrap_or(IssueResult { success: true, ..Default::default() });
            (inner.delay, result)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(result)
    }
}

/// A pure in-memory `ProcessedStore`, standing in for `pilot-db`'s
/// Postgres-backed implementation in tests that only need the
/// write-through contract, not real persistence.
#[derive(Default)]
pub struct InMemoryProcessedStore {
    ids: Mutex<HashMap<TicketId, String>>,
}

impl InMemoryProcessedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedStore for InMemoryProcessedStore {
    async fn mark(&self, id: &TicketId, outcome_tag: &str) -> Result<()> {
        self.ids.lock().unwrap().insert(id.clone(), outcome_tag.to_owned());
        Ok(())
    }

    async fn unmark(&self, id: &TicketId) -> Result<()> {
        self.ids.lock().unwrap().remove(id);
        Ok(())
    }

    async fn is_processed(&self, id: &TicketId) -> Result<bool> {
        Ok(self.ids.lock().unwrap().contains_key(id))
    }

    async fn load_all(&self) -> Result<HashSet<TicketId>> {
        Ok(self.ids.lock().unwrap().keys().cloned().collect())
    }
}

/// A trivial `ActiveExecutions` oracle backed by a fixed set, for
/// stale-cleaner tests that don't need a live scheduler.
#[derive(Default)]
pub struct StaticActiveExecutions {
    active: Mutex<HashSet<TicketId>>,
}

impl StaticActiveExecutions {
    pub fn new(active: impl IntoIterator<Item = TicketId>) -> Self {
        Self { active: Mutex::new(active.into_iter().collect()) }
    }
}

impl ActiveExecutions for StaticActiveExecutions {
    fn is_active(&self, id: &TicketId) -> bool {
        self.active.lock().unwrap().contains(id)
    }
}
