//! An illustrative, in-memory `TrackerClient`/`IssueHandler` pair.
//!
//! Concrete tracker adapters (GitHub/GitLab/Jira/Discord/Slack/Telegram)
//! are out of scope for this repository; this module exists only so
//! `pilot run` has something to drive end-to-end from a terminal. It
//! seeds a handful of fake tickets in memory, "resolves" each by
//! sleeping briefly and reporting success, and never calls out to the
//! network. It is not a template for a first real adapter.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use pilot_core::{IssueHandler, IssueResult, StatusLabel, Ticket, TicketId, TrackerClient, WorkItem};

/// A fixed, in-memory list of tickets that never changes shape beyond
/// the labels the scheduler itself mutates.
pub struct DemoTracker {
    tickets: Mutex<Vec<Ticket>>,
}

impl DemoTracker {
    pub fn seeded(count: i64) -> Self {
        let tickets = (1..=count)
            .map(|n| Ticket {
                id: TicketId::Int(n),
                created_at: Some(Utc.timestamp_opt(1_700_000_000 + n * 60, 0).unwrap()),
                status_labels: Default::default(),
                matches_selector: true,
                summary: format!("demo ticket #{n}"),
            })
            .collect();
        Self { tickets: Mutex::new(tickets) }
    }
}

#[async_trait]
impl TrackerClient for DemoTracker {
    async fn list_open_tickets(&self, _selector: &str) -> Result<Vec<Ticket>> {
        Ok(self.tickets.lock().expect("demo tracker lock poisoned").clone())
    }

    async fn add_label(&self, id: &TicketId, label: StatusLabel) -> Result<()> {
        let mut tickets = self.tickets.lock().expect("demo tracker lock poisoned");
        if let Some(ticket) = tickets.iter_mut().find(|t| &t.id == id) {
            ticket.status_labels.insert(label);
        }
        Ok(())
    }

    async fn remove_label(&self, id: &TicketId, label: StatusLabel) -> Result<()> {
        let mut tickets = self.tickets.lock().expect("demo tracker lock poisoned");
        if let Some(ticket) = tickets.iter_mut().find(|t| &t.id == id) {
            ticket.status_labels.remove(&label);
        }
        Ok(())
    }

    async fn get_work_item(&self, _id: &TicketId) -> Result<WorkItem> {
        Ok(WorkItem { merged: true, ..Default::default() })
    }

    async fn post_note(&self, id: &TicketId, text: &str) -> Result<()> {
        info!(ticket_id = %id, note = text, "demo tracker: note posted");
        Ok(())
    }
}

/// A handler that "resolves" every ticket after a short, fixed delay,
/// standing in for the real code-generation executor.
pub struct DemoHandler {
    delay: Duration,
}

impl DemoHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl IssueHandler for DemoHandler {
    async fn handle(&self, _cancel: CancellationToken, ticket: Ticket) -> Result<IssueResult> {
        info!(ticket_id = %ticket.id, summary = %ticket.summary, "demo handler: working");
        tokio::time::sleep(self.delay).await;
        Ok(IssueResult { success: true, ..Default::default() })
    }
}
