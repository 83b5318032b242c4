//! The scheduler loop: per-tick discovery, eligibility filtering, and
//! dispatch into the parallel or sequential engine.

mod parallel;
mod sequential;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Mode, SchedulerConfig};
use crate::lifecycle::{ConcurrencyGate, Lifecycle, LifecycleState};
use crate::model::{StatusLabel, Ticket, TicketId};
use crate::processed::ProcessedSet;
use crate::traits::{ActiveExecutions, IssueHandler, ProcessedStore, TrackerClient};

/// Per-adapter scheduler instance. Owns the `ProcessedSet` and the
/// concurrency gate exclusively; holds, but does not own the lifetime
/// of, the tracker client and issue handler.
pub struct Scheduler {
    config: SchedulerConfig,
    tracker: Arc<dyn TrackerClient>,
    handler: Arc<dyn IssueHandler>,
    has_store: bool,
    processed: ProcessedSet,
    gate: Arc<ConcurrencyGate>,
    lifecycle: Lifecycle,
    active: Arc<Mutex<HashSet<TicketId>>>,
}

/// An [`ActiveExecutions`] view backed by the scheduler's own
/// in-flight tracking, handed to the stale-label cleaner.
pub struct SchedulerActiveExecutions(Arc<Mutex<HashSet<TicketId>>>);

impl ActiveExecutions for SchedulerActiveExecutions {
    fn is_active(&self, id: &TicketId) -> bool {
        self.0.lock().expect("active set lock poisoned").contains(id)
    }
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        tracker: Arc<dyn TrackerClient>,
        handler: Arc<dyn IssueHandler>,
        store: Option<Arc<dyn ProcessedStore>>,
    ) -> Self {
        let has_store = store.is_some();
        Self {
            gate: Arc::new(ConcurrencyGate::new(config.max_concurrent)),
            processed: ProcessedSet::new(store),
            lifecycle: Lifecycle::new(),
            active: Arc::new(Mutex::new(HashSet::new())),
            config,
            tracker,
            handler,
            has_store,
        }
    }

    pub fn active_executions(&self) -> SchedulerActiveExecutions {
        SchedulerActiveExecutions(self.active.clone())
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    pub fn is_processed(&self, id: &TicketId) -> bool {
        self.processed.is_processed(id)
    }

    pub async fn clear_processed(&self, id: &TicketId) -> Result<()> {
        self.processed.clear(id).await
    }

    pub fn processed_count(&self) -> usize {
        self.processed.count()
    }

    pub async fn reset(&self) -> Result<()> {
        self.processed.reset().await
    }

    pub async fn drain(&self) {
        self.gate.begin_drain().await;
        self.gate.wait_drained().await;
    }

    /// Test helper described in spec.md section 5: sets the stop-flag
    /// and waits for in-flight work to finish, without requiring a full
    /// cancellation-driven `start` loop to be running.
    pub async fn wait_for_active(&self) {
        self.drain().await;
    }

    /// Run the scheduler until `cancel` fires: a recovery pass, then an
    /// immediate tick followed by ticks at `config.interval`, then a
    /// drain to `Stopped`.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        self.processed
            .rehydrate()
            .await
            .context("rehydrating processed set from store")?;

        if let Err(e) = self.recovery_pass().await {
            warn!(error = %e, "startup recovery pass failed; proceeding to first tick anyway");
        }

        self.lifecycle.transition(LifecycleState::Running)?;

        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.discover_and_dispatch(&cancel).await {
                        warn!(error = %e, "tick failed; will retry next interval");
                    }
                }
            }
        }

        self.lifecycle.transition(LifecycleState::Draining)?;
        self.drain().await;
        self.lifecycle.transition(LifecycleState::Stopped)?;
        Ok(())
    }

    /// Strip `pilot-in-progress` from every open ticket that still
    /// carries it: these were mid-flight when the previous process
    /// died. Failures are logged, never fatal to startup.
    async fn recovery_pass(&self) -> Result<()> {
        let tickets = self
            .tracker
            .list_open_tickets(&self.config.selector)
            .await
            .context("listing tickets for recovery pass")?;

        let mut cleared = 0usize;
        for ticket in tickets.iter().filter(|t| t.has_label(StatusLabel::InProgress)) {
            match self.tracker.remove_label(&ticket.id, StatusLabel::InProgress).await {
                Ok(()) => cleared += 1,
                Err(e) => warn!(ticket_id = %ticket.id, error = %e, "failed to clear stale in-progress label"),
            }
        }
        if cleared > 0 {
            info!(cleared, "startup recovery pass cleared stale in-progress labels");
        }
        Ok(())
    }

    async fn discover_and_dispatch(&self, cancel: &CancellationToken) -> Result<()> {
        let eligible = self.discover_eligible().await?;
        match self.config.mode {
            Mode::Parallel => parallel::dispatch(self, eligible, cancel).await,
            Mode::Sequential => sequential::dispatch(self, eligible, cancel).await,
        }
    }

    /// Query, filter, and sort — shared by both engines per spec.md
    /// section 4.1.
    async fn discover_eligible(&self) -> Result<Vec<Ticket>> {
        let mut tickets = self
            .tracker
            .list_open_tickets(&self.config.selector)
            .await
            .context("listing tickets for dispatch")?;

        sort_oldest_first(&mut tickets);

        let mut eligible = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            if self.processed.is_processed(&ticket.id) {
                continue;
            }
            let blocking_label = ticket.has_label(StatusLabel::InProgress)
                || ticket.has_label(StatusLabel::Done)
                || ticket.has_label(StatusLabel::Failed);
            if blocking_label {
                if self.has_store && ticket.has_label(StatusLabel::Done) {
                    self.processed.mark(&ticket.id, "done-label-observed").await?;
                }
                continue;
            }
            eligible.push(ticket);
        }
        Ok(eligible)
    }

    fn tracker(&self) -> &dyn TrackerClient {
        self.tracker.as_ref()
    }

    fn mark_active(&self, id: TicketId) {
        self.active.lock().expect("active set lock poisoned").insert(id);
    }

    fn unmark_active(&self, id: &TicketId) {
        self.active.lock().expect("active set lock poisoned").remove(id);
    }
}

/// Sort by `created_at` ascending with `id` as a deterministic
/// secondary key; tickets with no timestamp sort last.
fn sort_oldest_first(tickets: &mut [Ticket]) {
    tickets.sort_by(|a, b| match (a.created_at, b.created_at) {
        (Some(ca), Some(cb)) => ca.cmp(&cb).then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    });
}
