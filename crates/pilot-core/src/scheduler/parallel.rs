//! The parallel engine: mark-before-acquire, a race-free admission
//! against the stop-flag, and a spawned worker per eligible ticket.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::lifecycle::ConcurrencyGate;
use crate::model::{StatusLabel, Ticket, TicketId};
use crate::traits::{IssueHandler, TrackerClient};

use super::Scheduler;

pub(super) async fn dispatch(scheduler: &Scheduler, tickets: Vec<Ticket>, cancel: &CancellationToken) -> Result<()> {
    for ticket in tickets {
        // Re-checked on every iteration, not just inside `try_admit`:
        // once draining begins, this tick stops offering tickets at all
        // rather than racing the gate for a slot that would just be
        // handed back. Mirrors the teacher orchestrator's per-iteration
        // `cancel.is_cancelled()` check at the top of its dispatch loop.
        if cancel.is_cancelled() {
            break;
        }

        // 1. Mark-before-acquire: the invariant that prevents duplicate
        // dispatch across overlapping ticks. A crash between this mark
        // and completion is repaired by the next process's recovery
        // pass, not by this one.
        scheduler.processed.mark(&ticket.id, "dispatched").await?;

        // 2. Acquire a slot; abandon the ticket (no worker spawned) if
        // the gate is already draining, or cancellation fires while
        // blocked waiting for capacity, by the time we're admitted.
        let Some(permit) = scheduler.gate.try_admit(cancel).await else {
            continue;
        };

        scheduler.mark_active(ticket.id.clone());

        // Spawned so this tick can move on to the next eligible ticket
        // immediately; the gate (not the tick loop) bounds concurrency,
        // and a long-running handler may still be executing when a
        // newer ticket's tick completes.
        tokio::spawn(run_worker(
            scheduler.tracker.clone(),
            scheduler.handler.clone(),
            scheduler.active.clone(),
            scheduler.gate.clone(),
            permit,
            ticket,
            cancel.clone(),
        ));
    }
    Ok(())
}

async fn run_worker(
    tracker: Arc<dyn TrackerClient>,
    handler: Arc<dyn IssueHandler>,
    active: Arc<Mutex<HashSet<TicketId>>>,
    gate: Arc<ConcurrencyGate>,
    permit: OwnedSemaphorePermit,
    ticket: Ticket,
    cancel: CancellationToken,
) {
    if let Err(e) = tracker.add_label(&ticket.id, StatusLabel::InProgress).await {
        warn!(ticket_id = %ticket.id, error = %e, "failed to set in-progress label (best-effort)");
    }

    // The handler receives the scheduler's real cancellation signal and
    // is expected to return promptly once it fires (spec.md section 5);
    // a freshly-minted, never-cancelled token would make that parameter
    // inert.
    let outcome = handler.handle(cancel, ticket.clone()).await;

    if let Err(e) = tracker.remove_label(&ticket.id, StatusLabel::InProgress).await {
        warn!(ticket_id = %ticket.id, error = %e, "failed to clear in-progress label (best-effort)");
    }

    let final_label = match &outcome {
        Ok(result) if result.success => StatusLabel::Done,
        Ok(result) => {
            warn!(ticket_id = %ticket.id, error = ?result.error, "handler reported failure");
            StatusLabel::Failed
        }
        Err(e) => {
            warn!(ticket_id = %ticket.id, error = %e, "handler invocation errored");
            StatusLabel::Failed
        }
    };
    if let Err(e) = tracker.add_label(&ticket.id, final_label).await {
        warn!(ticket_id = %ticket.id, error = %e, "failed to set terminal label (best-effort)");
    }

    active.lock().expect("active set lock poisoned").remove(&ticket.id);
    gate.release(permit).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::mock::{MockIssueHandler, MockTrackerClient};
    use crate::model::IssueResult;
    use crate::scheduler::Scheduler;
    use chrono::Utc;
    use std::time::Duration;

    fn ticket(id: i64) -> Ticket {
        Ticket {
            id: TicketId::from(id),
            created_at: Some(Utc::now()),
            status_labels: HashSet::new(),
            matches_selector: true,
            summary: format!("ticket {id}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bounded_parallelism_and_label_transitions() {
        let tracker = Arc::new(MockTrackerClient::new());
        tracker.set_tickets(vec![ticket(1), ticket(2), ticket(3)]);
        let handler = Arc::new(MockIssueHandler::new());
        handler.set_delay(Duration::from_millis(10));
        handler.set_default_result(IssueResult { success: true, ..Default::default() });

        let mut config = SchedulerConfig::default();
        config.max_concurrent = 2;
        let sched = Scheduler::new(config, tracker.clone(), handler.clone(), None);

        let eligible = sched.discover_eligible().await.unwrap();
        dispatch(&sched, eligible, &CancellationToken::new()).await.unwrap();
        sched.wait_for_active().await;

        assert_eq!(sched.processed_count(), 3);
        assert_eq!(handler.call_count(), 3);
        let labels = tracker.label_calls();
        assert!(labels.iter().any(|(_, l, add)| *l == StatusLabel::Done && *add));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn handler_failure_keeps_ticket_processed_with_failed_label() {
        let tracker = Arc::new(MockTrackerClient::new());
        tracker.set_tickets(vec![ticket(1)]);
        let handler = Arc::new(MockIssueHandler::new());
        handler.set_default_result(IssueResult {
            success: false,
            error: Some("boom".to_owned()),
            ..Default::default()
        });

        let sched = Scheduler::new(SchedulerConfig::default(), tracker.clone(), handler, None);
        let eligible = sched.discover_eligible().await.unwrap();
        dispatch(&sched, eligible, &CancellationToken::new()).await.unwrap();
        sched.wait_for_active().await;

        assert!(sched.is_processed(&TicketId::from(1i64)));
        let labels = tracker.label_calls();
        assert!(labels.iter().any(|(_, l, add)| *l == StatusLabel::Failed && *add));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn max_concurrent_bounds_simultaneous_handlers() {
        let tracker = Arc::new(MockTrackerClient::new());
        tracker.set_tickets(vec![ticket(1), ticket(2), ticket(3)]);
        let handler = Arc::new(MockIssueHandler::new());
        handler.set_delay(Duration::from_millis(80));

        let mut config = SchedulerConfig::default();
        config.max_concurrent = 2;
        let sched = Scheduler::new(config, tracker.clone(), handler.clone(), None);

        let eligible = sched.discover_eligible().await.unwrap();
        dispatch(&sched, eligible, &CancellationToken::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sched.gate.in_flight().await, 2, "at most max_concurrent handlers run at once");

        sched.wait_for_active().await;
        assert_eq!(handler.call_count(), 3);
    }
}
