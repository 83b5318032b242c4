//! The sequential engine: one ticket at a time, gated on the merge
//! waiter's verdict before the next ticket is ever handed to the
//! handler.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::merge_waiter::{self, MergeWaiterConfig, MergeWaitOutcome};
use crate::model::{MergeOutcome, StatusLabel, Ticket, TicketId};

use super::Scheduler;

pub(super) async fn dispatch(scheduler: &Scheduler, mut tickets: Vec<Ticket>, cancel: &CancellationToken) -> Result<()> {
    // Only the single oldest eligible ticket is processed per tick;
    // the rest wait for the next tick (or, if this one pauses on a
    // back-off, are re-discovered once the back-off expires).
    let Some(ticket) = tickets.drain(..).next() else {
        return Ok(());
    };

    scheduler.mark_active(ticket.id.clone());
    let outcome = process_one(scheduler, ticket.clone(), cancel).await;
    scheduler.unmark_active(&ticket.id);
    outcome
}

async fn process_one(scheduler: &Scheduler, ticket: Ticket, cancel: &CancellationToken) -> Result<()> {
    if let Err(e) = scheduler.tracker.add_label(&ticket.id, StatusLabel::InProgress).await {
        warn!(ticket_id = %ticket.id, error = %e, "failed to set in-progress label (best-effort)");
    }

    // The handler receives the scheduler's real cancellation signal
    // (spec.md section 5/6), not an inert, never-fired token.
    let handle_result = scheduler.handler.handle(cancel.clone(), ticket.clone()).await;

    if let Err(e) = scheduler.tracker.remove_label(&ticket.id, StatusLabel::InProgress).await {
        warn!(ticket_id = %ticket.id, error = %e, "failed to clear in-progress label (best-effort)");
    }

    let issue_result = match handle_result {
        Ok(result) => result,
        Err(e) => {
            // Terminal handler error: mark processed to avoid an
            // infinite retry loop; the `failed` label communicates
            // that recovery is manual (ClearProcessed + label removal).
            warn!(ticket_id = %ticket.id, error = %e, "handler invocation errored");
            scheduler.processed.mark(&ticket.id, "handler-error").await?;
            if let Err(e) = scheduler.tracker.add_label(&ticket.id, StatusLabel::Failed).await {
                warn!(ticket_id = %ticket.id, error = %e, "failed to set failed label (best-effort)");
            }
            return Ok(());
        }
    };

    if !issue_result.success {
        warn!(ticket_id = %ticket.id, error = ?issue_result.error, "handler reported failure");
        scheduler.processed.mark(&ticket.id, "handler-failed").await?;
        if let Err(e) = scheduler.tracker.add_label(&ticket.id, StatusLabel::Failed).await {
            warn!(ticket_id = %ticket.id, error = %e, "failed to set failed label (best-effort)");
        }
        return Ok(());
    }

    let Some(work_item_id) = issue_result.work_item_id.clone() else {
        // No work item but success: a direct-to-main commit.
        scheduler.processed.mark(&ticket.id, "direct-commit").await?;
        if let Err(e) = scheduler.tracker.add_label(&ticket.id, StatusLabel::Done).await {
            warn!(ticket_id = %ticket.id, error = %e, "failed to set done label (best-effort)");
        }
        return Ok(());
    };

    if !scheduler.config.wait_for_merge {
        scheduler.processed.mark(&ticket.id, "work-item-created").await?;
        if let Err(e) = scheduler.tracker.add_label(&ticket.id, StatusLabel::Done).await {
            warn!(ticket_id = %ticket.id, error = %e, "failed to set done label (best-effort)");
        }
        return Ok(());
    }

    interpret_merge_wait(scheduler, &ticket.id, &work_item_id, cancel).await
}

async fn interpret_merge_wait(
    scheduler: &Scheduler,
    ticket_id: &TicketId,
    work_item_id: &TicketId,
    cancel: &CancellationToken,
) -> Result<()> {
    let config = MergeWaiterConfig {
        poll_interval: scheduler.config.mr_poll_interval,
        deadline: scheduler.config.mr_timeout,
    };

    // The waiter's poll sleep must be selectable against the real
    // signal, not a token that never fires: otherwise a drain can block
    // up to `mr_timeout` here instead of returning promptly.
    let wait_result = merge_waiter::wait_for_merge(scheduler.tracker(), work_item_id, &config, cancel, |_| {}).await;

    let outcome = match wait_result {
        Ok(MergeWaitOutcome::Terminal(result)) => result.outcome,
        Ok(MergeWaitOutcome::Cancelled(_)) => {
            // Cancellation never marks processed; the next start will
            // re-discover this ticket through the recovery pass.
            return Ok(());
        }
        Err(e) => {
            // "Transport error from the waiter" is handled like a
            // timeout: pause and retry, don't mark processed.
            warn!(ticket_id = %ticket_id, error = %e, "merge waiter transport error; treating as timeout");
            back_off(scheduler).await;
            return Ok(());
        }
    };

    match outcome {
        MergeOutcome::Merged => {
            scheduler.processed.mark(ticket_id, "merged").await?;
            if let Err(e) = scheduler.tracker.add_label(ticket_id, StatusLabel::Done).await {
                warn!(ticket_id = %ticket_id, error = %e, "failed to set done label (best-effort)");
            }
        }
        MergeOutcome::ClosedWithoutMerge => {
            // Deliberately not marked processed: the ticket may need
            // re-execution. See spec.md's open question about
            // indefinite re-offering under repeated manual closes.
            info!(ticket_id = %ticket_id, "work item closed without merge; leaving unprocessed");
        }
        MergeOutcome::HasConflicts | MergeOutcome::TimedOut => {
            back_off(scheduler).await;
        }
    }
    Ok(())
}

async fn back_off(scheduler: &Scheduler) {
    tokio::time::sleep(scheduler.config.sequential_backoff).await;
}
