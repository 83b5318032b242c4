//! The merge waiter: polls a work item until it reaches one of four
//! terminal outcomes or the deadline passes. It is deliberately not a
//! state machine — just an I/O poll loop with one non-terminal
//! reporting channel (the per-tick pipeline-status callback).

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::{MergeOutcome, MergeWaitResult, PipelineStatus, TicketId, WorkItem};
use crate::traits::TrackerClient;

#[derive(Debug, Clone)]
pub struct MergeWaiterConfig {
    pub poll_interval: Duration,
    pub deadline: Duration,
}

impl Default for MergeWaiterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            deadline: Duration::from_secs(60 * 60),
        }
    }
}

/// Non-terminal signal from a cancelled wait. The sequential engine
/// treats this the same as any other "don't mark processed" stall;
/// cancellation itself is never an error.
#[derive(Debug, Clone)]
pub struct Cancelled;

pub enum MergeWaitOutcome {
    Terminal(MergeWaitResult),
    Cancelled(Cancelled),
}

/// Wait for `id`'s work item to reach a terminal state.
///
/// Checks immediately, then on every `poll_interval` tick. Per fetch,
/// outcomes are tested in order: merged -> closed -> has_conflicts ->
/// pipeline-status (callback only, non-terminal) -> still open. The
/// deadline is enforced as a wall-clock `tokio::time::timeout` around
/// the whole loop; on elapse it reports `TimedOut` rather than
/// propagating the timeout error. Transport errors from the tracker
/// propagate verbatim — this function never retries on its own.
pub async fn wait_for_merge(
    tracker: &dyn TrackerClient,
    id: &TicketId,
    config: &MergeWaiterConfig,
    cancel: &CancellationToken,
    mut on_tick: impl FnMut(PipelineStatus) + Send,
) -> Result<MergeWaitOutcome> {
    let poll = async {
        let mut interval = tokio::time::interval(config.poll_interval);
        // The first tick of `interval` fires immediately, so the work
        // item's state is checked once before the first poll delay.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(MergeWaitOutcome::Cancelled(Cancelled));
                }
                _ = interval.tick() => {
                    match classify(tracker, id, &mut on_tick).await? {
                        Some(result) => return Ok(MergeWaitOutcome::Terminal(result)),
                        None => continue,
                    }
                }
            }
        }
    };

    match tokio::time::timeout(config.deadline, poll).await {
        Ok(result) => result,
        Err(_elapsed) => {
            debug!(ticket_id = %id, "merge wait deadline elapsed");
            Ok(MergeWaitOutcome::Terminal(MergeWaitResult {
                outcome: MergeOutcome::TimedOut,
                work_item_id: id.clone(),
                work_item_url: None,
                message: format!("merge wait for {id} timed out after {:?}", config.deadline),
            }))
        }
    }
}

async fn classify(
    tracker: &dyn TrackerClient,
    id: &TicketId,
    on_tick: &mut impl FnMut(PipelineStatus),
) -> Result<Option<MergeWaitResult>> {
    let item: WorkItem = tracker.get_work_item(id).await?;

    if item.merged {
        return Ok(Some(MergeWaitResult {
            outcome: MergeOutcome::Merged,
            work_item_id: id.clone(),
            work_item_url: None,
            message: format!("{id} merged"),
        }));
    }
    if item.closed {
        return Ok(Some(MergeWaitResult {
            outcome: MergeOutcome::ClosedWithoutMerge,
            work_item_id: id.clone(),
            work_item_url: None,
            message: format!("{id} closed without merging"),
        }));
    }
    if item.has_conflicts {
        return Ok(Some(MergeWaitResult {
            outcome: MergeOutcome::HasConflicts,
            work_item_id: id.clone(),
            work_item_url: None,
            message: format!("{id} has merge conflicts"),
        }));
    }
    if let Some(status) = item.pipeline_status {
        on_tick(status);
    }
    Ok(None)
}
