//! The stale-label cleaner: an auxiliary, optional loop that
//! reconciles the tracker against tickets this process is *actually*
//! still executing, using wall-clock age rather than the startup
//! recovery pass's one-shot sweep. This lets it tolerate concurrent
//! executions without racing a handler that has just started.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StaleCleanupConfig;
use crate::model::StatusLabel;
use crate::traits::{ActiveExecutions, TrackerClient};

/// Run until `cancel` fires. On each tick, list open tickets carrying
/// `pilot-in-progress`; for each whose id is not in `active` and whose
/// last tracker update is older than `threshold`, strip the label and
/// post an explanatory note.
///
/// The caller is responsible for checking `config.enabled` before
/// spawning this loop at all.
pub async fn run(
    tracker: Arc<dyn TrackerClient>,
    selector: String,
    active: Arc<dyn ActiveExecutions>,
    config: StaleCleanupConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = interval.tick() => {
                if let Err(e) = sweep_once(tracker.as_ref(), &selector, active.as_ref(), config.threshold).await {
                    warn!(error = %e, "stale-label cleaner sweep failed; will retry next interval");
                }
            }
        }
    }
}

async fn sweep_once(
    tracker: &dyn TrackerClient,
    selector: &str,
    active: &dyn ActiveExecutions,
    threshold: Duration,
) -> Result<()> {
    let tickets = tracker
        .list_open_tickets(selector)
        .await
        .context("listing tickets for stale-label sweep")?;

    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());
    let now = Utc::now();
    let mut swept = 0usize;

    for ticket in tickets.iter().filter(|t| t.has_label(StatusLabel::InProgress)) {
        if active.is_active(&ticket.id) {
            continue;
        }
        let work_item = tracker.get_work_item(&ticket.id).await?;
        let Some(updated_at) = work_item.updated_at else {
            continue;
        };
        if now - updated_at < threshold {
            continue;
        }

        if let Err(e) = tracker.remove_label(&ticket.id, StatusLabel::InProgress).await {
            warn!(ticket_id = %ticket.id, error = %e, "failed to strip stale in-progress label");
            continue;
        }
        let note = format!(
            "pilot: cleared stale in-progress label (no active execution, last updated {updated_at})"
        );
        if let Err(e) = tracker.post_note(&ticket.id, &note).await {
            warn!(ticket_id = %ticket.id, error = %e, "failed to post stale-cleanup note");
        }
        swept += 1;
    }

    if swept > 0 {
        info!(swept, "stale-label cleaner swept inactive in-progress tickets");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTrackerClient, StaticActiveExecutions};
    use crate::model::{Ticket, TicketId, WorkItem};
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;

    fn in_progress_ticket(id: i64) -> Ticket {
        let mut labels = HashSet::new();
        labels.insert(StatusLabel::InProgress);
        Ticket {
            id: TicketId::from(id),
            created_at: Some(Utc::now()),
            status_labels: labels,
            matches_selector: true,
            summary: format!("ticket {id}"),
        }
    }

    #[tokio::test]
    async fn sweeps_inactive_stale_ticket() {
        let tracker = MockTrackerClient::new();
        tracker.set_tickets(vec![in_progress_ticket(1)]);
        tracker.set_work_item(
            TicketId::from(1i64),
            WorkItem { updated_at: Some(Utc::now() - ChronoDuration::hours(3)), ..Default::default() },
        );
        let active = StaticActiveExecutions::new([]);

        sweep_once(&tracker, "pilot", &active, Duration::from_secs(3600)).await.unwrap();

        let labels = tracker.label_calls();
        assert!(labels.iter().any(|(id, l, add)| *id == TicketId::from(1i64) && *l == StatusLabel::InProgress && !add));
        assert_eq!(tracker.notes().len(), 1);
    }

    #[tokio::test]
    async fn does_not_sweep_active_ticket() {
        let tracker = MockTrackerClient::new();
        tracker.set_tickets(vec![in_progress_ticket(1)]);
        tracker.set_work_item(
            TicketId::from(1i64),
            WorkItem { updated_at: Some(Utc::now() - ChronoDuration::hours(3)), ..Default::default() },
        );
        let active = StaticActiveExecutions::new([TicketId::from(1i64)]);

        sweep_once(&tracker, "pilot", &active, Duration::from_secs(3600)).await.unwrap();

        assert!(tracker.label_calls().is_empty());
    }

    #[tokio::test]
    async fn does_not_sweep_recently_updated_ticket() {
        let tracker = MockTrackerClient::new();
        tracker.set_tickets(vec![in_progress_ticket(1)]);
        tracker.set_work_item(
            TicketId::from(1i64),
            WorkItem { updated_at: Some(Utc::now()), ..Default::default() },
        );
        let active = StaticActiveExecutions::new([]);

        sweep_once(&tracker, "pilot", &active, Duration::from_secs(3600)).await.unwrap();

        assert!(tracker.label_calls().is_empty());
    }
}
