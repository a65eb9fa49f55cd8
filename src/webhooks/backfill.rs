//! Backfill
//!
//! Catch-up path that fills the gap between the last seen webhook and now.
//! Every record runs through the same ingestion path as the notification
//! handler, so re-running a window is safe.

use crate::db::{BackfillStats, Database, IngestSource};
use crate::graph::{call_records, GraphClient, GraphError};
use crate::webhooks::handler::NotificationHandler;
use chrono::{DateTime, Duration, Utc};

/// Safety margin subtracted from the last webhook timestamp so a record
/// that raced the outage is still revisited.
const GAP_MARGIN_MINUTES: i64 = 5;

pub struct Backfill {
    db: Database,
    graph: GraphClient,
    handler: NotificationHandler,
}

impl Backfill {
    pub fn new(db: Database, graph: GraphClient, handler: NotificationHandler) -> Self {
        Self { db, graph, handler }
    }

    /// The cutoff is the EARLIER of the explicit lookback and the
    /// gap-detection point, so a manually requested deep backfill is never
    /// narrowed by gap detection.
    pub fn select_cutoff(
        lookback_hours: i64,
        last_webhook: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let lookback_cutoff = now - Duration::hours(lookback_hours);
        match last_webhook {
            Some(processed_at) => {
                let gap_cutoff = processed_at - Duration::minutes(GAP_MARGIN_MINUTES);
                if lookback_cutoff < gap_cutoff {
                    tracing::info!(lookback_hours, "Using requested lookback (further back than gap)");
                    lookback_cutoff
                } else {
                    let hours_gap = (now - processed_at).num_minutes() as f64 / 60.0;
                    tracing::info!(hours_gap, "Using gap detection since last webhook");
                    gap_cutoff
                }
            }
            None => {
                tracing::info!(lookback_hours, "No webhooks seen yet, using requested lookback");
                lookback_cutoff
            }
        }
    }

    /// Manually requested backfill.
    pub async fn run(&self, lookback_hours: i64) -> Result<BackfillStats, GraphError> {
        self.run_with_source(lookback_hours, IngestSource::Backfill)
            .await
    }

    /// Walk all call records since the cutoff and ingest the unseen ones.
    /// Persists a run summary row and returns the statistics. The source
    /// marker distinguishes manual backfills from the startup safety net.
    pub async fn run_with_source(
        &self,
        lookback_hours: i64,
        source: IngestSource,
    ) -> Result<BackfillStats, GraphError> {
        let started_at = Utc::now();
        let last_webhook = self.last_webhook_timestamp()?;
        let cutoff = Self::select_cutoff(lookback_hours, last_webhook, started_at);

        tracing::info!(%cutoff, "Querying call records for backfill");
        let records = call_records::list_call_records_since(&self.graph, cutoff).await?;

        let mut stats = BackfillStats {
            call_records_found: records.len() as u64,
            ..Default::default()
        };

        for record in &records {
            let Some(call_record_id) = record.get("id").and_then(|v| v.as_str()) else {
                stats.errors += 1;
                continue;
            };

            match self.db.is_call_record_processed(call_record_id) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(call_record_id, error = %e, "Dedup check failed");
                    stats.errors += 1;
                    continue;
                }
            }

            let result = self
                .handler
                .process_call_record(call_record_id, source)
                .await;
            match result.get("status").and_then(|v| v.as_str()) {
                Some("processed") => {
                    stats.meetings_created += 1;
                    stats.jobs_created += 1;
                }
                Some("skipped") => stats.skipped_no_optin += 1,
                // expected dedup against a live chain, not an error
                Some("job_exists" | "duplicate") => {}
                _ => stats.errors += 1,
            }
        }

        tracing::info!(
            records = stats.call_records_found,
            meetings = stats.meetings_created,
            skipped = stats.skipped_no_optin,
            errors = stats.errors,
            "Backfill complete"
        );

        if let Err(e) = self
            .db
            .record_backfill_run(lookback_hours, cutoff, started_at, &stats)
        {
            tracing::error!(error = %e, "Failed to persist backfill run");
        }

        Ok(stats)
    }

    fn last_webhook_timestamp(&self) -> Result<Option<DateTime<Utc>>, GraphError> {
        self.db
            .last_webhook_processed_at()
            .map_err(|e| GraphError::Decode(format!("Store unavailable: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoff_no_webhook_uses_lookback() {
        let now = Utc::now();
        let cutoff = Backfill::select_cutoff(24, None, now);
        assert_eq!(cutoff, now - Duration::hours(24));
    }

    #[test]
    fn test_cutoff_gap_detection_wins_when_recent() {
        // last webhook 10 hours ago, requested lookback only 2 hours:
        // the gap point (10h - 5min margin) reaches further back
        let now = Utc::now();
        let last = now - Duration::hours(10);
        let cutoff = Backfill::select_cutoff(2, Some(last), now);
        assert_eq!(cutoff, last - Duration::minutes(5));
    }

    #[test]
    fn test_cutoff_deep_lookback_not_narrowed() {
        // manual 24h backfill with a webhook 1 hour ago: the explicit
        // lookback reaches further back and must win
        let now = Utc::now();
        let last = now - Duration::hours(1);
        let cutoff = Backfill::select_cutoff(24, Some(last), now);
        assert_eq!(cutoff, now - Duration::hours(24));
    }

    #[test]
    fn test_cutoff_margin_applied() {
        let now = Utc::now();
        let last = now - Duration::minutes(30);
        let cutoff = Backfill::select_cutoff(48, Some(last), now);
        // 48h lookback is far earlier than the 35-minute gap point
        assert_eq!(cutoff, now - Duration::hours(48));

        let cutoff = Backfill::select_cutoff(0, Some(last), now);
        // zero lookback: gap detection supplies the margin
        assert_eq!(cutoff, last - Duration::minutes(5));
    }
}
