//! Meeting poller
//!
//! Fallback discovery: every few minutes, query the pilot users' calendars
//! for the lookback window and feed eligible meetings into the queue.
//! Temporarily-ineligible meetings are left unpersisted so the next tick
//! reconsiders them.

use crate::config::Config;
use crate::db::{Database, MeetingStatus, NewMeeting};
use crate::discovery::filters::{FilterDecision, MeetingCandidate, MeetingFilter};
use crate::graph::{calendar, GraphClient};
use crate::jobs::queue::JobQueue;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DISCOVERY_PRIORITY: i64 = 5;

#[derive(Debug, Default, Clone)]
pub struct DiscoveryStats {
    pub discovered: u64,
    pub new: u64,
    pub queued: u64,
    pub skipped: u64,
    pub errors: u64,
}

pub struct MeetingPoller {
    db: Database,
    graph: GraphClient,
    queue: JobQueue,
    filter: MeetingFilter,
    config: Arc<Config>,
    running: Arc<AtomicBool>,
}

impl MeetingPoller {
    pub fn new(db: Database, graph: GraphClient, queue: JobQueue, config: Arc<Config>) -> Self {
        let filter = MeetingFilter::new(db.clone());
        Self {
            db,
            graph,
            queue,
            filter,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One discovery cycle over all active pilot users' calendars.
    pub async fn run_discovery(&self, dry_run: bool) -> DiscoveryStats {
        let settings = self.config.settings();
        let mut stats = DiscoveryStats::default();

        let pilot_users = match self.db.active_pilot_users() {
            Ok(users) => users,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load pilot users");
                stats.errors += 1;
                return stats;
            }
        };
        if pilot_users.is_empty() {
            tracing::warn!("No active pilot users, nothing to discover");
            return stats;
        }

        let now = Utc::now();
        let window_start = now - Duration::hours(settings.lookback_hours);
        tracing::info!(
            users = pilot_users.len(),
            lookback_hours = settings.lookback_hours,
            "Starting discovery cycle"
        );

        let mut seen = HashSet::new();
        for user in &pilot_users {
            let events =
                match calendar::online_meetings_in_window(&self.graph, user, window_start, now)
                    .await
                {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::error!(user, error = %e, "Calendar query failed");
                        stats.errors += 1;
                        continue;
                    }
                };

            for event in &events {
                let Some(candidate) = event_to_candidate(event) else {
                    continue;
                };
                if !seen.insert(candidate.meeting_id.clone()) {
                    continue;
                }
                stats.discovered += 1;

                match self.consider(&candidate, &settings, now, dry_run) {
                    Ok(considered) => {
                        if considered.queued {
                            stats.queued += 1;
                            stats.new += 1;
                        } else {
                            stats.skipped += 1;
                        }
                    }
                    Err(e) => {
                        tracing::error!(meeting = candidate.meeting_id, error = %e, "Discovery error");
                        stats.errors += 1;
                    }
                }
            }
        }

        tracing::info!(
            discovered = stats.discovered,
            new = stats.new,
            queued = stats.queued,
            skipped = stats.skipped,
            errors = stats.errors,
            "Discovery cycle complete"
        );
        stats
    }

    fn consider(
        &self,
        candidate: &MeetingCandidate,
        settings: &crate::config::AppSettings,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Considered, Box<dyn std::error::Error + Send + Sync>> {
        if self
            .db
            .find_meeting_by_provider_id(&candidate.meeting_id)?
            .is_some()
        {
            tracing::debug!(meeting = candidate.meeting_id, "Meeting already known");
            return Ok(Considered { queued: false });
        }

        match self.filter.should_process(candidate, settings, now)? {
            FilterDecision::Waiting(reason) => {
                tracing::info!(meeting = candidate.meeting_id, reason, "Skipping for now");
                Ok(Considered { queued: false })
            }
            FilterDecision::Rejected(reason) => {
                tracing::info!(meeting = candidate.meeting_id, reason, "Meeting rejected");
                if !dry_run {
                    self.persist(candidate, MeetingStatus::Skipped)?;
                }
                Ok(Considered { queued: false })
            }
            FilterDecision::Process => {
                if dry_run {
                    tracing::info!(meeting = candidate.meeting_id, "[dry run] would queue");
                    return Ok(Considered { queued: true });
                }
                let meeting_id = self.persist(candidate, MeetingStatus::Discovered)?;
                self.queue
                    .enqueue_meeting_chain(meeting_id, DISCOVERY_PRIORITY)?;
                tracing::info!(
                    meeting = candidate.meeting_id,
                    meeting_id,
                    "✓ Queued meeting"
                );
                Ok(Considered { queued: true })
            }
        }
    }

    fn persist(
        &self,
        candidate: &MeetingCandidate,
        status: MeetingStatus,
    ) -> Result<i64, crate::db::DbError> {
        let meeting_id = self.db.insert_meeting(&NewMeeting {
            meeting_id: candidate.meeting_id.clone(),
            subject: candidate.subject.clone(),
            organizer_email: candidate.organizer_email.clone(),
            start_time: candidate.start_time,
            end_time: candidate.end_time,
            duration_minutes: Some(candidate.duration_minutes),
            participant_count: candidate.participant_emails.len() as i64,
            join_url: candidate.join_url.clone(),
            status: Some(status),
            discovery_source: Some("poller".to_string()),
            ..Default::default()
        })?;

        for email in &candidate.participant_emails {
            let role = if Some(email.as_str()) == candidate.organizer_email.as_deref() {
                "organizer"
            } else {
                "attendee"
            };
            self.db
                .add_participant(meeting_id, Some(email.as_str()), email, role, true)?;
        }
        Ok(meeting_id)
    }

    /// Continuous polling loop.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        loop {
            // settings are hot-reloadable between ticks
            if let Err(e) = self.config.reload() {
                tracing::warn!(error = %e, "Config reload failed, keeping previous settings");
            }
            let interval_minutes = self.config.settings().polling_interval_minutes;
            self.run_discovery(false).await;

            tracing::info!(interval_minutes, "Sleeping until next poll");
            tokio::time::sleep(std::time::Duration::from_secs(interval_minutes * 60)).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
        }
        tracing::info!("Poller stopped");
    }
}

struct Considered {
    queued: bool,
}

/// Map a calendar event into a discovery candidate. Returns None when the
/// event has no usable meeting identity.
pub fn event_to_candidate(event: &Value) -> Option<MeetingCandidate> {
    let join_url = event
        .get("onlineMeeting")
        .and_then(|m| m.get("joinUrl"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let meeting_id = join_url
        .clone()
        .or_else(|| event.get("iCalUId").and_then(|v| v.as_str()).map(String::from))
        .or_else(|| event.get("id").and_then(|v| v.as_str()).map(String::from))?;

    let start_time = parse_event_time(event.get("start"));
    let end_time = parse_event_time(event.get("end"));
    let duration_minutes = match (start_time, end_time) {
        (Some(start), Some(end)) => (end - start).num_minutes(),
        _ => 0,
    };

    let organizer_email = event
        .get("organizer")
        .and_then(|o| o.get("emailAddress"))
        .and_then(|e| e.get("address"))
        .and_then(|v| v.as_str())
        .map(str::to_lowercase);

    let mut participant_emails: Vec<String> = event
        .get("attendees")
        .and_then(|a| a.as_array())
        .map(|attendees| {
            attendees
                .iter()
                .filter_map(|a| {
                    a.get("emailAddress")
                        .and_then(|e| e.get("address"))
                        .and_then(|v| v.as_str())
                        .map(str::to_lowercase)
                })
                .collect()
        })
        .unwrap_or_default();
    if let Some(organizer) = &organizer_email {
        if !participant_emails.contains(organizer) {
            participant_emails.insert(0, organizer.clone());
        }
    }

    Some(MeetingCandidate {
        meeting_id,
        subject: event
            .get("subject")
            .and_then(|v| v.as_str())
            .unwrap_or("Untitled Meeting")
            .to_string(),
        organizer_email,
        start_time,
        end_time,
        duration_minutes,
        participant_emails,
        join_url,
        has_call_record: false,
    })
}

/// Graph calendar times come as a naive dateTime plus a timeZone field;
/// the query requests UTC.
fn parse_event_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let text = value?.get("dateTime")?.as_str()?;
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_fixture() -> Value {
        json!({
            "id": "evt-1",
            "iCalUId": "ical-1",
            "subject": "Quarterly Review",
            "isOnlineMeeting": true,
            "onlineMeeting": { "joinUrl": "https://teams.example.com/join/q3" },
            "organizer": { "emailAddress": { "address": "Org@Example.com" } },
            "start": { "dateTime": "2026-08-01T10:00:00.0000000", "timeZone": "UTC" },
            "end": { "dateTime": "2026-08-01T10:45:00.0000000", "timeZone": "UTC" },
            "attendees": [
                { "emailAddress": { "address": "a@example.com" } },
                { "emailAddress": { "address": "b@example.com" } }
            ]
        })
    }

    #[test]
    fn test_event_to_candidate_mapping() {
        let candidate = event_to_candidate(&event_fixture()).unwrap();
        assert_eq!(candidate.meeting_id, "https://teams.example.com/join/q3");
        assert_eq!(candidate.subject, "Quarterly Review");
        assert_eq!(candidate.organizer_email.as_deref(), Some("org@example.com"));
        assert_eq!(candidate.duration_minutes, 45);
        // organizer is prepended to participants
        assert_eq!(
            candidate.participant_emails,
            vec!["org@example.com", "a@example.com", "b@example.com"]
        );
    }

    #[test]
    fn test_event_without_join_url_falls_back_to_ids() {
        let mut event = event_fixture();
        event.as_object_mut().unwrap().remove("onlineMeeting");
        let candidate = event_to_candidate(&event).unwrap();
        assert_eq!(candidate.meeting_id, "ical-1");
        assert!(candidate.join_url.is_none());
    }

    #[test]
    fn test_event_without_identity_is_dropped() {
        let event = json!({ "subject": "No ids" });
        assert!(event_to_candidate(&event).is_none());
    }

    #[test]
    fn test_parse_event_time() {
        let value = json!({ "dateTime": "2026-08-01T10:00:00.0000000", "timeZone": "UTC" });
        let parsed = parse_event_time(Some(&value)).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-08-01T10:00:00+00:00");

        // seconds without fraction also parse
        let value = json!({ "dateTime": "2026-08-01T10:00:00" });
        assert!(parse_event_time(Some(&value)).is_some());
        assert!(parse_event_time(None).is_none());
    }
}
