//! Meeting filters
//!
//! Decides whether a discovered meeting becomes work. Order matters:
//! completion first (temporary), then duration, exclusions, and the pilot
//! gate (permanent). Temporary skips are not persisted; the poller will
//! see the meeting again next tick.

use crate::config::AppSettings;
use crate::db::{Database, DbResult};
use chrono::{DateTime, Duration, Utc};

/// Buffer after the actual end (call record present) for transcript
/// generation.
const ACTUAL_END_BUFFER_MINUTES: i64 = 5;

/// Fallback buffer after the scheduled end when no call record exists yet.
const SCHEDULED_END_BUFFER_MINUTES: i64 = 15;

/// A meeting as the discovery path sees it, before persistence.
#[derive(Debug, Clone, Default)]
pub struct MeetingCandidate {
    pub meeting_id: String,
    pub subject: String,
    pub organizer_email: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_minutes: i64,
    pub participant_emails: Vec<String>,
    pub join_url: Option<String>,
    /// Set when a call record exists, making end_time the actual end.
    pub has_call_record: bool,
}

/// Outcome of filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Passed all filters; persist and enqueue.
    Process,
    /// Not over yet; do not persist, reconsider next tick.
    Waiting(String),
    /// Permanently rejected; persist with skipped status.
    Rejected(String),
}

pub struct MeetingFilter {
    db: Database,
}

impl MeetingFilter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn should_process(
        &self,
        candidate: &MeetingCandidate,
        settings: &AppSettings,
        now: DateTime<Utc>,
    ) -> DbResult<FilterDecision> {
        if let Some(reason) = completion_wait_reason(candidate, now) {
            return Ok(FilterDecision::Waiting(reason));
        }

        if candidate.duration_minutes < settings.minimum_meeting_duration_minutes {
            return Ok(FilterDecision::Rejected(format!(
                "Duration too short ({} min < {} min)",
                candidate.duration_minutes, settings.minimum_meeting_duration_minutes
            )));
        }

        if let Some(reason) = self.exclusion_reason(candidate)? {
            return Ok(FilterDecision::Rejected(reason));
        }

        if settings.pilot_mode_enabled {
            let mut has_pilot = false;
            for email in &candidate.participant_emails {
                if self.db.is_pilot_user(email)? {
                    has_pilot = true;
                    break;
                }
            }
            if !has_pilot {
                return Ok(FilterDecision::Rejected(
                    "No pilot users in meeting".to_string(),
                ));
            }
        }

        Ok(FilterDecision::Process)
    }

    /// First matching active exclusion rule, if any. Matches are
    /// case-insensitive.
    fn exclusion_reason(&self, candidate: &MeetingCandidate) -> DbResult<Option<String>> {
        let exclusions = self.db.active_exclusions()?;
        let organizer = candidate
            .organizer_email
            .as_deref()
            .unwrap_or("")
            .to_lowercase();

        for exclusion in &exclusions {
            let value = exclusion.value.to_lowercase();
            let reason = exclusion.reason.clone().unwrap_or_default();
            match exclusion.kind.as_str() {
                "organizer" => {
                    if !organizer.is_empty() && organizer == value {
                        return Ok(Some(format!("Organizer excluded: {reason}")));
                    }
                }
                "user" => {
                    for email in &candidate.participant_emails {
                        if email.to_lowercase() == value {
                            return Ok(Some(format!("Participant excluded: {reason}")));
                        }
                    }
                }
                "domain" => {
                    if domain_of(&organizer) == Some(value.as_str()) {
                        return Ok(Some(format!("Organizer domain excluded: {reason}")));
                    }
                    for email in &candidate.participant_emails {
                        let lowered = email.to_lowercase();
                        if domain_of(&lowered) == Some(value.as_str()) {
                            return Ok(Some(format!("Participant domain excluded: {reason}")));
                        }
                    }
                }
                other => tracing::warn!(kind = other, "Unknown exclusion type"),
            }
        }
        Ok(None)
    }
}

/// Why the meeting is not yet eligible, or None when it is over.
///
/// A call record makes end_time the actual end, so a short buffer is
/// enough; otherwise wait out the scheduled end plus the fallback buffer.
fn completion_wait_reason(candidate: &MeetingCandidate, now: DateTime<Utc>) -> Option<String> {
    let Some(end_time) = candidate.end_time else {
        return Some("No end time available yet".to_string());
    };

    if candidate.has_call_record {
        let ready_at = end_time + Duration::minutes(ACTUAL_END_BUFFER_MINUTES);
        if now < ready_at {
            let minutes = (ready_at - now).num_minutes() + 1;
            return Some(format!(
                "Meeting ended, waiting {minutes} more min for transcript generation"
            ));
        }
        return None;
    }

    if now < end_time {
        let minutes = (end_time - now).num_minutes() + 1;
        return Some(format!("Meeting not yet at scheduled end ({minutes} more min)"));
    }

    let ready_at = end_time + Duration::minutes(SCHEDULED_END_BUFFER_MINUTES);
    if now < ready_at {
        let minutes = (ready_at - now).num_minutes() + 1;
        return Some(format!(
            "Waiting {minutes} more min after scheduled end (no call record yet)"
        ));
    }
    None
}

fn domain_of(email: &str) -> Option<&str> {
    email.split_once('@').map(|(_, domain)| domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(end_minutes_ago: i64, duration: i64) -> MeetingCandidate {
        let end = Utc::now() - Duration::minutes(end_minutes_ago);
        MeetingCandidate {
            meeting_id: "MTG-A".to_string(),
            subject: "Sync".to_string(),
            organizer_email: Some("org@example.com".to_string()),
            start_time: Some(end - Duration::minutes(duration)),
            end_time: Some(end),
            duration_minutes: duration,
            participant_emails: vec!["org@example.com".to_string(), "p@example.com".to_string()],
            ..Default::default()
        }
    }

    fn settings() -> AppSettings {
        AppSettings {
            pilot_mode_enabled: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_completion_windows() {
        let now = Utc::now();

        // with call record: ready 5 min after actual end
        let mut c = candidate(3, 30);
        c.has_call_record = true;
        assert!(completion_wait_reason(&c, now).is_some());
        let mut c = candidate(6, 30);
        c.has_call_record = true;
        assert!(completion_wait_reason(&c, now).is_none());

        // without call record: 15 min after scheduled end
        let c = candidate(10, 30);
        assert!(completion_wait_reason(&c, now).is_some());
        let c = candidate(16, 30);
        assert!(completion_wait_reason(&c, now).is_none());

        // still in progress
        let c = candidate(-10, 30);
        assert!(completion_wait_reason(&c, now)
            .unwrap()
            .contains("not yet at scheduled end"));

        // no end time at all
        let mut c = candidate(0, 30);
        c.end_time = None;
        assert!(completion_wait_reason(&c, now).is_some());
    }

    #[test]
    fn test_waiting_is_temporary_rejected_is_permanent() {
        let db = Database::open_in_memory().unwrap();
        let filter = MeetingFilter::new(db);
        let now = Utc::now();

        let c = candidate(1, 30);
        assert!(matches!(
            filter.should_process(&c, &settings(), now).unwrap(),
            FilterDecision::Waiting(_)
        ));

        let c = candidate(20, 2);
        match filter.should_process(&c, &settings(), now).unwrap() {
            FilterDecision::Rejected(reason) => {
                assert!(reason.contains("Duration too short (2 min < 5 min)"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_exclusion_types() {
        let db = Database::open_in_memory().unwrap();
        db.add_exclusion("organizer", "Org@Example.com", Some("leadership request"))
            .unwrap();
        db.add_exclusion("user", "blocked@example.com", Some("opted out"))
            .unwrap();
        db.add_exclusion("domain", "contractor.net", Some("external org"))
            .unwrap();
        let filter = MeetingFilter::new(db);
        let now = Utc::now();

        // organizer match is case-insensitive
        let c = candidate(20, 30);
        match filter.should_process(&c, &settings(), now).unwrap() {
            FilterDecision::Rejected(reason) => {
                assert!(reason.contains("Organizer excluded: leadership request"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        // participant match
        let mut c = candidate(20, 30);
        c.organizer_email = Some("ok@example.com".to_string());
        c.participant_emails = vec!["Blocked@Example.com".to_string()];
        match filter.should_process(&c, &settings(), now).unwrap() {
            FilterDecision::Rejected(reason) => {
                assert!(reason.contains("Participant excluded"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        // domain match on a participant
        let mut c = candidate(20, 30);
        c.organizer_email = Some("ok@example.com".to_string());
        c.participant_emails = vec!["someone@contractor.net".to_string()];
        match filter.should_process(&c, &settings(), now).unwrap() {
            FilterDecision::Rejected(reason) => {
                assert!(reason.contains("domain excluded"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        // clean meeting passes
        let mut c = candidate(20, 30);
        c.organizer_email = Some("ok@example.com".to_string());
        c.participant_emails = vec!["fine@example.com".to_string()];
        assert_eq!(
            filter.should_process(&c, &settings(), now).unwrap(),
            FilterDecision::Process
        );
    }

    #[test]
    fn test_pilot_mode_gate() {
        let db = Database::open_in_memory().unwrap();
        db.add_pilot_user("pilot@example.com", None).unwrap();
        let filter = MeetingFilter::new(db);
        let now = Utc::now();
        let pilot_settings = AppSettings {
            pilot_mode_enabled: true,
            ..Default::default()
        };

        let mut c = candidate(20, 30);
        c.participant_emails = vec!["other@example.com".to_string()];
        assert!(matches!(
            filter.should_process(&c, &pilot_settings, now).unwrap(),
            FilterDecision::Rejected(_)
        ));

        c.participant_emails.push("Pilot@Example.com".to_string());
        assert_eq!(
            filter.should_process(&c, &pilot_settings, now).unwrap(),
            FilterDecision::Process
        );
    }
}
