//! Notification handler
//!
//! Classifies change notifications, dedupes them, persists meetings, and
//! enqueues fetch_transcript work. Transcript-ready notifications are the
//! preferred signal: they fire exactly when content is fetchable, so their
//! jobs skip time-based matching and run at higher priority.

use crate::db::{Database, IngestSource, MeetingStatus, NewMeeting};
use crate::graph::{call_records, users, GraphClient};
use crate::jobs::queue::JobQueue;
use crate::prefs::PreferenceManager;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

/// Priority for jobs created from transcript-ready notifications.
const TRANSCRIPT_READY_PRIORITY: i64 = 10;
/// Priority for jobs created from call-record notifications.
const CALL_RECORD_PRIORITY: i64 = 5;

fn user_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"users\(['"]?([^'"()]+)['"]?\)"#).unwrap())
}

fn transcript_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Matches both path styles:
    //   communications/onlineMeetings/{mid}/transcripts/{tid}
    //   users('{uid}')/onlineMeetings('{mid}')/transcripts('{tid}')
    RE.get_or_init(|| {
        Regex::new(
            r#"onlineMeetings(?:/|\(['"]?)([^/'"()]+)(?:['"]?\))?/transcripts(?:/|\(['"]?)([^/'"()]+)"#,
        )
        .unwrap()
    })
}

/// Identity categories found in call record sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantKind {
    Internal,
    Pstn,
    Guest,
    External,
}

/// A participant pulled out of call record sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedParticipant {
    pub email: Option<String>,
    pub name: String,
    pub phone: Option<String>,
    pub user_id: Option<String>,
    pub kind: ParticipantKind,
}

impl ExtractedParticipant {
    /// Display name as stored: PSTN entries carry the number, external
    /// identities get tagged.
    pub fn decorated_name(&self) -> String {
        match self.kind {
            ParticipantKind::Pstn => match &self.phone {
                Some(phone) if self.name != "Phone Participant" && !self.name.is_empty() => {
                    format!("{} ({phone})", self.name)
                }
                Some(phone) => format!("Phone {phone}"),
                None => self.name.clone(),
            },
            ParticipantKind::Guest | ParticipantKind::External => {
                if self.name.ends_with("(External)") {
                    self.name.clone()
                } else {
                    format!("{} (External)", self.name)
                }
            }
            ParticipantKind::Internal => self.name.clone(),
        }
    }
}

/// Walk caller/callee identities across all sessions and classify them.
/// Pure extraction: internal users may still be missing an email here.
pub fn extract_identities(call_record: &Value) -> Vec<ExtractedParticipant> {
    let mut participants = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let sessions = call_record
        .get("sessions")
        .and_then(|s| s.as_array())
        .cloned()
        .unwrap_or_default();

    for session in &sessions {
        for endpoint in ["caller", "callee"] {
            let identity = session
                .get(endpoint)
                .and_then(|e| e.get("identity"))
                .cloned()
                .unwrap_or(Value::Null);

            if let Some(user) = identity.get("user") {
                let Some(user_id) = user.get("id").and_then(|v| v.as_str()) else {
                    continue;
                };
                if !seen.insert(user_id.to_string()) {
                    continue;
                }
                participants.push(ExtractedParticipant {
                    email: user
                        .get("userPrincipalName")
                        .and_then(|v| v.as_str())
                        .map(str::to_lowercase),
                    name: user
                        .get("displayName")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Unknown")
                        .to_string(),
                    phone: None,
                    user_id: Some(user_id.to_string()),
                    kind: ParticipantKind::Internal,
                });
                continue;
            }

            if let Some(phone) = identity.get("phone") {
                let phone_id = phone.get("id").and_then(|v| v.as_str()).unwrap_or("");
                let display = phone
                    .get("displayName")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let key = if phone_id.is_empty() { display } else { phone_id };
                if key.is_empty() || !seen.insert(key.to_string()) {
                    continue;
                }
                participants.push(ExtractedParticipant {
                    email: None,
                    name: if display.is_empty() {
                        "Phone Participant".to_string()
                    } else {
                        display.to_string()
                    },
                    phone: Some(phone_id.to_string()),
                    user_id: None,
                    kind: ParticipantKind::Pstn,
                });
                continue;
            }

            if let Some(guest) = identity.get("guest") {
                let Some(guest_id) = guest.get("id").and_then(|v| v.as_str()) else {
                    continue;
                };
                if !seen.insert(guest_id.to_string()) {
                    continue;
                }
                participants.push(ExtractedParticipant {
                    email: guest
                        .get("email")
                        .and_then(|v| v.as_str())
                        .filter(|e| !e.is_empty())
                        .map(str::to_lowercase),
                    name: guest
                        .get("displayName")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Guest")
                        .to_string(),
                    phone: None,
                    user_id: None,
                    kind: ParticipantKind::Guest,
                });
                continue;
            }

            if let Some(acs) = identity.get("acsUser") {
                let Some(acs_id) = acs.get("id").and_then(|v| v.as_str()) else {
                    continue;
                };
                if !seen.insert(acs_id.to_string()) {
                    continue;
                }
                participants.push(ExtractedParticipant {
                    email: None,
                    name: acs
                        .get("displayName")
                        .and_then(|v| v.as_str())
                        .unwrap_or("External Participant")
                        .to_string(),
                    phone: None,
                    user_id: None,
                    kind: ParticipantKind::External,
                });
            }
        }
    }

    participants
}

/// Handles webhook notifications end to end.
#[derive(Clone)]
pub struct NotificationHandler {
    db: Database,
    queue: JobQueue,
    graph: GraphClient,
    prefs: PreferenceManager,
}

impl NotificationHandler {
    pub fn new(db: Database, queue: JobQueue, graph: GraphClient) -> Self {
        let prefs = PreferenceManager::new(db.clone());
        Self {
            db,
            queue,
            graph,
            prefs,
        }
    }

    /// Entry point for the relay listener: either a single notification or
    /// a `{value: [...]}` batch. Returns a per-notification status payload.
    pub async fn handle_notification(&self, payload: &Value) -> Value {
        if let Some(batch) = payload.get("value").and_then(|v| v.as_array()) {
            tracing::info!(count = batch.len(), "Processing notification batch");
            let mut results = Vec::with_capacity(batch.len());
            for notification in batch {
                results.push(self.process_individual(notification).await);
            }
            json!({
                "status": "batch_processed",
                "count": results.len(),
                "results": results,
            })
        } else {
            self.process_individual(payload).await
        }
    }

    async fn process_individual(&self, notification: &Value) -> Value {
        let change_type = notification
            .get("changeType")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let resource = notification
            .get("resource")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        tracing::info!(change_type, resource, "Processing notification");

        if notification.get("subscriptionId").is_some() && resource.is_empty() {
            return json!({ "status": "validation_acknowledged" });
        }

        if resource.to_lowercase().contains("transcript") {
            return self.process_transcript_notification(notification).await;
        }

        if change_type == "created" && !resource.is_empty() {
            let call_record_id = notification
                .get("resourceData")
                .and_then(|d| d.get("id"))
                .and_then(|v| v.as_str())
                .map(String::from)
                .or_else(|| resource.rsplit('/').next().map(String::from));
            let Some(call_record_id) = call_record_id else {
                return json!({ "status": "error", "reason": "No call record id" });
            };
            return self
                .process_call_record(&call_record_id, IngestSource::Webhook)
                .await;
        }

        json!({ "status": "ignored", "reason": "Unhandled notification type" })
    }

    /// Transcript-ready path: the resource names the exact transcript.
    async fn process_transcript_notification(&self, notification: &Value) -> Value {
        let resource = notification
            .get("resource")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let Some(captures) = transcript_regex().captures(resource) else {
            tracing::warn!(resource, "Could not parse meeting/transcript ids from resource");
            return json!({ "status": "error", "reason": "Invalid resource format" });
        };
        let provider_meeting_id = captures[1].to_string();
        let transcript_id = captures[2].to_string();
        let organizer_user_id = user_regex()
            .captures(resource)
            .map(|c| c[1].to_string());

        tracing::info!(
            meeting = provider_meeting_id,
            transcript = transcript_id,
            organizer = organizer_user_id.as_deref().unwrap_or("unknown"),
            "Transcript ready"
        );

        let db_meeting_id = match self.db.find_meeting_by_provider_id(&provider_meeting_id) {
            Ok(Some(meeting)) => {
                if let Err(e) =
                    self.db
                        .update_meeting_status(meeting.id, MeetingStatus::Queued, None)
                {
                    tracing::error!(error = %e, "Failed to update meeting status");
                }
                if meeting.organizer_user_id.is_none() {
                    if let Some(uid) = &organizer_user_id {
                        self.backfill_organizer(meeting.id, uid).await;
                    }
                }

                // Recurring meetings reuse the meeting id; dedup must be on
                // the (meeting, transcript) pair.
                match self.queue.fetch_job_exists(meeting.id, Some(transcript_id.as_str())) {
                    Ok(true) => {
                        tracing::info!(
                            meeting_id = meeting.id,
                            transcript_id,
                            "Transcript already has a job"
                        );
                        return json!({ "status": "duplicate", "meeting_id": meeting.id });
                    }
                    Ok(false) => {}
                    Err(e) => return json!({ "status": "error", "error": e.to_string() }),
                }
                meeting.id
            }
            Ok(None) => {
                let organizer = match &organizer_user_id {
                    Some(uid) => users::lookup_user(&self.graph, uid).await.ok(),
                    None => None,
                };
                let organizer_email = organizer.as_ref().and_then(|u| u.email.clone());
                let organizer_name = organizer.as_ref().and_then(|u| u.display_name.clone());

                let new_id = match self.db.insert_meeting(&NewMeeting {
                    meeting_id: provider_meeting_id.clone(),
                    // subject is unknown from a transcript notification
                    subject: "Teams Meeting".to_string(),
                    organizer_email: organizer_email.clone(),
                    organizer_name: organizer_name.clone(),
                    organizer_user_id: organizer_user_id.clone(),
                    participant_count: 1,
                    status: Some(MeetingStatus::Queued),
                    discovery_source: Some("webhook".to_string()),
                    ..Default::default()
                }) {
                    Ok(id) => id,
                    Err(e) => return json!({ "status": "error", "error": e.to_string() }),
                };

                if let Some(email) = &organizer_email {
                    let name = organizer_name.clone().unwrap_or_else(|| email.clone());
                    if let Err(e) =
                        self.db
                            .add_participant(new_id, Some(email.as_str()), &name, "organizer", true)
                    {
                        tracing::warn!(error = %e, "Failed to add organizer participant");
                    }
                }
                tracing::info!(meeting_id = new_id, "Created meeting from transcript notification");
                new_id
            }
            Err(e) => return json!({ "status": "error", "error": e.to_string() }),
        };

        let input = json!({
            "meeting_id": db_meeting_id,
            "transcript_id": transcript_id,
        });
        match self
            .queue
            .enqueue_transcript_chain(db_meeting_id, &input, TRANSCRIPT_READY_PRIORITY)
        {
            Ok(job_ids) => {
                tracing::info!(meeting_id = db_meeting_id, ?job_ids, "Enqueued transcript chain");
                json!({
                    "status": "processed",
                    "meeting_id": db_meeting_id,
                    "transcript_id": transcript_id,
                    "job_created": true,
                })
            }
            Err(e) => json!({ "status": "error", "error": e.to_string() }),
        }
    }

    /// Call-record path: fetch the record, gate on opt-in, persist, enqueue.
    /// Shared with backfill via the `source` marker.
    pub async fn process_call_record(&self, call_record_id: &str, source: IngestSource) -> Value {
        match self.db.is_call_record_processed(call_record_id) {
            Ok(true) => {
                tracing::debug!(call_record_id, "Call record already processed");
                return json!({ "status": "duplicate", "call_record_id": call_record_id });
            }
            Ok(false) => {}
            Err(e) => return json!({ "status": "error", "error": e.to_string() }),
        }

        let record = match call_records::fetch_call_record(&self.graph, call_record_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(call_record_id, error = %e, "Failed to fetch call record");
                return json!({ "status": "error", "error": e.to_string() });
            }
        };

        let Some(join_url) = record.get("joinWebUrl").and_then(|v| v.as_str()) else {
            tracing::warn!(call_record_id, "No joinWebUrl in call record");
            return json!({ "status": "skipped", "reason": "No joinWebUrl" });
        };

        let participants = self.resolve_participants(&record).await;

        let opted_in_count = participants
            .iter()
            .filter_map(|p| p.email.as_deref())
            .filter(|email| self.prefs.is_opted_in(email))
            .count();
        if opted_in_count == 0 {
            tracing::info!(join_url, "No opted-in participants for meeting");
            if let Err(e) = self.db.mark_call_record_processed(call_record_id, source) {
                tracing::error!(error = %e, "Failed to mark call record processed");
            }
            return json!({ "status": "skipped", "reason": "No opted-in participants" });
        }

        let organizer = self.resolve_organizer(&record, &participants).await;

        let meeting_id = match self.db.find_meeting_by_provider_id(join_url) {
            Ok(Some(existing)) => {
                if let Some((_, _, Some(uid))) = &organizer {
                    if existing.organizer_user_id.is_none() {
                        if let Err(e) = self.db.backfill_meeting_organizer(
                            existing.id,
                            None,
                            None,
                            Some(uid),
                        ) {
                            tracing::warn!(error = %e, "Failed to backfill organizer");
                        }
                    }
                }
                existing.id
            }
            Ok(None) => {
                let (organizer_email, organizer_name, organizer_user_id) =
                    organizer.clone().unwrap_or((None, None, None));
                let start_time = record
                    .get("startDateTime")
                    .and_then(|v| v.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&chrono::Utc));
                let end_time = record
                    .get("endDateTime")
                    .and_then(|v| v.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&chrono::Utc));

                let new_id = match self.db.insert_meeting(&NewMeeting {
                    meeting_id: join_url.to_string(),
                    subject: record
                        .get("subject")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Unknown Meeting")
                        .to_string(),
                    organizer_email,
                    organizer_name,
                    organizer_user_id,
                    start_time,
                    end_time,
                    participant_count: participants.len() as i64,
                    join_url: Some(join_url.to_string()),
                    chat_id: record
                        .get("chatId")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    status: Some(MeetingStatus::Discovered),
                    discovery_source: Some(source.to_string()),
                    ..Default::default()
                }) {
                    Ok(id) => id,
                    Err(e) => return json!({ "status": "error", "error": e.to_string() }),
                };

                for participant in &participants {
                    if let Err(e) = self.db.add_participant(
                        new_id,
                        participant.email.as_deref(),
                        &participant.decorated_name(),
                        "attendee",
                        true,
                    ) {
                        tracing::warn!(error = %e, "Failed to add participant");
                    }
                }
                tracing::info!(meeting_id = new_id, join_url, "Created meeting from call record");
                new_id
            }
            Err(e) => return json!({ "status": "error", "error": e.to_string() }),
        };

        // A transcript-ready notification may have beaten us here.
        match self.queue.fetch_job_exists(meeting_id, None) {
            Ok(true) => {
                if let Err(e) = self.db.mark_call_record_processed(call_record_id, source) {
                    tracing::error!(error = %e, "Failed to mark call record processed");
                }
                tracing::info!(meeting_id, "fetch_transcript job already exists");
                return json!({
                    "status": "job_exists",
                    "call_record_id": call_record_id,
                    "meeting_id": meeting_id,
                });
            }
            Ok(false) => {}
            Err(e) => return json!({ "status": "error", "error": e.to_string() }),
        }

        if let Err(e) = self.db.mark_call_record_processed(call_record_id, source) {
            return json!({ "status": "error", "error": e.to_string() });
        }

        let input = json!({ "meeting_id": meeting_id });
        // Safety-net finds are fetched but not auto-summarised.
        let enqueued = if source == IngestSource::SafetyNet {
            self.queue
                .enqueue_fetch_only(meeting_id, &input, CALL_RECORD_PRIORITY)
                .map(|id| vec![id])
        } else {
            self.queue
                .enqueue_transcript_chain(meeting_id, &input, CALL_RECORD_PRIORITY)
        };
        match enqueued {
            Ok(job_ids) => {
                tracing::info!(meeting_id, ?job_ids, "Enqueued transcript work");
                json!({
                    "status": "processed",
                    "call_record_id": call_record_id,
                    "meeting_id": meeting_id,
                    "opted_in_count": opted_in_count,
                    "job_created": true,
                })
            }
            Err(e) => json!({ "status": "error", "error": e.to_string() }),
        }
    }

    /// Extract identities, then fill in missing internal emails from the
    /// directory (sessions rarely carry them).
    async fn resolve_participants(&self, record: &Value) -> Vec<ExtractedParticipant> {
        let mut participants = extract_identities(record);
        for participant in &mut participants {
            if participant.kind == ParticipantKind::Internal && participant.email.is_none() {
                if let Some(user_id) = &participant.user_id {
                    match users::lookup_user(&self.graph, user_id).await {
                        Ok(user) => {
                            participant.email = user.email;
                            if participant.name == "Unknown" {
                                if let Some(name) = user.display_name {
                                    participant.name = name;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(user_id, error = %e, "Could not look up user");
                        }
                    }
                }
            }
        }
        participants
    }

    /// Organizer from the record, falling back to the first participant.
    /// Returns (email, name, user_id).
    #[allow(clippy::type_complexity)]
    async fn resolve_organizer(
        &self,
        record: &Value,
        participants: &[ExtractedParticipant],
    ) -> Option<(Option<String>, Option<String>, Option<String>)> {
        let organizer_user = record
            .get("organizer")
            .and_then(|o| o.get("user"))
            .cloned()
            .unwrap_or(Value::Null);

        let mut user_id = organizer_user
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from);
        let mut name = organizer_user
            .get("displayName")
            .and_then(|v| v.as_str())
            .map(String::from);
        let mut email = None;

        if user_id.is_none() {
            let first = participants.first()?;
            user_id = first.user_id.clone();
            email = first.email.clone();
            name = Some(first.name.clone());
        }

        if email.is_none() {
            if let Some(uid) = &user_id {
                if let Ok(user) = users::lookup_user(&self.graph, uid).await {
                    email = user.email;
                    if name.is_none() {
                        name = user.display_name;
                    }
                }
            }
        }

        Some((email, name, user_id))
    }

    async fn backfill_organizer(&self, meeting_id: i64, organizer_user_id: &str) {
        match users::lookup_user(&self.graph, organizer_user_id).await {
            Ok(user) => {
                if let Err(e) = self.db.backfill_meeting_organizer(
                    meeting_id,
                    user.email.as_deref(),
                    user.display_name.as_deref(),
                    Some(user.id.as_str()),
                ) {
                    tracing::warn!(meeting_id, error = %e, "Failed to backfill organizer");
                }
            }
            Err(e) => {
                tracing::warn!(organizer_user_id, error = %e, "Could not fetch organizer details");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_regex_encoded_form() {
        let resource = "users('abc-123')/onlineMeetings('MSo1N2Y0')/transcripts('dHJhbnNjcmlwdA==')";
        let captures = transcript_regex().captures(resource).unwrap();
        assert_eq!(&captures[1], "MSo1N2Y0");
        assert_eq!(&captures[2], "dHJhbnNjcmlwdA==");

        let user = user_regex().captures(resource).unwrap();
        assert_eq!(&user[1], "abc-123");
    }

    #[test]
    fn test_transcript_regex_slash_form() {
        let resource = "communications/onlineMeetings/MTG-9/transcripts/T-7";
        let captures = transcript_regex().captures(resource).unwrap();
        assert_eq!(&captures[1], "MTG-9");
        assert_eq!(&captures[2], "T-7");
        assert!(user_regex().captures(resource).is_none());
    }

    #[test]
    fn test_transcript_regex_rejects_garbage() {
        assert!(transcript_regex().captures("/communications/callRecords/abc").is_none());
    }

    fn call_record_fixture() -> Value {
        json!({
            "id": "CR-1",
            "joinWebUrl": "https://teams.example.com/join/abc",
            "sessions": [
                {
                    "caller": { "identity": { "user": {
                        "id": "guid-alice", "displayName": "Alice Johnson"
                    }}},
                    "callee": { "identity": { "phone": {
                        "id": "+15551234567", "displayName": ""
                    }}}
                },
                {
                    "caller": { "identity": { "user": {
                        "id": "guid-alice", "displayName": "Alice Johnson"
                    }}},
                    "callee": { "identity": { "guest": {
                        "id": "guest-1", "displayName": "Visiting Vendor", "email": "V@Partner.com"
                    }}}
                },
                {
                    "caller": { "identity": { "acsUser": {
                        "id": "acs-1", "displayName": "Kiosk"
                    }}},
                    "callee": { "identity": { "user": {
                        "id": "guid-bob", "displayName": "Bob Lee",
                        "userPrincipalName": "Bob.Lee@Example.com"
                    }}}
                }
            ]
        })
    }

    #[test]
    fn test_extract_identities_categories_and_dedup() {
        let participants = extract_identities(&call_record_fixture());
        assert_eq!(participants.len(), 5);

        let internal: Vec<_> = participants
            .iter()
            .filter(|p| p.kind == ParticipantKind::Internal)
            .collect();
        // Alice appears in two sessions but is extracted once
        assert_eq!(internal.len(), 2);
        assert_eq!(internal[0].user_id.as_deref(), Some("guid-alice"));
        assert_eq!(internal[0].email, None);
        assert_eq!(internal[1].email.as_deref(), Some("bob.lee@example.com"));

        let pstn: Vec<_> = participants
            .iter()
            .filter(|p| p.kind == ParticipantKind::Pstn)
            .collect();
        assert_eq!(pstn.len(), 1);
        assert_eq!(pstn[0].phone.as_deref(), Some("+15551234567"));
        assert_eq!(pstn[0].email, None);

        let guest: Vec<_> = participants
            .iter()
            .filter(|p| p.kind == ParticipantKind::Guest)
            .collect();
        assert_eq!(guest.len(), 1);
        assert_eq!(guest[0].email.as_deref(), Some("v@partner.com"));

        assert_eq!(
            participants
                .iter()
                .filter(|p| p.kind == ParticipantKind::External)
                .count(),
            1
        );
    }

    #[test]
    fn test_decorated_names() {
        let pstn = ExtractedParticipant {
            email: None,
            name: "Phone Participant".to_string(),
            phone: Some("+15551234567".to_string()),
            user_id: None,
            kind: ParticipantKind::Pstn,
        };
        assert_eq!(pstn.decorated_name(), "Phone +15551234567");

        let named_pstn = ExtractedParticipant {
            name: "Carol".to_string(),
            ..pstn.clone()
        };
        assert_eq!(named_pstn.decorated_name(), "Carol (+15551234567)");

        let guest = ExtractedParticipant {
            email: Some("v@partner.com".to_string()),
            name: "Visiting Vendor".to_string(),
            phone: None,
            user_id: None,
            kind: ParticipantKind::Guest,
        };
        assert_eq!(guest.decorated_name(), "Visiting Vendor (External)");
    }

    #[test]
    fn test_extract_identities_empty_record() {
        assert!(extract_identities(&json!({})).is_empty());
        assert!(extract_identities(&json!({"sessions": []})).is_empty());
    }
}
