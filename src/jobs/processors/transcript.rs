//! Transcript processor
//!
//! Resolves and downloads the WebVTT transcript for a meeting. Transcripts
//! can lag the meeting end, so "not there yet" gets its own bounded retry
//! ladder (15/30/60 minutes) instead of the generic backoff; exhausting it
//! marks the meeting permanently transcript-unavailable.

use super::{job_meeting_id, Processor, ProcessorError, ProcessorOutcome};
use crate::db::{Database, Job, Meeting, MeetingFlag, MeetingStatus};
use crate::graph::{transcripts, users, GraphClient, GraphError};
use crate::jobs::queue::JobQueue;
use crate::vtt;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;

const MAX_TRANSCRIPT_RETRIES: i64 = 3;
const BASE_RETRY_MINUTES: i64 = 15;

pub struct TranscriptProcessor {
    db: Database,
    queue: JobQueue,
    graph: GraphClient,
}

impl TranscriptProcessor {
    pub fn new(db: Database, queue: JobQueue, graph: GraphClient) -> Self {
        Self { db, queue, graph }
    }

    /// Organizer GUID, looked up by email when the row lacks it.
    async fn resolve_organizer_id(&self, meeting: &Meeting) -> Result<String, ProcessorError> {
        if let Some(id) = &meeting.organizer_user_id {
            return Ok(id.clone());
        }
        let email = meeting.organizer_email.as_deref().ok_or_else(|| {
            ProcessorError::NonRetryable(format!(
                "Meeting {} has no organizer identity",
                meeting.id
            ))
        })?;
        let user = users::lookup_user(&self.graph, email).await?;
        self.db
            .backfill_meeting_organizer(meeting.id, None, None, Some(user.id.as_str()))?;
        Ok(user.id)
    }

    /// Download under the organizer; on 403, try once under a pilot
    /// participant's identity before giving up.
    async fn download_with_fallback(
        &self,
        meeting: &Meeting,
        organizer_id: &str,
        transcript_id: &str,
    ) -> Result<String, ProcessorError> {
        match transcripts::download_content(
            &self.graph,
            organizer_id,
            &meeting.meeting_id,
            transcript_id,
        )
        .await
        {
            Ok(content) => Ok(content),
            Err(GraphError::Forbidden(message)) => {
                tracing::warn!(
                    meeting_id = meeting.id,
                    "403 downloading transcript as organizer, trying pilot participant"
                );
                let fallback = self.pilot_participant_id(meeting.id).await?.ok_or(
                    GraphError::Forbidden(message),
                )?;
                transcripts::download_content(
                    &self.graph,
                    &fallback,
                    &meeting.meeting_id,
                    transcript_id,
                )
                .await
                .map_err(ProcessorError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// GUID of the first pilot-user participant, if any.
    async fn pilot_participant_id(&self, meeting_id: i64) -> Result<Option<String>, ProcessorError> {
        for participant in self.db.participants_for_meeting(meeting_id)? {
            let Some(email) = &participant.email else {
                continue;
            };
            if self.db.is_pilot_user(email)? {
                let user = users::lookup_user(&self.graph, email).await?;
                return Ok(Some(user.id));
            }
        }
        Ok(None)
    }

    /// Schedule the next bounded retry, or fail the meeting permanently
    /// when the ladder is exhausted. Either way the job is finalised here.
    fn handle_not_ready(&self, job: &Job) -> Result<ProcessorOutcome, ProcessorError> {
        let retry_count = job.retry_count;

        if retry_count < MAX_TRANSCRIPT_RETRIES {
            let delay_minutes = BASE_RETRY_MINUTES * (1 << retry_count.clamp(0, 8));
            let retry_at = Utc::now() + Duration::minutes(delay_minutes);
            tracing::info!(
                job_id = job.id,
                retry = format!("{}/{MAX_TRANSCRIPT_RETRIES}", retry_count + 1),
                delay_minutes,
                "Transcript not ready, scheduling retry"
            );
            self.queue
                .schedule_retry_at(job.id, retry_at, "Transcript not yet available")?;
        } else {
            let total_minutes: i64 = (0..MAX_TRANSCRIPT_RETRIES)
                .map(|i| BASE_RETRY_MINUTES * (1 << i))
                .sum();
            #[allow(clippy::cast_precision_loss)]
            let hours = total_minutes as f64 / 60.0;
            let message = format!(
                "Transcript not available after {MAX_TRANSCRIPT_RETRIES} retries ({hours} hours)"
            );
            tracing::error!(job_id = job.id, %message, "Giving up on transcript");
            self.queue.mark_failed(
                job.id,
                &message,
                false,
                Some(&json!({
                    "success": false,
                    "message": message,
                    "max_retries_reached": true,
                })),
            )?;
        }
        Ok(ProcessorOutcome::Deferred)
    }
}

#[async_trait]
impl Processor for TranscriptProcessor {
    async fn process(&self, job: &Job) -> Result<ProcessorOutcome, ProcessorError> {
        let meeting_id = job_meeting_id(job)?;
        let meeting = self.db.get_meeting(meeting_id)?;
        self.db
            .update_meeting_status(meeting_id, MeetingStatus::Processing, None)?;

        let organizer_id = self.resolve_organizer_id(&meeting).await?;

        // Transcript-ready notifications carry the id; otherwise match
        // against the organizer's transcript listing.
        let transcript_id = match job.transcript_id() {
            Some(id) => id,
            None => {
                let all = transcripts::list_for_organizer(&self.graph, &organizer_id).await?;
                let mut matching: Vec<_> = all
                    .into_iter()
                    .filter(|t| t.meeting_id.as_deref() == Some(meeting.meeting_id.as_str()))
                    .collect();
                matching.sort_by(|a, b| a.created_date_time.cmp(&b.created_date_time));
                match matching.pop() {
                    Some(meta) => meta.id,
                    None => return self.handle_not_ready(job),
                }
            }
        };

        let content = match self
            .download_with_fallback(&meeting, &organizer_id, &transcript_id)
            .await
        {
            Ok(content) => content,
            // The listing can race content availability
            Err(ProcessorError::NonRetryable(msg)) if msg.contains("Not found") => {
                return self.handle_not_ready(job);
            }
            Err(e) => return Err(e),
        };

        if content.trim().is_empty() {
            return self.handle_not_ready(job);
        }

        // Parsing is CPU-bound; it must not stall the scheduler that
        // answers relay validations.
        let (content, parsed) = tokio::task::spawn_blocking(move || {
            let parsed = vtt::parse(&content);
            (content, parsed)
        })
        .await
        .map_err(|e| ProcessorError::NonRetryable(format!("Transcript parse task failed: {e}")))?;
        let parsed_json = serde_json::to_value(&parsed.utterances)
            .map_err(|e| ProcessorError::NonRetryable(format!("Unencodable transcript: {e}")))?;

        let replaced = self.db.transcript_for_meeting(meeting_id)?.is_some();
        if replaced {
            self.db.update_transcript(
                meeting_id,
                &content,
                None,
                Some(&parsed_json),
                parsed.word_count,
                parsed.speaker_count,
            )?;
        } else {
            self.db.insert_transcript(
                meeting_id,
                &content,
                None,
                Some(&parsed_json),
                parsed.word_count,
                parsed.speaker_count,
            )?;
        }
        self.db.set_meeting_flag(meeting_id, MeetingFlag::HasTranscript)?;

        // A fetch job without a dependent summary job is a safety-net
        // catch-up: keep the transcript, leave summarisation to a manual
        // trigger.
        if !self.queue.has_dependent(job.id)? {
            self.db
                .update_meeting_status(meeting_id, MeetingStatus::TranscriptOnly, None)?;
        }

        tracing::info!(
            meeting_id,
            transcript_id,
            word_count = parsed.word_count,
            speaker_count = parsed.speaker_count,
            replaced,
            "Stored transcript"
        );

        Ok(ProcessorOutcome::Completed(json!({
            "success": true,
            "transcript_id": transcript_id,
            "word_count": parsed.word_count,
            "speaker_count": parsed.speaker_count,
            "replaced": replaced,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::db::{JobStatus, NewMeeting};

    fn setup() -> (Database, JobQueue, TranscriptProcessor, i64) {
        let db = Database::open_in_memory().unwrap();
        let queue = JobQueue::new(db.clone());
        let graph = GraphClient::new(GraphConfig {
            tenant_id: "t".to_string(),
            client_id: "c".to_string(),
            client_secret: "s".to_string(),
        })
        .unwrap();
        let meeting_id = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-A".to_string(),
                subject: "Weekly Sync".to_string(),
                organizer_user_id: Some("org-guid".to_string()),
                ..Default::default()
            })
            .unwrap();
        let processor = TranscriptProcessor::new(db.clone(), queue.clone(), graph);
        (db, queue, processor, meeting_id)
    }

    #[test]
    fn test_not_ready_schedules_bounded_retries() {
        let (_db, queue, processor, meeting_id) = setup();
        let job_id = queue
            .enqueue_transcript_chain(meeting_id, &json!({"meeting_id": meeting_id}), 5)
            .unwrap()[0];

        // retry 1 at 15 min
        let job = queue.get_job(job_id).unwrap();
        assert!(matches!(
            processor.handle_not_ready(&job).unwrap(),
            ProcessorOutcome::Deferred
        ));
        let job = queue.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retry_count, 1);
        let delay = job.next_retry_at.unwrap() - Utc::now();
        assert!(delay > Duration::minutes(14) && delay <= Duration::minutes(15));

        // retry 2 at 30 min
        processor.handle_not_ready(&job).unwrap();
        let job = queue.get_job(job_id).unwrap();
        let delay = job.next_retry_at.unwrap() - Utc::now();
        assert!(delay > Duration::minutes(29) && delay <= Duration::minutes(30));

        // retry 3 at 60 min
        processor.handle_not_ready(&job).unwrap();
        let job = queue.get_job(job_id).unwrap();
        assert_eq!(job.retry_count, 3);
        let delay = job.next_retry_at.unwrap() - Utc::now();
        assert!(delay > Duration::minutes(59) && delay <= Duration::minutes(60));
    }

    #[test]
    fn test_exhausted_retries_fail_meeting() {
        let (db, queue, processor, meeting_id) = setup();
        let job_id = queue
            .enqueue_transcript_chain(meeting_id, &json!({"meeting_id": meeting_id}), 5)
            .unwrap()[0];

        for _ in 0..3 {
            let job = queue.get_job(job_id).unwrap();
            processor.handle_not_ready(&job).unwrap();
        }

        // fourth miss is terminal
        let job = queue.get_job(job_id).unwrap();
        processor.handle_not_ready(&job).unwrap();

        let job = queue.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        let meeting = db.get_meeting(meeting_id).unwrap();
        assert_eq!(meeting.status, MeetingStatus::Failed);
        assert_eq!(
            meeting.error_message.as_deref(),
            Some("Transcript not available after 3 retries (1.75 hours)")
        );
    }
}
