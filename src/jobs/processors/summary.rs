//! Summary processor
//!
//! Feeds the stored transcript to the summarizer seam and commits the next
//! summary version. Version assignment is linearised by the store, so the
//! current summary is always the highest version.

use super::{job_meeting_id, Processor, ProcessorError, ProcessorOutcome};
use crate::db::{Database, Job, MeetingFlag, NewSummary};
use crate::summarizer::{Summarizer, SummaryRequest};
use crate::vtt;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub struct SummaryProcessor {
    db: Database,
    summarizer: Arc<dyn Summarizer>,
}

impl SummaryProcessor {
    pub fn new(db: Database, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { db, summarizer }
    }
}

#[async_trait]
impl Processor for SummaryProcessor {
    async fn process(&self, job: &Job) -> Result<ProcessorOutcome, ProcessorError> {
        let meeting_id = job_meeting_id(job)?;
        let meeting = self.db.get_meeting(meeting_id)?;

        let transcript = self.db.transcript_for_meeting(meeting_id)?.ok_or_else(|| {
            ProcessorError::NonRetryable(format!("No transcript stored for meeting {meeting_id}"))
        })?;

        // Prefer the speaker-segmented text; fall back to raw VTT parsing.
        // Both are CPU-bound, so they run off the async scheduler.
        let transcript_text =
            tokio::task::spawn_blocking(move || match &transcript.parsed_content {
                Some(parsed) if parsed.as_array().is_some_and(|a| !a.is_empty()) => {
                    render_utterances(parsed)
                }
                _ => vtt::to_plain_text(&vtt::parse(&transcript.vtt_content)),
            })
            .await
            .map_err(|e| {
                ProcessorError::NonRetryable(format!("Transcript render task failed: {e}"))
            })?;
        if transcript_text.trim().is_empty() {
            return Err(ProcessorError::NonRetryable(format!(
                "Transcript for meeting {meeting_id} has no content"
            )));
        }

        let participant_names = self
            .db
            .participants_for_meeting(meeting_id)?
            .into_iter()
            .map(|p| p.display_name)
            .collect();

        let request = SummaryRequest {
            subject: meeting.subject.clone(),
            transcript_text,
            participant_names,
            custom_instructions: None,
        };

        let result = self.summarizer.summarize(&request).await.map_err(|e| {
            if e.kind.is_retryable() {
                ProcessorError::Retryable(format!("Summarizer failed: {e}"))
            } else {
                ProcessorError::NonRetryable(format!("Summarizer failed: {e}"))
            }
        })?;

        let summary = self.db.insert_summary_version(
            meeting_id,
            &NewSummary {
                summary_text: result.summary_text,
                summary_html: None,
                action_items_json: result.action_items,
                decisions_json: result.decisions,
                topics_json: result.topics,
                model: result.model,
                input_tokens: result.input_tokens,
                output_tokens: result.output_tokens,
            },
        )?;
        self.db.set_meeting_flag(meeting_id, MeetingFlag::HasSummary)?;

        tracing::info!(
            meeting_id,
            summary_id = summary.id,
            version = summary.version,
            "Summary stored"
        );

        Ok(ProcessorOutcome::Completed(json!({
            "success": true,
            "summary_id": summary.id,
            "version": summary.version,
            "input_tokens": summary.input_tokens,
            "output_tokens": summary.output_tokens,
        })))
    }
}

fn render_utterances(parsed: &serde_json::Value) -> String {
    parsed
        .as_array()
        .map(|utterances| {
            utterances
                .iter()
                .filter_map(|u| {
                    let text = u.get("text")?.as_str()?;
                    Some(match u.get("speaker").and_then(|s| s.as_str()) {
                        Some(speaker) => format!("{speaker}: {text}"),
                        None => text.to_string(),
                    })
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MeetingStatus, NewMeeting};
    use crate::jobs::queue::JobQueue;
    use crate::summarizer::{SummarizerError, SummarizerErrorKind, SummaryResult};

    struct FakeSummarizer {
        fail_with: Option<SummarizerErrorKind>,
    }

    #[async_trait]
    impl Summarizer for FakeSummarizer {
        async fn summarize(
            &self,
            request: &SummaryRequest,
        ) -> Result<SummaryResult, SummarizerError> {
            if let Some(kind) = self.fail_with {
                return Err(SummarizerError {
                    kind,
                    message: "boom".to_string(),
                });
            }
            Ok(SummaryResult {
                summary_text: format!("Summary of {}", request.subject),
                action_items: Some(json!(["follow up"])),
                decisions: None,
                topics: None,
                model: "fake-model".to_string(),
                input_tokens: 100,
                output_tokens: 50,
            })
        }
    }

    fn setup(fail_with: Option<SummarizerErrorKind>) -> (Database, JobQueue, SummaryProcessor, i64) {
        let db = Database::open_in_memory().unwrap();
        let queue = JobQueue::new(db.clone());
        let meeting_id = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-A".to_string(),
                subject: "Planning".to_string(),
                ..Default::default()
            })
            .unwrap();
        let processor = SummaryProcessor::new(db.clone(), Arc::new(FakeSummarizer { fail_with }));
        (db, queue, processor, meeting_id)
    }

    fn store_transcript(db: &Database, meeting_id: i64) {
        db.insert_transcript(
            meeting_id,
            "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\n<v Alice>We will ship on Friday.</v>\n",
            None,
            Some(&json!([{"speaker": "Alice", "text": "We will ship on Friday."}])),
            5,
            1,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_summary_written_and_versioned() {
        let (db, queue, processor, meeting_id) = setup(None);
        store_transcript(&db, meeting_id);
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();
        let job = queue.get_job(ids[1]).unwrap();

        let outcome = processor.process(&job).await.unwrap();
        let ProcessorOutcome::Completed(output) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(output["version"], 1);

        let summary = db.current_summary(meeting_id).unwrap().unwrap();
        assert_eq!(summary.summary_text, "Summary of Planning");
        assert_eq!(summary.model, "fake-model");
        assert!(db.get_meeting(meeting_id).unwrap().has_summary);

        // second run supersedes the first
        let outcome = processor.process(&job).await.unwrap();
        let ProcessorOutcome::Completed(output) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(output["version"], 2);
        let all = db.summaries_for_meeting(meeting_id).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].superseded_by.is_some());
    }

    #[tokio::test]
    async fn test_missing_transcript_is_non_retryable() {
        let (_db, queue, processor, meeting_id) = setup(None);
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();
        let job = queue.get_job(ids[1]).unwrap();

        let err = processor.process(&job).await.unwrap_err();
        assert!(!err.should_retry());
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable() {
        let (db, queue, processor, meeting_id) = setup(Some(SummarizerErrorKind::RateLimit));
        store_transcript(&db, meeting_id);
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();
        let job = queue.get_job(ids[1]).unwrap();

        let err = processor.process(&job).await.unwrap_err();
        assert!(err.should_retry());
        // nothing was stored and the meeting is not failed by the processor
        assert!(db.current_summary(meeting_id).unwrap().is_none());
        assert_eq!(db.get_meeting(meeting_id).unwrap().status, MeetingStatus::Queued);
    }
}
