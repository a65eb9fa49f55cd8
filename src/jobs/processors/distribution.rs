//! Distribution processor
//!
//! Delivers the current summary to the meeting chat and to opted-in
//! participants by email. Chat goes first: it is the more reliable channel
//! and a chat failure must not block email. The job succeeds when at least
//! one channel delivered.

use super::{job_meeting_id, Processor, ProcessorError, ProcessorOutcome};
use crate::config::Config;
use crate::db::{Database, Job, Meeting, MeetingFlag, MeetingStatus, Summary};
use crate::graph::{chat, mail, GraphClient};
use crate::prefs::PreferenceManager;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

pub struct DistributionProcessor {
    db: Database,
    graph: GraphClient,
    prefs: PreferenceManager,
    config: Arc<Config>,
}

impl DistributionProcessor {
    pub fn new(db: Database, graph: GraphClient, prefs: PreferenceManager, config: Arc<Config>) -> Self {
        Self {
            db,
            graph,
            prefs,
            config,
        }
    }

    /// Attended participants with an address, deduplicated, filtered
    /// through the full preference chain.
    fn select_recipients(&self, meeting_id: i64) -> Result<Vec<String>, ProcessorError> {
        let participants = self.db.participants_for_meeting(meeting_id)?;
        let mut seen = HashSet::new();
        let mut recipients = Vec::new();

        for participant in participants {
            if !participant.attended {
                continue;
            }
            let Some(email) = participant.email else {
                continue;
            };
            let email = email.to_lowercase();
            if !seen.insert(email.clone()) {
                continue;
            }
            if self.prefs.should_send_email(&email, meeting_id) {
                recipients.push(email);
            } else {
                tracing::debug!(email, meeting_id, "Recipient filtered by preferences");
            }
        }
        Ok(recipients)
    }

    fn compose_html(meeting: &Meeting, summary: &Summary) -> String {
        let mut html = format!(
            "<h2>{}</h2><p>{}</p>",
            meeting.subject,
            summary.summary_text.replace('\n', "<br/>")
        );
        if let Some(items) = summary
            .action_items_json
            .as_ref()
            .and_then(|v| v.as_array())
        {
            if !items.is_empty() {
                html.push_str("<h3>Action items</h3><ul>");
                for item in items {
                    let text = item.as_str().map_or_else(|| item.to_string(), String::from);
                    html.push_str(&format!("<li>{text}</li>"));
                }
                html.push_str("</ul>");
            }
        }
        html
    }
}

#[async_trait]
impl Processor for DistributionProcessor {
    async fn process(&self, job: &Job) -> Result<ProcessorOutcome, ProcessorError> {
        let meeting_id = job_meeting_id(job)?;
        let meeting = self.db.get_meeting(meeting_id)?;
        let summary = self.db.current_summary(meeting_id)?.ok_or_else(|| {
            ProcessorError::NonRetryable(format!("No summary stored for meeting {meeting_id}"))
        })?;

        let settings = self.config.settings();

        // Rendering is CPU-bound; it must not stall the scheduler that
        // answers relay validations.
        let html = {
            let meeting = meeting.clone();
            let summary = summary.clone();
            tokio::task::spawn_blocking(move || Self::compose_html(&meeting, &summary))
                .await
                .map_err(|e| ProcessorError::Retryable(format!("Render task failed: {e}")))?
        };

        let mut chat_attempted = false;
        let mut chat_sent = false;
        let mut chat_message_id = None;

        // Chat first. An organizer-level distribution disable silences this
        // channel as well, turning the queued job into a no-op.
        if settings.teams_chat_enabled && meeting.distribution_enabled {
            if let Some(chat_id) = &meeting.chat_id {
                chat_attempted = true;
                match chat::post_message(&self.graph, chat_id, &html).await {
                    Ok(message_id) => {
                        chat_sent = true;
                        chat_message_id = message_id.clone();
                        self.db.record_distribution(
                            meeting_id,
                            Some(summary.id),
                            "teams_chat",
                            &format!("chat:{chat_id}"),
                            "sent",
                            message_id.as_deref(),
                            None,
                        )?;
                        tracing::info!(meeting_id, chat_id, "Posted summary to chat");
                    }
                    Err(e) => {
                        // keep going; email may still deliver
                        tracing::error!(meeting_id, chat_id, error = %e, "Chat post failed");
                        self.db.record_distribution(
                            meeting_id,
                            Some(summary.id),
                            "teams_chat",
                            &format!("chat:{chat_id}"),
                            "failed",
                            None,
                            Some(e.to_string().as_str()),
                        )?;
                    }
                }
            } else {
                tracing::debug!(meeting_id, "No chat id recorded for meeting");
            }
        }

        // Then email
        let mut email_attempted = false;
        let mut sent_count = 0_u64;
        let mut failed_count = 0_u64;

        if settings.email_enabled {
            if let Some(from) = &settings.email_from {
                let recipients = self.select_recipients(meeting_id)?;
                if recipients.is_empty() {
                    tracing::info!(meeting_id, "No opted-in recipients after filtering");
                } else {
                    email_attempted = true;
                    let subject = format!("Meeting summary: {}", meeting.subject);
                    for recipient in &recipients {
                        match mail::send_mail(&self.graph, from, recipient, &subject, &html).await {
                            Ok(()) => {
                                sent_count += 1;
                                self.db.record_distribution(
                                    meeting_id,
                                    Some(summary.id),
                                    "email",
                                    recipient,
                                    "sent",
                                    None,
                                    None,
                                )?;
                            }
                            Err(e) => {
                                failed_count += 1;
                                tracing::error!(meeting_id, recipient, error = %e, "Email send failed");
                                self.db.record_distribution(
                                    meeting_id,
                                    Some(summary.id),
                                    "email",
                                    recipient,
                                    "failed",
                                    None,
                                    Some(e.to_string().as_str()),
                                )?;
                            }
                        }
                    }
                }
            }
        }

        let email_sent = sent_count > 0;
        let nothing_attempted = !chat_attempted && !email_attempted;

        // Partial success counts: one delivered channel is enough.
        if !chat_sent && !email_sent && !nothing_attempted {
            return Err(ProcessorError::Retryable(format!(
                "All distribution channels failed for meeting {meeting_id}"
            )));
        }

        self.db
            .set_meeting_flag(meeting_id, MeetingFlag::HasDistribution)?;
        self.db
            .update_meeting_status(meeting_id, MeetingStatus::Completed, None)?;

        tracing::info!(
            meeting_id,
            chat_sent,
            email_sent_count = sent_count,
            email_failed_count = failed_count,
            "Distribution finished"
        );

        Ok(ProcessorOutcome::Completed(json!({
            "success": true,
            "chat_sent": chat_sent,
            "chat_message_id": chat_message_id,
            "email_sent": email_sent,
            "email_recipient_count": sent_count,
            "email_failed_count": failed_count,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewMeeting;

    fn make_processor(db: &Database) -> DistributionProcessor {
        std::env::set_var("GRAPH_TENANT_ID", "t");
        std::env::set_var("GRAPH_CLIENT_ID", "c");
        std::env::set_var("GRAPH_CLIENT_SECRET", "s");
        std::env::set_var("RELAY_NAMESPACE", "example.servicebus.windows.net");
        std::env::set_var("RELAY_KEY", "k");
        let config = Arc::new(Config::from_env().unwrap());
        let graph = GraphClient::new(config.graph.clone()).unwrap();
        DistributionProcessor::new(
            db.clone(),
            graph,
            PreferenceManager::new(db.clone()),
            config,
        )
    }

    #[test]
    fn test_select_recipients_filters_and_dedupes() {
        let db = Database::open_in_memory().unwrap();
        let meeting_id = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-A".to_string(),
                subject: "Sync".to_string(),
                ..Default::default()
            })
            .unwrap();

        db.add_participant(meeting_id, Some("a@x.com"), "A", "organizer", true)
            .unwrap();
        db.add_participant(meeting_id, Some("A@X.com"), "A dup", "attendee", true)
            .unwrap();
        db.add_participant(meeting_id, Some("b@x.com"), "B", "attendee", true)
            .unwrap();
        // invited but did not join
        db.add_participant(meeting_id, Some("c@x.com"), "C", "attendee", false)
            .unwrap();
        // PSTN participant without email
        db.add_participant(meeting_id, None, "Phone Participant", "attendee", true)
            .unwrap();

        let prefs = PreferenceManager::new(db.clone());
        prefs.set_user_preference("a@x.com", true, "user").unwrap();
        prefs.set_user_preference("b@x.com", true, "user").unwrap();
        prefs.set_user_preference("c@x.com", true, "user").unwrap();

        let processor = make_processor(&db);
        let recipients = processor.select_recipients(meeting_id).unwrap();
        assert_eq!(recipients, vec!["a@x.com".to_string(), "b@x.com".to_string()]);
    }

    #[test]
    fn test_per_meeting_optout_excluded() {
        let db = Database::open_in_memory().unwrap();
        let meeting_id = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-A".to_string(),
                subject: "Sync".to_string(),
                ..Default::default()
            })
            .unwrap();
        db.add_participant(meeting_id, Some("u@x.com"), "U", "attendee", true)
            .unwrap();

        let prefs = PreferenceManager::new(db.clone());
        prefs.set_user_preference("u@x.com", true, "user").unwrap();
        prefs
            .set_meeting_preference("u@x.com", meeting_id, false, "user")
            .unwrap();

        let processor = make_processor(&db);
        assert!(processor.select_recipients(meeting_id).unwrap().is_empty());
    }

    #[test]
    fn test_compose_html_includes_action_items() {
        let db = Database::open_in_memory().unwrap();
        let meeting_id = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-A".to_string(),
                subject: "Sync".to_string(),
                ..Default::default()
            })
            .unwrap();
        let meeting = db.get_meeting(meeting_id).unwrap();
        let summary = Summary {
            id: 1,
            meeting_id,
            version: 1,
            superseded_by: None,
            summary_text: "Line one\nLine two".to_string(),
            summary_html: None,
            action_items_json: Some(json!(["Ship the release", "Email the team"])),
            decisions_json: None,
            topics_json: None,
            model: "m".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            generated_at: chrono::Utc::now(),
        };

        let html = DistributionProcessor::compose_html(&meeting, &summary);
        assert!(html.contains("<h2>Sync</h2>"));
        assert!(html.contains("Line one<br/>Line two"));
        assert!(html.contains("<li>Ship the release</li>"));
    }
}
