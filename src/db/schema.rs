//! Database schema and row types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meetings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    meeting_id TEXT NOT NULL UNIQUE,
    subject TEXT NOT NULL,
    organizer_email TEXT,
    organizer_name TEXT,
    organizer_user_id TEXT,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    duration_minutes INTEGER,
    participant_count INTEGER NOT NULL DEFAULT 0,
    join_url TEXT,
    chat_id TEXT,
    recording_url TEXT,
    status TEXT NOT NULL DEFAULT 'discovered',
    has_transcript INTEGER NOT NULL DEFAULT 0,
    has_summary INTEGER NOT NULL DEFAULT 0,
    has_distribution INTEGER NOT NULL DEFAULT 0,
    distribution_enabled INTEGER NOT NULL DEFAULT 1,
    distribution_disabled_by TEXT,
    distribution_disabled_at TEXT,
    call_type TEXT,
    allow_transcription INTEGER,
    allow_recording INTEGER,
    discovery_source TEXT,
    discovered_at TEXT NOT NULL,
    error_message TEXT,
    last_chat_check TEXT
);

CREATE INDEX IF NOT EXISTS idx_meetings_meeting_id ON meetings(meeting_id);
CREATE INDEX IF NOT EXISTS idx_meetings_status ON meetings(status);

CREATE TABLE IF NOT EXISTS meeting_participants (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    meeting_id INTEGER NOT NULL,
    email TEXT,
    display_name TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'attendee',
    attended INTEGER NOT NULL DEFAULT 1,
    is_pilot_user INTEGER NOT NULL DEFAULT 0,
    job_title TEXT,
    department TEXT,
    office_location TEXT,
    company_name TEXT,

    FOREIGN KEY (meeting_id) REFERENCES meetings(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_meeting ON meeting_participants(meeting_id);

CREATE TABLE IF NOT EXISTS transcripts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    meeting_id INTEGER NOT NULL UNIQUE,
    vtt_content TEXT NOT NULL,
    vtt_url TEXT,
    parsed_content TEXT,
    word_count INTEGER NOT NULL DEFAULT 0,
    speaker_count INTEGER NOT NULL DEFAULT 0,
    transcript_sharepoint_url TEXT,
    created_at TEXT NOT NULL,

    FOREIGN KEY (meeting_id) REFERENCES meetings(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    meeting_id INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    superseded_by INTEGER,
    summary_text TEXT NOT NULL,
    summary_html TEXT,
    action_items_json TEXT,
    decisions_json TEXT,
    topics_json TEXT,
    highlights_json TEXT,
    mentions_json TEXT,
    key_numbers_json TEXT,
    meeting_type TEXT,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL,
    custom_instructions TEXT,
    generated_at TEXT NOT NULL,

    FOREIGN KEY (meeting_id) REFERENCES meetings(id) ON DELETE CASCADE,
    FOREIGN KEY (superseded_by) REFERENCES summaries(id),
    UNIQUE (meeting_id, version)
);

CREATE INDEX IF NOT EXISTS idx_summaries_meeting ON summaries(meeting_id);

CREATE TABLE IF NOT EXISTS job_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type TEXT NOT NULL,
    meeting_id INTEGER,
    input_data TEXT,
    output_data TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 5,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    heartbeat_at TEXT,
    worker_id TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    next_retry_at TEXT,
    depends_on_job_id INTEGER,
    error_message TEXT,

    FOREIGN KEY (meeting_id) REFERENCES meetings(id) ON DELETE CASCADE,
    FOREIGN KEY (depends_on_job_id) REFERENCES job_queue(id)
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON job_queue(status);
CREATE INDEX IF NOT EXISTS idx_jobs_meeting ON job_queue(meeting_id);
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON job_queue(status, priority DESC, created_at ASC);

CREATE TABLE IF NOT EXISTS processed_call_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    call_record_id TEXT NOT NULL UNIQUE,
    source TEXT NOT NULL,
    processed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processed_source ON processed_call_records(source, processed_at DESC);

CREATE TABLE IF NOT EXISTS user_preferences (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT,
    user_email TEXT NOT NULL UNIQUE,
    receive_emails INTEGER NOT NULL DEFAULT 0,
    email_preference TEXT NOT NULL DEFAULT 'disabled',
    updated_by TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS meeting_preferences (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    meeting_id INTEGER NOT NULL,
    user_email TEXT NOT NULL,
    receive_emails INTEGER NOT NULL,
    updated_by TEXT,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (meeting_id) REFERENCES meetings(id) ON DELETE CASCADE,
    UNIQUE (meeting_id, user_email)
);

CREATE TABLE IF NOT EXISTS email_aliases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alias_email TEXT NOT NULL UNIQUE,
    primary_email TEXT NOT NULL,
    user_id TEXT,
    display_name TEXT,
    job_title TEXT,
    resolved_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subscription_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    source TEXT NOT NULL,
    subscription_id TEXT,
    error_message TEXT,
    down_event_id INTEGER,
    downtime_seconds INTEGER,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS exclusions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    value TEXT NOT NULL,
    reason TEXT,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS pilot_users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    display_name TEXT,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS backfill_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lookback_hours INTEGER NOT NULL,
    cutoff TEXT NOT NULL,
    records_found INTEGER NOT NULL DEFAULT 0,
    meetings_created INTEGER NOT NULL DEFAULT 0,
    skipped_no_optin INTEGER NOT NULL DEFAULT 0,
    jobs_created INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS distributions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    meeting_id INTEGER NOT NULL,
    summary_id INTEGER,
    distribution_type TEXT NOT NULL,
    recipient TEXT NOT NULL,
    status TEXT NOT NULL,
    message_id TEXT,
    error_message TEXT,
    sent_at TEXT NOT NULL,

    FOREIGN KEY (meeting_id) REFERENCES meetings(id) ON DELETE CASCADE,
    FOREIGN KEY (summary_id) REFERENCES summaries(id)
);
"#;

/// Meeting lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Discovered,
    Queued,
    Processing,
    Completed,
    Failed,
    Skipped,
    TranscriptOnly,
}

impl fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeetingStatus::Discovered => write!(f, "discovered"),
            MeetingStatus::Queued => write!(f, "queued"),
            MeetingStatus::Processing => write!(f, "processing"),
            MeetingStatus::Completed => write!(f, "completed"),
            MeetingStatus::Failed => write!(f, "failed"),
            MeetingStatus::Skipped => write!(f, "skipped"),
            MeetingStatus::TranscriptOnly => write!(f, "transcript_only"),
        }
    }
}

pub fn parse_meeting_status(s: &str) -> MeetingStatus {
    match s {
        "queued" => MeetingStatus::Queued,
        "processing" => MeetingStatus::Processing,
        "completed" => MeetingStatus::Completed,
        "failed" => MeetingStatus::Failed,
        "skipped" => MeetingStatus::Skipped,
        "transcript_only" => MeetingStatus::TranscriptOnly,
        _ => MeetingStatus::Discovered,
    }
}

/// Job types in processing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FetchTranscript,
    GenerateSummary,
    Distribute,
    ProcessChatCommand,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::FetchTranscript => write!(f, "fetch_transcript"),
            JobType::GenerateSummary => write!(f, "generate_summary"),
            JobType::Distribute => write!(f, "distribute"),
            JobType::ProcessChatCommand => write!(f, "process_chat_command"),
        }
    }
}

pub fn parse_job_type(s: &str) -> JobType {
    match s {
        "generate_summary" => JobType::GenerateSummary,
        "distribute" => JobType::Distribute,
        "process_chat_command" => JobType::ProcessChatCommand,
        _ => JobType::FetchTranscript,
    }
}

/// Job queue states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Retrying => write!(f, "retrying"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

pub fn parse_job_status(s: &str) -> JobStatus {
    match s {
        "running" => JobStatus::Running,
        "retrying" => JobStatus::Retrying,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        _ => JobStatus::Pending,
    }
}

/// Where a call record was first ingested from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    Webhook,
    Backfill,
    SafetyNet,
}

impl fmt::Display for IngestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestSource::Webhook => write!(f, "webhook"),
            IngestSource::Backfill => write!(f, "backfill"),
            IngestSource::SafetyNet => write!(f, "safety_net"),
        }
    }
}

/// Subscription lifecycle audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEventType {
    Down,
    Up,
    Created,
    Renewed,
    Failed,
}

impl fmt::Display for SubscriptionEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionEventType::Down => write!(f, "down"),
            SubscriptionEventType::Up => write!(f, "up"),
            SubscriptionEventType::Created => write!(f, "created"),
            SubscriptionEventType::Renewed => write!(f, "renewed"),
            SubscriptionEventType::Failed => write!(f, "failed"),
        }
    }
}

/// Meeting record
#[derive(Debug, Clone, Serialize)]
pub struct Meeting {
    pub id: i64,
    pub meeting_id: String,
    pub subject: String,
    pub organizer_email: Option<String>,
    pub organizer_name: Option<String>,
    pub organizer_user_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: Option<i64>,
    pub participant_count: i64,
    pub join_url: Option<String>,
    pub chat_id: Option<String>,
    pub recording_url: Option<String>,
    pub status: MeetingStatus,
    pub has_transcript: bool,
    pub has_summary: bool,
    pub has_distribution: bool,
    pub distribution_enabled: bool,
    pub distribution_disabled_by: Option<String>,
    pub distribution_disabled_at: Option<DateTime<Utc>>,
    pub call_type: Option<String>,
    pub discovery_source: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Fields for inserting a new meeting; the store fills the rest.
#[derive(Debug, Clone, Default)]
pub struct NewMeeting {
    pub meeting_id: String,
    pub subject: String,
    pub organizer_email: Option<String>,
    pub organizer_name: Option<String>,
    pub organizer_user_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub participant_count: i64,
    pub join_url: Option<String>,
    pub chat_id: Option<String>,
    pub status: Option<MeetingStatus>,
    pub discovery_source: Option<String>,
}

/// Participant record
#[derive(Debug, Clone, Serialize)]
pub struct MeetingParticipant {
    pub id: i64,
    pub meeting_id: i64,
    pub email: Option<String>,
    pub display_name: String,
    pub role: String,
    pub attended: bool,
    pub is_pilot_user: bool,
    pub job_title: Option<String>,
}

/// Transcript record (one per meeting)
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub id: i64,
    pub meeting_id: i64,
    pub vtt_content: String,
    pub vtt_url: Option<String>,
    pub parsed_content: Option<serde_json::Value>,
    pub word_count: i64,
    pub speaker_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Summary record (versioned, many per meeting)
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub id: i64,
    pub meeting_id: i64,
    pub version: i64,
    pub superseded_by: Option<i64>,
    pub summary_text: String,
    pub summary_html: Option<String>,
    pub action_items_json: Option<serde_json::Value>,
    pub decisions_json: Option<serde_json::Value>,
    pub topics_json: Option<serde_json::Value>,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub generated_at: DateTime<Utc>,
}

/// Fields for inserting a new summary version.
#[derive(Debug, Clone, Default)]
pub struct NewSummary {
    pub summary_text: String,
    pub summary_html: Option<String>,
    pub action_items_json: Option<serde_json::Value>,
    pub decisions_json: Option<serde_json::Value>,
    pub topics_json: Option<serde_json::Value>,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Job queue row
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub meeting_id: Option<i64>,
    pub input_data: Option<serde_json::Value>,
    pub output_data: Option<serde_json::Value>,
    pub status: JobStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub depends_on_job_id: Option<i64>,
    pub error_message: Option<String>,
}

impl Job {
    /// The transcript id carried by transcript-ready notifications, if any.
    pub fn transcript_id(&self) -> Option<String> {
        self.input_data
            .as_ref()
            .and_then(|d| d.get("transcript_id"))
            .and_then(|v| v.as_str())
            .map(String::from)
    }
}

/// User-level preference record
#[derive(Debug, Clone, Serialize)]
pub struct UserPreference {
    pub id: i64,
    pub user_id: Option<String>,
    pub user_email: String,
    pub receive_emails: bool,
    pub updated_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Cached alias resolution
#[derive(Debug, Clone, Serialize)]
pub struct EmailAlias {
    pub alias_email: String,
    pub primary_email: String,
    pub user_id: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

/// Exclusion rule
#[derive(Debug, Clone, Serialize)]
pub struct Exclusion {
    pub kind: String,
    pub value: String,
    pub reason: Option<String>,
}

/// Statistics for one backfill invocation
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillStats {
    pub call_records_found: u64,
    pub meetings_created: u64,
    pub skipped_no_optin: u64,
    pub jobs_created: u64,
    pub errors: u64,
}
