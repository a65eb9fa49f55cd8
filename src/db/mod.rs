//! Database module
//!
//! Persistence for meetings, transcripts, summaries, preferences, and the
//! ingestion bookkeeping tables. The job queue operations live in
//! `crate::jobs::queue` and share this handle.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Meeting not found: {0}")]
    MeetingNotFound(i64),
    #[error("Job not found: {0}")]
    JobNotFound(i64),
    #[error("Transcript already stored for meeting {0}")]
    TranscriptExists(i64),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// The connection lock is the serialisation point for multi-statement
    /// operations (atomic job claim, summary versioning).
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ==================== Meeting Operations ====================

    /// Insert a meeting row, returning its database id.
    pub fn insert_meeting(&self, new: &NewMeeting) -> DbResult<i64> {
        let conn = self.lock();
        let now = Utc::now();
        let start = new.start_time.unwrap_or(now);
        let end = new.end_time.unwrap_or(start);
        let status = new.status.unwrap_or(MeetingStatus::Discovered);

        conn.execute(
            "INSERT INTO meetings (meeting_id, subject, organizer_email, organizer_name, organizer_user_id,
                                   start_time, end_time, duration_minutes, participant_count, join_url,
                                   chat_id, status, discovery_source, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                new.meeting_id,
                new.subject,
                new.organizer_email,
                new.organizer_name,
                new.organizer_user_id,
                start.to_rfc3339(),
                end.to_rfc3339(),
                new.duration_minutes,
                new.participant_count,
                new.join_url,
                new.chat_id,
                status.to_string(),
                new.discovery_source,
                now.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get meeting by database id
    pub fn get_meeting(&self, id: i64) -> DbResult<Meeting> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEETING_COLUMNS} FROM meetings WHERE id = ?1"
        ))?;
        stmt.query_row(params![id], meeting_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::MeetingNotFound(id),
                other => DbError::Sqlite(other),
            })
    }

    /// Look up a meeting by the provider's opaque meeting key.
    pub fn find_meeting_by_provider_id(&self, meeting_id: &str) -> DbResult<Option<Meeting>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEETING_COLUMNS} FROM meetings WHERE meeting_id = ?1"
        ))?;
        match stmt.query_row(params![meeting_id], meeting_from_row) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    /// Update meeting status, optionally recording an error message.
    pub fn update_meeting_status(
        &self,
        id: i64,
        status: MeetingStatus,
        error_message: Option<&str>,
    ) -> DbResult<()> {
        let conn = self.lock();
        let updated = match error_message {
            Some(msg) => conn.execute(
                "UPDATE meetings SET status = ?1, error_message = ?2 WHERE id = ?3",
                params![status.to_string(), msg, id],
            )?,
            None => conn.execute(
                "UPDATE meetings SET status = ?1 WHERE id = ?2",
                params![status.to_string(), id],
            )?,
        };
        if updated == 0 {
            return Err(DbError::MeetingNotFound(id));
        }
        Ok(())
    }

    /// Flip one of the has_transcript / has_summary / has_distribution flags.
    pub fn set_meeting_flag(&self, id: i64, flag: MeetingFlag) -> DbResult<()> {
        let conn = self.lock();
        let column = match flag {
            MeetingFlag::HasTranscript => "has_transcript",
            MeetingFlag::HasSummary => "has_summary",
            MeetingFlag::HasDistribution => "has_distribution",
        };
        let updated = conn.execute(
            &format!("UPDATE meetings SET {column} = 1 WHERE id = ?1"),
            params![id],
        )?;
        if updated == 0 {
            return Err(DbError::MeetingNotFound(id));
        }
        Ok(())
    }

    /// Fill in organizer fields that are currently missing.
    pub fn backfill_meeting_organizer(
        &self,
        id: i64,
        email: Option<&str>,
        name: Option<&str>,
        user_id: Option<&str>,
    ) -> DbResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE meetings SET
                organizer_email = COALESCE(organizer_email, ?1),
                organizer_name = COALESCE(organizer_name, ?2),
                organizer_user_id = COALESCE(organizer_user_id, ?3)
             WHERE id = ?4",
            params![email, name, user_id, id],
        )?;
        Ok(())
    }

    /// Disable distribution for a meeting (organizer request).
    #[allow(dead_code)] // organizer-facing path; exercised in tests
    pub fn disable_distribution(&self, id: i64, disabled_by: &str) -> DbResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE meetings SET distribution_enabled = 0, distribution_disabled_by = ?1,
                                 distribution_disabled_at = ?2
             WHERE id = ?3",
            params![disabled_by, Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(DbError::MeetingNotFound(id));
        }
        Ok(())
    }

    // ==================== Participant Operations ====================

    pub fn add_participant(
        &self,
        meeting_id: i64,
        email: Option<&str>,
        display_name: &str,
        role: &str,
        attended: bool,
    ) -> DbResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO meeting_participants (meeting_id, email, display_name, role, attended)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![meeting_id, email, display_name, role, attended],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn participants_for_meeting(&self, meeting_id: i64) -> DbResult<Vec<MeetingParticipant>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, meeting_id, email, display_name, role, attended, is_pilot_user, job_title
             FROM meeting_participants WHERE meeting_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![meeting_id], |row| {
            Ok(MeetingParticipant {
                id: row.get(0)?,
                meeting_id: row.get(1)?,
                email: row.get(2)?,
                display_name: row.get(3)?,
                role: row.get(4)?,
                attended: row.get(5)?,
                is_pilot_user: row.get(6)?,
                job_title: row.get(7)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Transcript Operations ====================

    /// Store the transcript for a meeting. Exactly one per meeting; a second
    /// insert is an error.
    pub fn insert_transcript(
        &self,
        meeting_id: i64,
        vtt_content: &str,
        vtt_url: Option<&str>,
        parsed_content: Option<&serde_json::Value>,
        word_count: i64,
        speaker_count: i64,
    ) -> DbResult<i64> {
        let conn = self.lock();
        let parsed = parsed_content.map(|v| serde_json::to_string(v).unwrap());
        conn.execute(
            "INSERT INTO transcripts (meeting_id, vtt_content, vtt_url, parsed_content,
                                      word_count, speaker_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                meeting_id,
                vtt_content,
                vtt_url,
                parsed,
                word_count,
                speaker_count,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                DbError::TranscriptExists(meeting_id)
            }
            other => DbError::Sqlite(other),
        })?;
        Ok(conn.last_insert_rowid())
    }

    /// Replace the stored transcript content. Recurring meetings reuse the
    /// meeting row, so a later instance overwrites rather than duplicating.
    pub fn update_transcript(
        &self,
        meeting_id: i64,
        vtt_content: &str,
        vtt_url: Option<&str>,
        parsed_content: Option<&serde_json::Value>,
        word_count: i64,
        speaker_count: i64,
    ) -> DbResult<()> {
        let conn = self.lock();
        let parsed = parsed_content.map(|v| serde_json::to_string(v).unwrap());
        let updated = conn.execute(
            "UPDATE transcripts SET vtt_content = ?1, vtt_url = ?2, parsed_content = ?3,
                                    word_count = ?4, speaker_count = ?5
             WHERE meeting_id = ?6",
            params![vtt_content, vtt_url, parsed, word_count, speaker_count, meeting_id],
        )?;
        if updated == 0 {
            return Err(DbError::MeetingNotFound(meeting_id));
        }
        Ok(())
    }

    pub fn transcript_for_meeting(&self, meeting_id: i64) -> DbResult<Option<Transcript>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, meeting_id, vtt_content, vtt_url, parsed_content, word_count, speaker_count, created_at
             FROM transcripts WHERE meeting_id = ?1",
        )?;
        match stmt.query_row(params![meeting_id], |row| {
            Ok(Transcript {
                id: row.get(0)?,
                meeting_id: row.get(1)?,
                vtt_content: row.get(2)?,
                vtt_url: row.get(3)?,
                parsed_content: row
                    .get::<_, Option<String>>(4)?
                    .and_then(|s| serde_json::from_str(&s).ok()),
                word_count: row.get(5)?,
                speaker_count: row.get(6)?,
                created_at: parse_datetime(&row.get::<_, String>(7)?),
            })
        }) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    // ==================== Summary Operations ====================

    /// Insert the next summary version for a meeting in one transaction.
    ///
    /// The previous current row (superseded_by IS NULL) gets linked to the
    /// new one, so exactly one current summary exists at any time.
    pub fn insert_summary_version(&self, meeting_id: i64, new: &NewSummary) -> DbResult<Summary> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let prev: Option<(i64, i64)> = match tx.query_row(
            "SELECT id, version FROM summaries WHERE meeting_id = ?1 AND superseded_by IS NULL",
            params![meeting_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ) {
            Ok(pair) => Some(pair),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(DbError::Sqlite(e)),
        };

        let version = prev.map_or(1, |(_, v)| v + 1);

        tx.execute(
            "INSERT INTO summaries (meeting_id, version, summary_text, summary_html,
                                    action_items_json, decisions_json, topics_json,
                                    model, input_tokens, output_tokens, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                meeting_id,
                version,
                new.summary_text,
                new.summary_html,
                new.action_items_json
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap()),
                new.decisions_json
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap()),
                new.topics_json
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap()),
                new.model,
                new.input_tokens,
                new.output_tokens,
                now.to_rfc3339(),
            ],
        )?;
        let new_id = tx.last_insert_rowid();

        if let Some((prev_id, _)) = prev {
            tx.execute(
                "UPDATE summaries SET superseded_by = ?1 WHERE id = ?2",
                params![new_id, prev_id],
            )?;
        }

        tx.commit()?;

        Ok(Summary {
            id: new_id,
            meeting_id,
            version,
            superseded_by: None,
            summary_text: new.summary_text.clone(),
            summary_html: new.summary_html.clone(),
            action_items_json: new.action_items_json.clone(),
            decisions_json: new.decisions_json.clone(),
            topics_json: new.topics_json.clone(),
            model: new.model.clone(),
            input_tokens: new.input_tokens,
            output_tokens: new.output_tokens,
            generated_at: now,
        })
    }

    /// The current (not superseded) summary for a meeting.
    pub fn current_summary(&self, meeting_id: i64) -> DbResult<Option<Summary>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, meeting_id, version, superseded_by, summary_text, summary_html,
                    action_items_json, decisions_json, topics_json, model,
                    input_tokens, output_tokens, generated_at
             FROM summaries WHERE meeting_id = ?1 AND superseded_by IS NULL",
        )?;
        match stmt.query_row(params![meeting_id], summary_from_row) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    /// All summary versions for a meeting, oldest first.
    #[allow(dead_code)] // Useful for tests
    pub fn summaries_for_meeting(&self, meeting_id: i64) -> DbResult<Vec<Summary>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, meeting_id, version, superseded_by, summary_text, summary_html,
                    action_items_json, decisions_json, topics_json, model,
                    input_tokens, output_tokens, generated_at
             FROM summaries WHERE meeting_id = ?1 ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![meeting_id], summary_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Processed Call Records ====================

    /// Record a call record as processed. Returns false if it was already
    /// marked (at-most-once ingestion).
    pub fn mark_call_record_processed(
        &self,
        call_record_id: &str,
        source: IngestSource,
    ) -> DbResult<bool> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO processed_call_records (call_record_id, source, processed_at)
             VALUES (?1, ?2, ?3)",
            params![call_record_id, source.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    pub fn is_call_record_processed(&self, call_record_id: &str) -> DbResult<bool> {
        let conn = self.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM processed_call_records WHERE call_record_id = ?1)",
            params![call_record_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Timestamp of the most recently processed webhook-sourced record.
    pub fn last_webhook_processed_at(&self) -> DbResult<Option<DateTime<Utc>>> {
        let conn = self.lock();
        match conn.query_row(
            "SELECT processed_at FROM processed_call_records
             WHERE source = 'webhook' ORDER BY processed_at DESC LIMIT 1",
            [],
            |row| row.get::<_, String>(0),
        ) {
            Ok(ts) => Ok(Some(parse_datetime(&ts))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    // ==================== Preference Operations ====================

    /// All users who currently receive emails.
    pub fn subscribed_users(&self) -> DbResult<Vec<UserPreference>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, user_email, receive_emails, updated_by, updated_at
             FROM user_preferences WHERE receive_emails = 1",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UserPreference {
                id: row.get(0)?,
                user_id: row.get(1)?,
                user_email: row.get(2)?,
                receive_emails: row.get(3)?,
                updated_by: row.get(4)?,
                updated_at: parse_datetime(&row.get::<_, String>(5)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn upsert_user_preference(
        &self,
        email: &str,
        user_id: Option<&str>,
        receive_emails: bool,
        updated_by: &str,
    ) -> DbResult<()> {
        let conn = self.lock();
        let email_pref = if receive_emails { "all" } else { "disabled" };
        conn.execute(
            "INSERT INTO user_preferences (user_id, user_email, receive_emails, email_preference, updated_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_email) DO UPDATE SET
                 user_id = COALESCE(excluded.user_id, user_id),
                 receive_emails = excluded.receive_emails,
                 email_preference = excluded.email_preference,
                 updated_by = excluded.updated_by,
                 updated_at = excluded.updated_at",
            params![
                user_id,
                email.to_lowercase(),
                receive_emails,
                email_pref,
                updated_by,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Per-meeting preference override; None means no override set.
    pub fn meeting_preference(&self, email: &str, meeting_id: i64) -> DbResult<Option<bool>> {
        let conn = self.lock();
        match conn.query_row(
            "SELECT receive_emails FROM meeting_preferences
             WHERE user_email = ?1 AND meeting_id = ?2",
            params![email.to_lowercase(), meeting_id],
            |row| row.get::<_, bool>(0),
        ) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    pub fn set_meeting_preference(
        &self,
        email: &str,
        meeting_id: i64,
        receive_emails: bool,
        updated_by: &str,
    ) -> DbResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO meeting_preferences (meeting_id, user_email, receive_emails, updated_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(meeting_id, user_email) DO UPDATE SET
                 receive_emails = excluded.receive_emails,
                 updated_by = excluded.updated_by,
                 updated_at = excluded.updated_at",
            params![
                meeting_id,
                email.to_lowercase(),
                receive_emails,
                updated_by,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ==================== Email Alias Cache ====================

    pub fn get_alias(&self, alias_email: &str) -> DbResult<Option<EmailAlias>> {
        let conn = self.lock();
        match conn.query_row(
            "SELECT alias_email, primary_email, user_id, resolved_at
             FROM email_aliases WHERE alias_email = ?1",
            params![alias_email.to_lowercase()],
            |row| {
                Ok(EmailAlias {
                    alias_email: row.get(0)?,
                    primary_email: row.get(1)?,
                    user_id: row.get(2)?,
                    resolved_at: parse_datetime(&row.get::<_, String>(3)?),
                })
            },
        ) {
            Ok(a) => Ok(Some(a)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    pub fn upsert_alias(
        &self,
        alias_email: &str,
        primary_email: &str,
        user_id: Option<&str>,
    ) -> DbResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO email_aliases (alias_email, primary_email, user_id, resolved_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(alias_email) DO UPDATE SET
                 primary_email = excluded.primary_email,
                 user_id = excluded.user_id,
                 resolved_at = excluded.resolved_at",
            params![
                alias_email.to_lowercase(),
                primary_email.to_lowercase(),
                user_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ==================== Subscription Events ====================

    /// Append a subscription lifecycle event; returns its id.
    pub fn log_subscription_event(
        &self,
        event_type: SubscriptionEventType,
        source: &str,
        subscription_id: Option<&str>,
        error_message: Option<&str>,
        down_event_id: Option<i64>,
        downtime_seconds: Option<i64>,
    ) -> DbResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO subscription_events (event_type, source, subscription_id, error_message,
                                              down_event_id, downtime_seconds, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event_type.to_string(),
                source,
                subscription_id,
                error_message,
                down_event_id,
                downtime_seconds,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent `down` event that no `up` event has paired with yet.
    /// Lets a restarted process compute downtime for the outage it
    /// inherited. Returns (event id, timestamp).
    pub fn latest_unpaired_down_event(&self) -> DbResult<Option<(i64, DateTime<Utc>)>> {
        let conn = self.lock();
        match conn.query_row(
            "SELECT se.id, se.created_at FROM subscription_events se
             WHERE se.event_type = 'down'
               AND NOT EXISTS (
                   SELECT 1 FROM subscription_events up
                   WHERE up.event_type = 'up' AND up.down_event_id = se.id
               )
             ORDER BY se.created_at DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        ) {
            Ok((id, ts)) => Ok(Some((id, parse_datetime(&ts)))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    // ==================== Exclusions & Pilot Users ====================

    pub fn active_exclusions(&self) -> DbResult<Vec<Exclusion>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT type, value, reason FROM exclusions WHERE is_active = 1")?;
        let rows = stmt.query_map([], |row| {
            Ok(Exclusion {
                kind: row.get(0)?,
                value: row.get(1)?,
                reason: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    #[allow(dead_code)] // admin-facing path; exercised in tests
    pub fn add_exclusion(&self, kind: &str, value: &str, reason: Option<&str>) -> DbResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO exclusions (type, value, reason, is_active) VALUES (?1, ?2, ?3, 1)",
            params![kind, value, reason],
        )?;
        Ok(())
    }

    pub fn is_pilot_user(&self, email: &str) -> DbResult<bool> {
        let conn = self.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pilot_users WHERE email = ?1 AND is_active = 1)",
            params![email.to_lowercase()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn active_pilot_users(&self) -> DbResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT email FROM pilot_users WHERE is_active = 1")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    #[allow(dead_code)] // admin-facing path; exercised in tests
    pub fn add_pilot_user(&self, email: &str, display_name: Option<&str>) -> DbResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO pilot_users (email, display_name, is_active) VALUES (?1, ?2, 1)",
            params![email.to_lowercase(), display_name],
        )?;
        Ok(())
    }

    // ==================== Audit Rows ====================

    pub fn record_backfill_run(
        &self,
        lookback_hours: i64,
        cutoff: DateTime<Utc>,
        started_at: DateTime<Utc>,
        stats: &BackfillStats,
    ) -> DbResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO backfill_runs (lookback_hours, cutoff, records_found, meetings_created,
                                        skipped_no_optin, jobs_created, errors, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                lookback_hours,
                cutoff.to_rfc3339(),
                stats.call_records_found,
                stats.meetings_created,
                stats.skipped_no_optin,
                stats.jobs_created,
                stats.errors,
                started_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn record_distribution(
        &self,
        meeting_id: i64,
        summary_id: Option<i64>,
        distribution_type: &str,
        recipient: &str,
        status: &str,
        message_id: Option<&str>,
        error_message: Option<&str>,
    ) -> DbResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO distributions (meeting_id, summary_id, distribution_type, recipient,
                                        status, message_id, error_message, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                meeting_id,
                summary_id,
                distribution_type,
                recipient,
                status,
                message_id,
                error_message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

/// Which boolean meeting flag to set
#[derive(Debug, Clone, Copy)]
pub enum MeetingFlag {
    HasTranscript,
    HasSummary,
    HasDistribution,
}

const MEETING_COLUMNS: &str = "id, meeting_id, subject, organizer_email, organizer_name, organizer_user_id,
    start_time, end_time, duration_minutes, participant_count, join_url, chat_id, recording_url,
    status, has_transcript, has_summary, has_distribution, distribution_enabled,
    distribution_disabled_by, distribution_disabled_at, call_type, discovery_source,
    discovered_at, error_message";

fn meeting_from_row(row: &Row<'_>) -> rusqlite::Result<Meeting> {
    Ok(Meeting {
        id: row.get(0)?,
        meeting_id: row.get(1)?,
        subject: row.get(2)?,
        organizer_email: row.get(3)?,
        organizer_name: row.get(4)?,
        organizer_user_id: row.get(5)?,
        start_time: parse_datetime(&row.get::<_, String>(6)?),
        end_time: parse_datetime(&row.get::<_, String>(7)?),
        duration_minutes: row.get(8)?,
        participant_count: row.get(9)?,
        join_url: row.get(10)?,
        chat_id: row.get(11)?,
        recording_url: row.get(12)?,
        status: parse_meeting_status(&row.get::<_, String>(13)?),
        has_transcript: row.get(14)?,
        has_summary: row.get(15)?,
        has_distribution: row.get(16)?,
        distribution_enabled: row.get(17)?,
        distribution_disabled_by: row.get(18)?,
        distribution_disabled_at: row.get::<_, Option<String>>(19)?.map(|s| parse_datetime(&s)),
        call_type: row.get(20)?,
        discovery_source: row.get(21)?,
        discovered_at: parse_datetime(&row.get::<_, String>(22)?),
        error_message: row.get(23)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<Summary> {
    Ok(Summary {
        id: row.get(0)?,
        meeting_id: row.get(1)?,
        version: row.get(2)?,
        superseded_by: row.get(3)?,
        summary_text: row.get(4)?,
        summary_html: row.get(5)?,
        action_items_json: row
            .get::<_, Option<String>>(6)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        decisions_json: row
            .get::<_, Option<String>>(7)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        topics_json: row
            .get::<_, Option<String>>(8)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        model: row.get(9)?,
        input_tokens: row.get(10)?,
        output_tokens: row.get(11)?,
        generated_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meeting(key: &str) -> NewMeeting {
        NewMeeting {
            meeting_id: key.to_string(),
            subject: "Weekly Sync".to_string(),
            organizer_email: Some("organizer@example.com".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_and_get_meeting() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_meeting(&sample_meeting("MTG-A")).unwrap();

        let meeting = db.get_meeting(id).unwrap();
        assert_eq!(meeting.meeting_id, "MTG-A");
        assert_eq!(meeting.status, MeetingStatus::Discovered);
        assert!(meeting.distribution_enabled);

        let found = db.find_meeting_by_provider_id("MTG-A").unwrap();
        assert_eq!(found.unwrap().id, id);
        assert!(db.find_meeting_by_provider_id("MTG-B").unwrap().is_none());
    }

    #[test]
    fn test_meeting_id_unique() {
        let db = Database::open_in_memory().unwrap();
        db.insert_meeting(&sample_meeting("MTG-A")).unwrap();
        assert!(db.insert_meeting(&sample_meeting("MTG-A")).is_err());
    }

    #[test]
    fn test_transcript_stored_once() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_meeting(&sample_meeting("MTG-A")).unwrap();

        db.insert_transcript(id, "WEBVTT\n", None, None, 10, 2)
            .unwrap();
        let err = db
            .insert_transcript(id, "WEBVTT\n", None, None, 10, 2)
            .unwrap_err();
        assert!(matches!(err, DbError::TranscriptExists(_)));
    }

    #[test]
    fn test_summary_version_chain() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_meeting(&sample_meeting("MTG-R")).unwrap();

        let v1 = db
            .insert_summary_version(
                id,
                &NewSummary {
                    summary_text: "first".to_string(),
                    model: "test-model".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(v1.version, 1);

        let v2 = db
            .insert_summary_version(
                id,
                &NewSummary {
                    summary_text: "second".to_string(),
                    model: "test-model".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(v2.version, 2);

        // exactly one current summary, and it is the max version
        let current = db.current_summary(id).unwrap().unwrap();
        assert_eq!(current.id, v2.id);

        let all = db.summaries_for_meeting(id).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].superseded_by, Some(v2.id));
        assert_eq!(all[1].superseded_by, None);
    }

    #[test]
    fn test_call_record_dedup() {
        let db = Database::open_in_memory().unwrap();

        assert!(db
            .mark_call_record_processed("CR-1", IngestSource::Webhook)
            .unwrap());
        // second mark is a no-op
        assert!(!db
            .mark_call_record_processed("CR-1", IngestSource::Backfill)
            .unwrap());
        assert!(db.is_call_record_processed("CR-1").unwrap());
        assert!(!db.is_call_record_processed("CR-2").unwrap());
    }

    #[test]
    fn test_organizer_backfill_preserves_existing() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_meeting(&sample_meeting("MTG-A")).unwrap();

        db.backfill_meeting_organizer(id, Some("other@example.com"), Some("Other"), Some("guid-1"))
            .unwrap();

        let meeting = db.get_meeting(id).unwrap();
        // existing email kept, missing fields filled
        assert_eq!(meeting.organizer_email.as_deref(), Some("organizer@example.com"));
        assert_eq!(meeting.organizer_user_id.as_deref(), Some("guid-1"));
    }

    #[test]
    fn test_preference_upsert() {
        let db = Database::open_in_memory().unwrap();

        db.upsert_user_preference("User@Example.com", None, true, "user")
            .unwrap();
        assert_eq!(db.subscribed_users().unwrap().len(), 1);

        db.upsert_user_preference("user@example.com", Some("guid-1"), false, "admin")
            .unwrap();
        assert!(db.subscribed_users().unwrap().is_empty());
    }
}
