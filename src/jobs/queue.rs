//! Job queue
//!
//! Dependency-aware work queue on top of the relational store. Claiming is
//! a single UPDATE statement executed under the connection lock, so no two
//! workers can ever take the same job.

use crate::db::{
    parse_datetime, parse_job_status, parse_job_type, Database, DbError, DbResult, Job, JobType,
    MeetingStatus,
};
use crate::jobs::retry::{next_retry_at, retry_strategy};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};
use serde_json::json;
use std::collections::HashMap;

const JOB_COLUMNS: &str = "id, job_type, meeting_id, input_data, output_data, status, priority,
    created_at, started_at, completed_at, heartbeat_at, worker_id, retry_count, max_retries,
    next_retry_at, depends_on_job_id, error_message";

/// Queue statistics for monitoring
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub total_jobs: i64,
    pub by_status: HashMap<String, i64>,
    pub by_type: HashMap<String, i64>,
    pub oldest_pending_minutes: Option<i64>,
    pub avg_processing_seconds: Option<f64>,
}

/// Manages job queue operations with atomic claiming and dependency chains.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueue the three-job chain for a meeting:
    /// fetch_transcript -> generate_summary -> distribute.
    ///
    /// Refuses to create a new chain while any non-terminal job exists for
    /// the meeting (enqueue idempotence). Returns the created job ids, or
    /// an empty vec when a chain is already live.
    pub fn enqueue_meeting_chain(&self, meeting_id: i64, priority: i64) -> DbResult<Vec<i64>> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let meeting_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM meetings WHERE id = ?1)",
            params![meeting_id],
            |row| row.get(0),
        )?;
        if !meeting_exists {
            return Err(DbError::MeetingNotFound(meeting_id));
        }

        let active: i64 = tx.query_row(
            "SELECT COUNT(*) FROM job_queue
             WHERE meeting_id = ?1 AND status IN ('pending', 'running', 'retrying')",
            params![meeting_id],
            |row| row.get(0),
        )?;
        if active > 0 {
            tracing::warn!(meeting_id, "Jobs already exist for meeting, skipping enqueue");
            return Ok(Vec::new());
        }

        let input = json!({ "meeting_id": meeting_id }).to_string();
        let mut job_ids = Vec::with_capacity(3);
        let mut parent: Option<i64> = None;

        for job_type in [
            JobType::FetchTranscript,
            JobType::GenerateSummary,
            JobType::Distribute,
        ] {
            tx.execute(
                "INSERT INTO job_queue (job_type, meeting_id, input_data, status, priority,
                                        created_at, max_retries, depends_on_job_id)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7)",
                params![
                    job_type.to_string(),
                    meeting_id,
                    input,
                    priority,
                    now,
                    retry_strategy(job_type).max_retries,
                    parent,
                ],
            )?;
            let id = tx.last_insert_rowid();
            job_ids.push(id);
            parent = Some(id);
        }

        tx.execute(
            "UPDATE meetings SET status = 'queued' WHERE id = ?1",
            params![meeting_id],
        )?;
        tx.commit()?;

        tracing::info!(meeting_id, ?job_ids, priority, "Created 3-job chain");
        Ok(job_ids)
    }

    /// Enqueue a chain whose fetch job carries an explicit payload
    /// (webhook/backfill entry point). The payload may carry a
    /// transcript_id so the fetcher skips time-based matching.
    ///
    /// Unlike `enqueue_meeting_chain` this does not refuse on live jobs:
    /// recurring meetings legitimately run one chain per transcript, and
    /// callers have already deduplicated on the (meeting, transcript) pair.
    pub fn enqueue_transcript_chain(
        &self,
        meeting_id: i64,
        input_data: &serde_json::Value,
        priority: i64,
    ) -> DbResult<Vec<i64>> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let follow_up = json!({ "meeting_id": meeting_id }).to_string();

        let mut job_ids = Vec::with_capacity(3);
        let mut parent: Option<i64> = None;
        for job_type in [
            JobType::FetchTranscript,
            JobType::GenerateSummary,
            JobType::Distribute,
        ] {
            let input = if job_type == JobType::FetchTranscript {
                input_data.to_string()
            } else {
                follow_up.clone()
            };
            tx.execute(
                "INSERT INTO job_queue (job_type, meeting_id, input_data, status, priority,
                                        created_at, max_retries, depends_on_job_id)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7)",
                params![
                    job_type.to_string(),
                    meeting_id,
                    input,
                    priority,
                    now,
                    retry_strategy(job_type).max_retries,
                    parent,
                ],
            )?;
            let id = tx.last_insert_rowid();
            job_ids.push(id);
            parent = Some(id);
        }

        tx.execute(
            "UPDATE meetings SET status = 'queued' WHERE id = ?1",
            params![meeting_id],
        )?;
        tx.commit()?;
        Ok(job_ids)
    }

    /// Enqueue a lone fetch_transcript job with no downstream chain.
    /// Used by the safety-net backfill: those meetings keep their
    /// transcript but are only summarised on manual trigger.
    pub fn enqueue_fetch_only(
        &self,
        meeting_id: i64,
        input_data: &serde_json::Value,
        priority: i64,
    ) -> DbResult<i64> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO job_queue (job_type, meeting_id, input_data, status, priority,
                                    created_at, max_retries)
             VALUES ('fetch_transcript', ?1, ?2, 'pending', ?3, ?4, ?5)",
            params![
                meeting_id,
                input_data.to_string(),
                priority,
                Utc::now().to_rfc3339(),
                retry_strategy(JobType::FetchTranscript).max_retries,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Whether any job depends on the given one.
    pub fn has_dependent(&self, job_id: i64) -> DbResult<bool> {
        let conn = self.db.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM job_queue WHERE depends_on_job_id = ?1)",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Whether a live-or-completed fetch_transcript job exists for the
    /// meeting. When a transcript id is given the check is per
    /// (meeting, transcript) — recurring meetings reuse the meeting id.
    pub fn fetch_job_exists(
        &self,
        meeting_id: i64,
        transcript_id: Option<&str>,
    ) -> DbResult<bool> {
        let conn = self.db.lock();
        let exists: bool = match transcript_id {
            Some(tid) => conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM job_queue
                 WHERE meeting_id = ?1 AND job_type = 'fetch_transcript'
                   AND status IN ('pending', 'running', 'retrying', 'completed')
                   AND json_extract(input_data, '$.transcript_id') = ?2)",
                params![meeting_id, tid],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM job_queue
                 WHERE meeting_id = ?1 AND job_type = 'fetch_transcript'
                   AND status IN ('pending', 'running', 'retrying', 'completed'))",
                params![meeting_id],
                |row| row.get(0),
            )?,
        };
        Ok(exists)
    }

    /// Atomically claim the next runnable job for a worker.
    ///
    /// A job is runnable iff status is pending/retrying, its retry time has
    /// passed (or is unset), and its parent (if any) is completed. Selection
    /// order: priority DESC, created_at ASC. Returns None without blocking
    /// when nothing qualifies.
    pub fn claim_next(&self, worker_id: &str) -> DbResult<Option<Job>> {
        let conn = self.db.lock();
        let now = Utc::now().to_rfc3339();

        let mut stmt = conn.prepare(&format!(
            "UPDATE job_queue
             SET status = 'running', worker_id = ?1, started_at = ?2, heartbeat_at = ?2
             WHERE id = (
                 SELECT jq.id
                 FROM job_queue jq
                 LEFT JOIN job_queue parent ON jq.depends_on_job_id = parent.id
                 WHERE jq.status IN ('pending', 'retrying')
                   AND (jq.next_retry_at IS NULL OR jq.next_retry_at <= ?2)
                   AND (jq.depends_on_job_id IS NULL OR parent.status = 'completed')
                 ORDER BY jq.priority DESC, jq.created_at ASC
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        ))?;

        match stmt.query_row(params![worker_id, now], job_from_row) {
            Ok(job) => {
                tracing::info!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    meeting_id = job.meeting_id,
                    priority = job.priority,
                    retry = format!("{}/{}", job.retry_count, job.max_retries),
                    "Claimed job"
                );
                Ok(Some(job))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    /// Update the heartbeat of a running job. No-op (false) for any other
    /// status — the sidecar must never resurrect a job the recovery pass
    /// already demoted.
    pub fn update_heartbeat(&self, job_id: i64) -> DbResult<bool> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE job_queue SET heartbeat_at = ?1 WHERE id = ?2 AND status = 'running'",
            params![Utc::now().to_rfc3339(), job_id],
        )?;
        Ok(updated > 0)
    }

    /// Mark a job completed, storing its output verbatim.
    pub fn mark_completed(&self, job_id: i64, output_data: &serde_json::Value) -> DbResult<()> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE job_queue SET status = 'completed', completed_at = ?1, output_data = ?2
             WHERE id = ?3",
            params![Utc::now().to_rfc3339(), output_data.to_string(), job_id],
        )?;
        if updated == 0 {
            return Err(DbError::JobNotFound(job_id));
        }
        tracing::info!(job_id, "Job completed");
        Ok(())
    }

    /// Mark a job failed; schedule a retry when allowed, otherwise finalise
    /// the failure and fail the owning meeting.
    pub fn mark_failed(
        &self,
        job_id: i64,
        error_message: &str,
        should_retry: bool,
        output_data: Option<&serde_json::Value>,
    ) -> DbResult<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let (job_type, meeting_id, retry_count, max_retries): (JobType, Option<i64>, i64, i64) =
            tx.query_row(
                "SELECT job_type, meeting_id, retry_count, max_retries FROM job_queue WHERE id = ?1",
                params![job_id],
                |row| {
                    Ok((
                        parse_job_type(&row.get::<_, String>(0)?),
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::JobNotFound(job_id),
                other => DbError::Sqlite(other),
            })?;

        if let Some(output) = output_data {
            tx.execute(
                "UPDATE job_queue SET output_data = ?1 WHERE id = ?2",
                params![output.to_string(), job_id],
            )?;
        }

        if should_retry && retry_count < max_retries {
            let retry_at = next_retry_at(retry_count + 1, retry_strategy(job_type));
            tx.execute(
                "UPDATE job_queue SET status = 'retrying', retry_count = retry_count + 1,
                                      next_retry_at = ?1, error_message = ?2
                 WHERE id = ?3",
                params![retry_at.to_rfc3339(), error_message, job_id],
            )?;
            tracing::warn!(
                job_id,
                retry = format!("{}/{max_retries}", retry_count + 1),
                next_retry_at = %retry_at,
                error = error_message,
                "Job failed, scheduling retry"
            );
        } else {
            tx.execute(
                "UPDATE job_queue SET status = 'failed', completed_at = ?1, error_message = ?2
                 WHERE id = ?3",
                params![Utc::now().to_rfc3339(), error_message, job_id],
            )?;
            if let Some(mid) = meeting_id {
                tx.execute(
                    "UPDATE meetings SET status = ?1, error_message = ?2 WHERE id = ?3",
                    params![MeetingStatus::Failed.to_string(), error_message, mid],
                )?;
            }
            tracing::error!(job_id, error = error_message, "Job permanently failed");
        }

        tx.commit()?;
        Ok(())
    }

    /// Schedule a retry at an explicit time, bypassing the per-type backoff.
    /// Used by the transcript processor's 15/30/60 minute ceiling.
    pub fn schedule_retry_at(
        &self,
        job_id: i64,
        retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> DbResult<()> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE job_queue SET status = 'retrying', retry_count = retry_count + 1,
                                  next_retry_at = ?1, error_message = ?2
             WHERE id = ?3",
            params![retry_at.to_rfc3339(), error_message, job_id],
        )?;
        if updated == 0 {
            return Err(DbError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Demote running jobs whose heartbeat went stale (worker died without
    /// marking the job done). Stale means older than 2x the heartbeat
    /// interval. Returns the number of jobs recovered.
    pub fn recover_orphans(&self, heartbeat_interval_seconds: i64) -> DbResult<usize> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let cutoff = (Utc::now() - Duration::seconds(2 * heartbeat_interval_seconds)).to_rfc3339();
        let now = Utc::now().to_rfc3339();

        let orphans: Vec<(i64, i64, i64, Option<i64>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, retry_count, max_retries, meeting_id FROM job_queue
                 WHERE status = 'running' AND heartbeat_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for (id, retry_count, max_retries, meeting_id) in &orphans {
            if retry_count < max_retries {
                tx.execute(
                    "UPDATE job_queue SET status = 'retrying', retry_count = retry_count + 1,
                                          next_retry_at = ?1, worker_id = NULL,
                                          error_message = 'Worker heartbeat lost'
                     WHERE id = ?2",
                    params![now, id],
                )?;
                tracing::warn!(job_id = id, "Recovered orphaned job");
            } else {
                tx.execute(
                    "UPDATE job_queue SET status = 'failed', completed_at = ?1,
                                          error_message = 'Worker heartbeat lost (out of retries)'
                     WHERE id = ?2",
                    params![now, id],
                )?;
                if let Some(mid) = meeting_id {
                    tx.execute(
                        "UPDATE meetings SET status = 'failed',
                                             error_message = 'Worker heartbeat lost (out of retries)'
                         WHERE id = ?1",
                        params![mid],
                    )?;
                }
                tracing::error!(job_id = id, "Orphaned job out of retries");
            }
        }

        tx.commit()?;
        Ok(orphans.len())
    }

    /// Cancel queued (pending/retrying) jobs for a meeting.
    pub fn cancel_meeting_jobs(&self, meeting_id: i64) -> DbResult<usize> {
        let conn = self.db.lock();
        let cancelled = conn.execute(
            "UPDATE job_queue SET status = 'failed', error_message = 'Cancelled by user',
                                  completed_at = ?1
             WHERE meeting_id = ?2 AND status IN ('pending', 'retrying')",
            params![Utc::now().to_rfc3339(), meeting_id],
        )?;
        tracing::info!(meeting_id, cancelled, "Cancelled queued jobs for meeting");
        Ok(cancelled)
    }

    /// Delete terminal jobs older than the given number of days.
    pub fn cleanup_old_jobs(&self, days: i64) -> DbResult<usize> {
        let conn = self.db.lock();
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let deleted = conn.execute(
            "DELETE FROM job_queue
             WHERE status IN ('completed', 'failed') AND completed_at < ?1",
            params![cutoff],
        )?;
        tracing::info!(deleted, days, "Cleaned up old jobs");
        Ok(deleted)
    }

    /// Queue statistics for monitoring.
    pub fn stats(&self) -> DbResult<QueueStats> {
        let conn = self.db.lock();

        let total_jobs: i64 =
            conn.query_row("SELECT COUNT(*) FROM job_queue", [], |row| row.get(0))?;

        let mut by_status = HashMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM job_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            by_status.insert(status, count);
        }

        let mut by_type = HashMap::new();
        let mut stmt = conn.prepare("SELECT job_type, COUNT(*) FROM job_queue GROUP BY job_type")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (job_type, count) = row?;
            by_type.insert(job_type, count);
        }

        let oldest_pending_minutes = match conn.query_row(
            "SELECT created_at FROM job_queue WHERE status IN ('pending', 'retrying')
             ORDER BY created_at ASC LIMIT 1",
            [],
            |row| row.get::<_, String>(0),
        ) {
            Ok(ts) => Some((Utc::now() - parse_datetime(&ts)).num_minutes()),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(DbError::Sqlite(e)),
        };

        // Average wall-clock runtime of completed jobs
        let durations: Vec<f64> = {
            let mut stmt = conn.prepare(
                "SELECT started_at, completed_at FROM job_queue
                 WHERE status = 'completed' AND started_at IS NOT NULL AND completed_at IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.filter_map(Result::ok)
                .map(|(start, end)| {
                    (parse_datetime(&end) - parse_datetime(&start)).num_milliseconds() as f64
                        / 1000.0
                })
                .collect()
        };
        let avg_processing_seconds = if durations.is_empty() {
            None
        } else {
            #[allow(clippy::cast_precision_loss)]
            let avg = durations.iter().sum::<f64>() / durations.len() as f64;
            Some(avg)
        };

        Ok(QueueStats {
            total_jobs,
            by_status,
            by_type,
            oldest_pending_minutes,
            avg_processing_seconds,
        })
    }

    /// Fetch a single job by id.
    pub fn get_job(&self, job_id: i64) -> DbResult<Job> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = ?1"))?;
        stmt.query_row(params![job_id], job_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::JobNotFound(job_id),
                other => DbError::Sqlite(other),
            })
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        job_type: parse_job_type(&row.get::<_, String>(1)?),
        meeting_id: row.get(2)?,
        input_data: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        output_data: row
            .get::<_, Option<String>>(4)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        status: parse_job_status(&row.get::<_, String>(5)?),
        priority: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        started_at: row.get::<_, Option<String>>(8)?.map(|s| parse_datetime(&s)),
        completed_at: row.get::<_, Option<String>>(9)?.map(|s| parse_datetime(&s)),
        heartbeat_at: row
            .get::<_, Option<String>>(10)?
            .map(|s| parse_datetime(&s)),
        worker_id: row.get(11)?,
        retry_count: row.get(12)?,
        max_retries: row.get(13)?,
        next_retry_at: row
            .get::<_, Option<String>>(14)?
            .map(|s| parse_datetime(&s)),
        depends_on_job_id: row.get(15)?,
        error_message: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JobStatus, NewMeeting};

    fn setup() -> (Database, JobQueue, i64) {
        let db = Database::open_in_memory().unwrap();
        let meeting_id = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-A".to_string(),
                subject: "Weekly Sync".to_string(),
                ..Default::default()
            })
            .unwrap();
        let queue = JobQueue::new(db.clone());
        (db, queue, meeting_id)
    }

    #[test]
    fn test_enqueue_chain_creates_three_jobs() {
        let (db, queue, meeting_id) = setup();

        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();
        assert_eq!(ids.len(), 3);

        let fetch = queue.get_job(ids[0]).unwrap();
        let summary = queue.get_job(ids[1]).unwrap();
        let distribute = queue.get_job(ids[2]).unwrap();

        assert_eq!(fetch.job_type, JobType::FetchTranscript);
        assert_eq!(fetch.depends_on_job_id, None);
        assert_eq!(summary.depends_on_job_id, Some(fetch.id));
        assert_eq!(distribute.depends_on_job_id, Some(summary.id));
        assert_eq!(distribute.max_retries, 5);

        let meeting = db.get_meeting(meeting_id).unwrap();
        assert_eq!(meeting.status, MeetingStatus::Queued);
    }

    #[test]
    fn test_enqueue_idempotence() {
        let (_db, queue, meeting_id) = setup();

        let first = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();
        assert_eq!(first.len(), 3);

        // second enqueue refuses while the chain is live
        let second = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();
        assert!(second.is_empty());
        assert_eq!(queue.stats().unwrap().total_jobs, 3);
    }

    #[test]
    fn test_claim_respects_dependencies() {
        let (_db, queue, meeting_id) = setup();
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();

        // only the fetch job is runnable
        let job = queue.claim_next("worker-1").unwrap().unwrap();
        assert_eq!(job.id, ids[0]);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.worker_id.as_deref(), Some("worker-1"));
        assert!(job.started_at.is_some());
        assert!(job.heartbeat_at.is_some());

        // summary job is blocked until fetch completes
        assert!(queue.claim_next("worker-2").unwrap().is_none());

        queue.mark_completed(ids[0], &json!({"ok": true})).unwrap();
        let next = queue.claim_next("worker-2").unwrap().unwrap();
        assert_eq!(next.id, ids[1]);
    }

    #[test]
    fn test_claim_priority_order() {
        let db = Database::open_in_memory().unwrap();
        let queue = JobQueue::new(db.clone());
        let low = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-LOW".to_string(),
                subject: "Low".to_string(),
                ..Default::default()
            })
            .unwrap();
        let high = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-HIGH".to_string(),
                subject: "High".to_string(),
                ..Default::default()
            })
            .unwrap();

        queue
            .enqueue_transcript_chain(low, &json!({"meeting_id": low}), 5)
            .unwrap();
        let high_ids = queue
            .enqueue_transcript_chain(high, &json!({"meeting_id": high}), 10)
            .unwrap();

        let claimed = queue.claim_next("worker-1").unwrap().unwrap();
        assert_eq!(claimed.id, high_ids[0]);
    }

    #[test]
    fn test_claim_empty_queue_returns_none() {
        let (_db, queue, _meeting_id) = setup();
        assert!(queue.claim_next("worker-1").unwrap().is_none());
    }

    #[test]
    fn test_heartbeat_noop_for_non_running() {
        let (_db, queue, meeting_id) = setup();
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();

        // pending job: heartbeat is a no-op
        assert!(!queue.update_heartbeat(ids[0]).unwrap());

        queue.claim_next("worker-1").unwrap().unwrap();
        assert!(queue.update_heartbeat(ids[0]).unwrap());
    }

    #[test]
    fn test_mark_failed_schedules_retry() {
        let (_db, queue, meeting_id) = setup();
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();
        queue.claim_next("worker-1").unwrap().unwrap();

        queue.mark_failed(ids[0], "network blip", true, None).unwrap();

        let job = queue.get_job(ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retry_count, 1);
        let next = job.next_retry_at.unwrap();
        assert!(next > Utc::now());
        // not claimable until the retry time passes
        assert!(queue.claim_next("worker-2").unwrap().is_none());
    }

    #[test]
    fn test_mark_failed_exhausted_fails_meeting() {
        let (db, queue, meeting_id) = setup();
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();

        // burn through all retries
        for _ in 0..4 {
            queue
                .schedule_retry_at(ids[0], Utc::now() - Duration::seconds(1), "still failing")
                .unwrap();
        }
        let job = queue.get_job(ids[0]).unwrap();
        assert_eq!(job.retry_count, 4);

        queue
            .mark_failed(ids[0], "gave up", true, None)
            .unwrap();

        let job = queue.get_job(ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        let meeting = db.get_meeting(meeting_id).unwrap();
        assert_eq!(meeting.status, MeetingStatus::Failed);
        assert_eq!(meeting.error_message.as_deref(), Some("gave up"));
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let (_db, queue, meeting_id) = setup();
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();
        queue.claim_next("worker-1").unwrap().unwrap();

        queue
            .mark_failed(ids[0], "missing required field", false, None)
            .unwrap();

        let job = queue.get_job(ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn test_orphan_recovery_threshold() {
        let (db, queue, meeting_id) = setup();
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();
        queue.claim_next("worker-1").unwrap().unwrap();

        // fresh heartbeat: untouched
        assert_eq!(queue.recover_orphans(30).unwrap(), 0);

        // age the heartbeat past 2x the interval
        {
            let conn = db.lock();
            let stale = (Utc::now() - Duration::seconds(120)).to_rfc3339();
            conn.execute(
                "UPDATE job_queue SET heartbeat_at = ?1 WHERE id = ?2",
                params![stale, ids[0]],
            )
            .unwrap();
        }

        assert_eq!(queue.recover_orphans(30).unwrap(), 1);
        let job = queue.get_job(ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retry_count, 1);
        assert!(job.worker_id.is_none());

        // immediately claimable again
        let reclaimed = queue.claim_next("worker-2").unwrap().unwrap();
        assert_eq!(reclaimed.id, ids[0]);
    }

    #[test]
    fn test_cancel_meeting_jobs() {
        let (_db, queue, meeting_id) = setup();
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();

        // claim the first so only the two queued ones are cancellable
        queue.claim_next("worker-1").unwrap().unwrap();
        let cancelled = queue.cancel_meeting_jobs(meeting_id).unwrap();
        assert_eq!(cancelled, 2);

        let running = queue.get_job(ids[0]).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        let queued = queue.get_job(ids[1]).unwrap();
        assert_eq!(queued.status, JobStatus::Failed);
        assert_eq!(queued.error_message.as_deref(), Some("Cancelled by user"));
    }

    #[test]
    fn test_fetch_job_exists_per_transcript() {
        let (_db, queue, meeting_id) = setup();

        queue
            .enqueue_transcript_chain(
                meeting_id,
                &json!({"meeting_id": meeting_id, "transcript_id": "T-1"}),
                10,
            )
            .unwrap();

        assert!(queue.fetch_job_exists(meeting_id, Some("T-1")).unwrap());
        // a different transcript of the same (recurring) meeting is new work
        assert!(!queue.fetch_job_exists(meeting_id, Some("T-2")).unwrap());
        // meeting-level check sees the live job
        assert!(queue.fetch_job_exists(meeting_id, None).unwrap());
    }

    #[test]
    fn test_fetch_only_has_no_dependents() {
        let (_db, queue, meeting_id) = setup();

        let lone = queue
            .enqueue_fetch_only(meeting_id, &json!({"meeting_id": meeting_id}), 5)
            .unwrap();
        assert!(!queue.has_dependent(lone).unwrap());

        let chain = queue
            .enqueue_transcript_chain(meeting_id, &json!({"meeting_id": meeting_id}), 5)
            .unwrap();
        assert!(queue.has_dependent(chain[0]).unwrap());
        assert!(queue.has_dependent(chain[1]).unwrap());
        assert!(!queue.has_dependent(chain[2]).unwrap());
    }

    #[test]
    fn test_stats_counts() {
        let (_db, queue, meeting_id) = setup();
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();
        queue.claim_next("worker-1").unwrap().unwrap();
        queue.mark_completed(ids[0], &json!({})).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.by_status.get("completed"), Some(&1));
        assert_eq!(stats.by_status.get("pending"), Some(&2));
        assert!(stats.avg_processing_seconds.is_some());
        assert!(stats.oldest_pending_minutes.is_some());
    }
}
