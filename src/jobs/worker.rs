//! Job worker
//!
//! Claims jobs up to a concurrency bound and runs them under a timeout.
//! Each active job gets a heartbeat sidecar; the sidecar only stamps
//! heartbeat_at, never status, so it cannot fight orphan recovery.

use crate::config::AppSettings;
use crate::db::Job;
use crate::jobs::processors::{ProcessorOutcome, ProcessorRegistry};
use crate::jobs::queue::JobQueue;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Interval between orphan recovery passes inside the worker loop.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for in-flight jobs at shutdown. Jobs still running after
/// this are abandoned; orphan recovery reclaims them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct JobWorker {
    queue: JobQueue,
    registry: Arc<ProcessorRegistry>,
    worker_id: String,
    running: Arc<AtomicBool>,
    max_concurrent: usize,
    job_timeout: Duration,
    heartbeat_interval: Duration,
}

impl JobWorker {
    pub fn new(queue: JobQueue, registry: Arc<ProcessorRegistry>, settings: &AppSettings) -> Self {
        let worker_id = format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        tracing::info!(
            worker_id,
            max_concurrent = settings.max_concurrent_jobs,
            timeout_minutes = settings.job_timeout_minutes,
            "Worker initialized"
        );
        Self {
            queue,
            registry,
            worker_id,
            running: Arc::new(AtomicBool::new(false)),
            max_concurrent: settings.max_concurrent_jobs,
            job_timeout: Duration::from_secs(settings.job_timeout_minutes * 60),
            heartbeat_interval: Duration::from_secs(settings.worker_heartbeat_interval_seconds),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Main worker loop: fill free slots, reap finished tasks, run the
    /// periodic orphan recovery, repeat until stopped.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut last_recovery = Instant::now();

        tracing::info!(worker_id = self.worker_id, "Worker started");

        while self.running.load(Ordering::SeqCst) {
            while tasks.try_join_next().is_some() {}

            while tasks.len() < self.max_concurrent {
                match self.queue.claim_next(&self.worker_id) {
                    Ok(Some(job)) => {
                        let worker = self.clone();
                        tasks.spawn(async move { worker.execute_job(job).await });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // store unavailable: keep the loop alive and retry
                        tracing::error!(error = %e, "Claim failed");
                        break;
                    }
                }
            }

            if last_recovery.elapsed() >= RECOVERY_INTERVAL {
                let interval_seconds = self.heartbeat_interval.as_secs() as i64;
                match self.queue.recover_orphans(interval_seconds) {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count, "Recovered orphaned jobs"),
                    Err(e) => tracing::error!(error = %e, "Orphan recovery failed"),
                }
                last_recovery = Instant::now();
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        // graceful shutdown: bounded wait for in-flight jobs
        if !tasks.is_empty() {
            tracing::info!(active = tasks.len(), "Waiting for active jobs to finish");
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while !tasks.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tracing::warn!(
                        abandoned = tasks.len(),
                        "Jobs did not finish within shutdown grace"
                    );
                    break;
                }
                if tokio::time::timeout(remaining, tasks.join_next())
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        abandoned = tasks.len(),
                        "Jobs did not finish within shutdown grace"
                    );
                    break;
                }
            }
        }

        tracing::info!(worker_id = self.worker_id, "Worker stopped");
    }

    /// Run one claimed job: heartbeat sidecar, processor under timeout,
    /// completion/failure bookkeeping.
    pub(crate) async fn execute_job(&self, job: Job) {
        tracing::info!(
            job_id = job.id,
            job_type = %job.job_type,
            meeting_id = job.meeting_id,
            "Processing job"
        );

        let Some(processor) = self.registry.get(job.job_type) else {
            let message = format!("No processor registered for job type: {}", job.job_type);
            tracing::error!(job_id = job.id, message);
            if let Err(e) = self.queue.mark_failed(job.id, &message, false, None) {
                tracing::error!(job_id = job.id, error = %e, "Failed to record failure");
            }
            return;
        };

        let heartbeat = {
            let queue = self.queue.clone();
            let job_id = job.id;
            let interval = self.heartbeat_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match queue.update_heartbeat(job_id) {
                        Ok(true) => tracing::debug!(job_id, "Heartbeat updated"),
                        // job left running state; stop the sidecar
                        Ok(false) => break,
                        Err(e) => {
                            tracing::warn!(job_id, error = %e, "Heartbeat update failed");
                            break;
                        }
                    }
                }
            })
        };

        let result = tokio::time::timeout(self.job_timeout, processor.process(&job)).await;
        heartbeat.abort();

        let outcome = match result {
            Ok(Ok(ProcessorOutcome::Completed(output))) => self.queue.mark_completed(job.id, &output),
            Ok(Ok(ProcessorOutcome::Deferred)) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(job_id = job.id, error = %e, "Job failed");
                self.queue.mark_failed(
                    job.id,
                    &e.to_string(),
                    e.should_retry(),
                    Some(&json!({ "error": e.to_string() })),
                )
            }
            Err(_) => {
                let message = format!(
                    "Job timed out after {} seconds",
                    self.job_timeout.as_secs()
                );
                tracing::error!(job_id = job.id, message);
                self.queue.mark_failed(job.id, &message, true, None)
            }
        };

        if let Err(e) = outcome {
            tracing::error!(job_id = job.id, error = %e, "Failed to record job result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, JobStatus, JobType, NewMeeting};
    use crate::jobs::processors::{Processor, ProcessorError};
    use async_trait::async_trait;

    struct SucceedingProcessor;

    #[async_trait]
    impl Processor for SucceedingProcessor {
        async fn process(&self, job: &Job) -> Result<ProcessorOutcome, ProcessorError> {
            Ok(ProcessorOutcome::Completed(json!({ "job": job.id })))
        }
    }

    struct SlowProcessor;

    #[async_trait]
    impl Processor for SlowProcessor {
        async fn process(&self, _job: &Job) -> Result<ProcessorOutcome, ProcessorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ProcessorOutcome::Completed(json!({})))
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl Processor for FailingProcessor {
        async fn process(&self, _job: &Job) -> Result<ProcessorOutcome, ProcessorError> {
            Err(ProcessorError::NonRetryable("bad input".to_string()))
        }
    }

    fn setup(processor: Arc<dyn Processor>) -> (Database, JobQueue, JobWorker, i64) {
        let db = Database::open_in_memory().unwrap();
        let queue = JobQueue::new(db.clone());
        let meeting_id = db
            .insert_meeting(&NewMeeting {
                meeting_id: "MTG-A".to_string(),
                subject: "Sync".to_string(),
                ..Default::default()
            })
            .unwrap();

        let mut registry = ProcessorRegistry::new();
        registry.register(JobType::FetchTranscript, processor);

        let settings = AppSettings::default();
        let worker = JobWorker::new(queue.clone(), Arc::new(registry), &settings);
        (db, queue, worker, meeting_id)
    }

    #[tokio::test]
    async fn test_execute_job_success() {
        let (_db, queue, worker, meeting_id) = setup(Arc::new(SucceedingProcessor));
        queue
            .enqueue_transcript_chain(meeting_id, &json!({"meeting_id": meeting_id}), 5)
            .unwrap();

        let job = queue.claim_next(&worker.worker_id).unwrap().unwrap();
        let job_id = job.id;
        worker.execute_job(job).await;

        let job = queue.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output_data.unwrap()["job"], job_id);
    }

    #[tokio::test]
    async fn test_execute_job_timeout_schedules_retry() {
        let (_db, queue, mut worker, meeting_id) = setup(Arc::new(SlowProcessor));
        worker.job_timeout = Duration::from_millis(50);
        queue
            .enqueue_transcript_chain(meeting_id, &json!({"meeting_id": meeting_id}), 5)
            .unwrap();

        let job = queue.claim_next(&worker.worker_id).unwrap().unwrap();
        let job_id = job.id;
        worker.execute_job(job).await;

        let job = queue.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert!(job.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_execute_job_non_retryable_failure() {
        let (db, queue, worker, meeting_id) = setup(Arc::new(FailingProcessor));
        queue
            .enqueue_transcript_chain(meeting_id, &json!({"meeting_id": meeting_id}), 5)
            .unwrap();

        let job = queue.claim_next(&worker.worker_id).unwrap().unwrap();
        let job_id = job.id;
        worker.execute_job(job).await;

        let job = queue.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            db.get_meeting(meeting_id).unwrap().status,
            crate::db::MeetingStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_missing_processor_fails_job() {
        let (_db, queue, worker, meeting_id) = setup(Arc::new(SucceedingProcessor));
        // enqueue a chain; the summary job has no registered processor
        let ids = queue.enqueue_meeting_chain(meeting_id, 5).unwrap();

        let fetch = queue.claim_next(&worker.worker_id).unwrap().unwrap();
        worker.execute_job(fetch).await;

        let summary = queue.claim_next(&worker.worker_id).unwrap().unwrap();
        assert_eq!(summary.id, ids[1]);
        worker.execute_job(summary).await;

        let job = queue.get_job(ids[1]).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("No processor"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_loop_stops() {
        let (_db, _queue, worker, _meeting_id) = setup(Arc::new(SucceedingProcessor));

        let runner = worker.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
