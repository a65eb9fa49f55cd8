//! Job processors
//!
//! One processor per job type behind a single-method seam. The worker
//! resolves processors from the registry and owns completion/failure
//! bookkeeping; a processor that reschedules its own job reports Deferred.

pub mod distribution;
pub mod summary;
pub mod transcript;

use crate::db::{DbError, Job, JobType};
use crate::graph::GraphError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Transient failure; the queue should schedule a retry.
    #[error("{0}")]
    Retryable(String),
    /// Malformed input or a permanent condition; retrying cannot help.
    #[error("{0}")]
    NonRetryable(String),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

impl ProcessorError {
    pub fn should_retry(&self) -> bool {
        match self {
            ProcessorError::Retryable(_) | ProcessorError::Db(_) => true,
            ProcessorError::NonRetryable(_) => false,
        }
    }
}

impl From<GraphError> for ProcessorError {
    fn from(err: GraphError) -> Self {
        if err.is_retryable() {
            ProcessorError::Retryable(err.to_string())
        } else {
            ProcessorError::NonRetryable(err.to_string())
        }
    }
}

/// What happened to the job.
#[derive(Debug)]
pub enum ProcessorOutcome {
    /// Finished; the worker records this as the job's output_data.
    Completed(serde_json::Value),
    /// The processor already rescheduled or finalised the job itself
    /// (bounded transcript retries); the worker must leave it alone.
    Deferred,
}

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<ProcessorOutcome, ProcessorError>;
}

/// Registry keyed by job type.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType, processor: Arc<dyn Processor>) {
        tracing::info!(%job_type, "Registered processor");
        self.processors.insert(job_type, processor);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn Processor>> {
        self.processors.get(&job_type).cloned()
    }
}

/// The meeting id a job refers to, from the row or its payload.
pub(crate) fn job_meeting_id(job: &Job) -> Result<i64, ProcessorError> {
    job.meeting_id
        .or_else(|| {
            job.input_data
                .as_ref()
                .and_then(|d| d.get("meeting_id"))
                .and_then(serde_json::Value::as_i64)
        })
        .ok_or_else(|| ProcessorError::NonRetryable(format!("Job {} has no meeting_id", job.id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retry_classification() {
        assert!(ProcessorError::Retryable("x".to_string()).should_retry());
        assert!(!ProcessorError::NonRetryable("x".to_string()).should_retry());

        let from_graph: ProcessorError = GraphError::Server {
            status: 503,
            message: String::new(),
        }
        .into();
        assert!(from_graph.should_retry());

        let from_graph: ProcessorError = GraphError::NotFound(String::new()).into();
        assert!(!from_graph.should_retry());
    }

    struct NoopProcessor;

    #[async_trait]
    impl Processor for NoopProcessor {
        async fn process(&self, _job: &Job) -> Result<ProcessorOutcome, ProcessorError> {
            Ok(ProcessorOutcome::Completed(serde_json::json!({})))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProcessorRegistry::new();
        registry.register(JobType::FetchTranscript, Arc::new(NoopProcessor));

        assert!(registry.get(JobType::FetchTranscript).is_some());
        assert!(registry.get(JobType::Distribute).is_none());
    }
}
