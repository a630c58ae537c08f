use crate::job::WorkerId;
use crate::status::PoolStatus;

use std::time::Duration;

use thiserror::Error;

/// Error type returned by a job's `execute` future.
pub type JobError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur within the `worker_orchestra` pool.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  #[error("job queue have status: {status}")]
  NotAcceptingJobs { status: PoolStatus },

  #[error("job queue is full, it have {queued} jobs")]
  QueueFull { queued: usize },

  #[error("checking queue status exceeded retry limit: {elapsed:?}")]
  DrainTimeout { elapsed: Duration },

  #[error("pool cannot be started, it have status: {status}")]
  AlreadyStarted { status: PoolStatus },

  #[error("No Tokio runtime available to spawn pool workers")]
  RuntimeUnavailable,

  #[error("error running worker {worker_id}: {reason}")]
  JobFailed { worker_id: WorkerId, reason: String },

  #[error("job panicked on worker {worker_id}")]
  JobPanicked { worker_id: WorkerId },
}
