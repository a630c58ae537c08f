//! A Tokio-based bounded worker pool: a fixed set of workers drains a
//! capacity-limited job queue, with graceful drain and immediate stop.

mod config;
mod error;
mod job;
mod notifier;
mod pool;
mod status;
mod worker;

pub use config::{PoolConfig, DEFAULT_DRAIN_POLL_INTERVAL, DEFAULT_DRAIN_TIMEOUT};
pub use error::{JobError, PoolError};
pub use job::{job_fn, FnJob, Job, JobFuture, WorkerId};
pub use notifier::{JobCompletionInfo, JobCompletionStatus};
pub use pool::{Pool, StopMode};
pub use status::{PoolStats, PoolStatus};
