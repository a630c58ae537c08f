use std::fmt;
use std::time::Duration;

use tokio::runtime::Handle as TokioHandle;

/// Default interval between quiescence checks during a graceful stop.
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Default budget for a graceful stop before it gives up with `DrainTimeout`.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Construction parameters for a [`Pool`](crate::Pool).
#[derive(Clone)]
pub struct PoolConfig {
  pub name: String,
  pub max_workers: usize,
  pub max_job_queue: usize,
  pub drain_poll_interval: Duration,
  pub drain_timeout: Duration,
  /// Runtime used to spawn workers and the dispatcher. Falls back to the
  /// runtime current at `start` time.
  pub tokio_handle: Option<TokioHandle>,
}

impl PoolConfig {
  pub fn new(max_workers: usize, max_job_queue: usize) -> Self {
    Self {
      max_workers: max_workers.max(1),
      max_job_queue,
      ..Self::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
    self.drain_poll_interval = interval;
    self
  }

  pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
    self.drain_timeout = timeout;
    self
  }

  pub fn with_tokio_handle(mut self, handle: TokioHandle) -> Self {
    self.tokio_handle = Some(handle);
    self
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: "worker_pool".to_string(),
      max_workers: 1,
      max_job_queue: 0,
      drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
      drain_timeout: DEFAULT_DRAIN_TIMEOUT,
      tokio_handle: None,
    }
  }
}

impl fmt::Debug for PoolConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolConfig")
      .field("name", &self.name)
      .field("max_workers", &self.max_workers)
      .field("max_job_queue", &self.max_job_queue)
      .field("drain_poll_interval", &self.drain_poll_interval)
      .field("drain_timeout", &self.drain_timeout)
      .field("tokio_handle_is_some", &self.tokio_handle.is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_and_builders() {
    let config = PoolConfig::new(0, 3)
      .with_name("cfg_pool")
      .with_drain_poll_interval(Duration::from_millis(20))
      .with_drain_timeout(Duration::from_secs(1));

    assert_eq!(config.max_workers, 1, "worker count is clamped to at least one");
    assert_eq!(config.max_job_queue, 3);
    assert_eq!(config.name, "cfg_pool");
    assert_eq!(config.drain_poll_interval, Duration::from_millis(20));
    assert_eq!(config.drain_timeout, Duration::from_secs(1));
    assert!(config.tokio_handle.is_none());

    let default = PoolConfig::default();
    assert_eq!(default.drain_poll_interval, DEFAULT_DRAIN_POLL_INTERVAL);
    assert_eq!(default.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
  }
}
