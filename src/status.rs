use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle status of a pool.
///
/// Transitions only move forward: `NotStarted -> Started -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolStatus {
  NotStarted,
  Started,
  Stopped,
  /// A raw value outside the known states. Never produced by a correctly
  /// operating pool.
  Unknown,
}

impl PoolStatus {
  /// Human-readable name of the status.
  pub fn name(&self) -> &'static str {
    match self {
      PoolStatus::NotStarted => "not started",
      PoolStatus::Started => "started",
      PoolStatus::Stopped => "stopped",
      PoolStatus::Unknown => "unknown",
    }
  }

  fn as_raw(self) -> u8 {
    match self {
      PoolStatus::NotStarted => 0,
      PoolStatus::Started => 1,
      PoolStatus::Stopped => 2,
      PoolStatus::Unknown => u8::MAX,
    }
  }
}

impl From<u8> for PoolStatus {
  fn from(raw: u8) -> Self {
    match raw {
      0 => PoolStatus::NotStarted,
      1 => PoolStatus::Started,
      2 => PoolStatus::Stopped,
      _ => PoolStatus::Unknown,
    }
  }
}

impl fmt::Display for PoolStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Single atomic cell holding the pool status.
///
/// Written by `start`/`stop`, read on every `submit`. Sequentially consistent
/// so a `submit` and a concurrent `stop` always observe each other's writes
/// to the status and to the active-job count in one order.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
  pub(crate) fn new(status: PoolStatus) -> Self {
    Self(AtomicU8::new(status.as_raw()))
  }

  pub(crate) fn load(&self) -> PoolStatus {
    PoolStatus::from(self.0.load(Ordering::SeqCst))
  }

  /// Moves `from -> to`. On failure returns the status actually observed.
  pub(crate) fn transition(&self, from: PoolStatus, to: PoolStatus) -> Result<(), PoolStatus> {
    self
      .0
      .compare_exchange(from.as_raw(), to.as_raw(), Ordering::SeqCst, Ordering::SeqCst)
      .map(|_| ())
      .map_err(PoolStatus::from)
  }

  /// Unconditionally stores `status`, returning the previous one.
  pub(crate) fn swap(&self, status: PoolStatus) -> PoolStatus {
    PoolStatus::from(self.0.swap(status.as_raw(), Ordering::SeqCst))
  }
}

/// Point-in-time snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
  /// Unused slots in the job queue.
  pub free_job_queue_spaces: usize,
  /// Workers currently idle and registered as available.
  pub free_workers: usize,
  /// Jobs sitting in the queue, not yet handed to a worker.
  pub queued_jobs: usize,
  /// Jobs accepted by `submit` that have not finished executing.
  pub active_jobs: usize,
  /// Workers whose execution loop is still alive.
  pub running_workers: usize,
}

impl PoolStats {
  pub const FREE_JOB_QUEUE_SPACES: &'static str = "free_job_queue_spaces";
  pub const FREE_WORKERS: &'static str = "free_workers";

  /// Key/value view of the snapshot.
  pub fn as_map(&self) -> HashMap<&'static str, usize> {
    HashMap::from([
      (Self::FREE_JOB_QUEUE_SPACES, self.free_job_queue_spaces),
      (Self::FREE_WORKERS, self.free_workers),
      ("queued_jobs", self.queued_jobs),
      ("active_jobs", self.active_jobs),
      ("running_workers", self.running_workers),
    ])
  }
}
