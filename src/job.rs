use crate::error::JobError;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

lazy_static::lazy_static! {
  static ref NEXT_JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Identity of a worker within its pool, assigned `1..=max_workers`.
pub type WorkerId = usize;

/// The future returned by [`Job::execute`].
pub type JobFuture<'a> = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send + 'a>>;

/// A unit of work the pool can run.
///
/// The pool never inspects a job; it only calls `set_worker_id` and then
/// `execute` once on whichever worker receives it.
pub trait Job: Send + 'static {
  fn execute(&mut self) -> JobFuture<'_>;

  /// Called by the worker right before `execute`. Informational only.
  fn set_worker_id(&mut self, _worker_id: WorkerId) {}
}

/// A [`Job`] built from a closure returning a future. See [`job_fn`].
pub struct FnJob<F> {
  f: F,
}

/// Wraps a closure as a job.
///
/// ```ignore
/// pool.submit(job_fn(|| async { Ok::<(), JobError>(()) }))?;
/// ```
pub fn job_fn<F, Fut>(f: F) -> FnJob<F>
where
  F: FnMut() -> Fut + Send + 'static,
  Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
  FnJob { f }
}

impl<F, Fut> Job for FnJob<F>
where
  F: FnMut() -> Fut + Send + 'static,
  Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
  fn execute(&mut self) -> JobFuture<'_> {
    Box::pin((self.f)())
  }
}

impl<F> fmt::Debug for FnJob<F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnJob").finish_non_exhaustive()
  }
}

/// Decrements the pool's count of unfinished jobs when dropped.
///
/// Travels with the job from `submit` until the worker is done with it, so a
/// job abandoned anywhere along the way is still accounted for.
#[derive(Debug)]
pub(crate) struct ActiveJobGuard {
  active: Arc<AtomicUsize>,
}

impl ActiveJobGuard {
  pub(crate) fn acquire(active: &Arc<AtomicUsize>) -> Self {
    active.fetch_add(1, Ordering::SeqCst);
    Self { active: active.clone() }
  }
}

impl Drop for ActiveJobGuard {
  fn drop(&mut self) {
    self.active.fetch_sub(1, Ordering::AcqRel);
  }
}

/// Internal representation of a job accepted by the pool.
pub(crate) struct QueuedJob {
  pub(crate) job_id: u64,
  pub(crate) job: Box<dyn Job>,
  _guard: ActiveJobGuard,
}

impl QueuedJob {
  pub(crate) fn new(job: Box<dyn Job>, guard: ActiveJobGuard) -> Self {
    Self {
      job_id: NEXT_JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
      job,
      _guard: guard,
    }
  }
}

impl fmt::Debug for QueuedJob {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueuedJob")
      .field("job_id", &self.job_id)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_fn_job_runs_closure_each_time() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let mut job = job_fn(move || {
      let calls = calls_clone.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<(), JobError>(())
      }
    });

    job.execute().await.unwrap();
    job.execute().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_active_guard_tracks_lifetime() {
    let active = Arc::new(AtomicUsize::new(0));
    let first = QueuedJob::new(Box::new(job_fn(|| async { Ok::<(), JobError>(()) })), ActiveJobGuard::acquire(&active));
    let second = QueuedJob::new(Box::new(job_fn(|| async { Ok::<(), JobError>(()) })), ActiveJobGuard::acquire(&active));
    assert_eq!(active.load(Ordering::SeqCst), 2);
    assert!(second.job_id > first.job_id);

    drop(first);
    assert_eq!(active.load(Ordering::SeqCst), 1);
    drop(second);
    assert_eq!(active.load(Ordering::SeqCst), 0);
  }
}
