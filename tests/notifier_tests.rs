use worker_orchestra::{
  job_fn, Job, JobCompletionInfo, JobCompletionStatus, JobError, JobFuture, Pool, PoolConfig, StopMode,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

struct PanickingJob {
  reason: &'static str,
}

impl Job for PanickingJob {
  fn execute(&mut self) -> JobFuture<'_> {
    Box::pin(async move {
      sleep(Duration::from_millis(10)).await;
      if !self.reason.is_empty() {
        panic!("{}", self.reason);
      }
      Ok(())
    })
  }
}

// Helper to initialize tracing for tests
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| EnvFilter::new("info,worker_orchestra=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

// Helper for collecting notifications in tests
fn create_collecting_handler() -> (
  Arc<Mutex<Vec<JobCompletionInfo>>>,
  impl Fn(JobCompletionInfo) + Send + Sync + 'static,
) {
  let collected_notifications = Arc::new(Mutex::new(Vec::new()));
  let collected_notifications_clone = collected_notifications.clone();
  let handler = move |info: JobCompletionInfo| {
    tracing::debug!(
      "Test Collecting Handler: Received notification for job_id: {}, status: {:?}",
      info.job_id,
      info.status
    );
    collected_notifications_clone.lock().unwrap().push(info);
  };
  (collected_notifications, handler)
}

async fn wait_for_notifications(notifications: &Arc<Mutex<Vec<JobCompletionInfo>>>, count: usize) -> bool {
  for _ in 0..200 {
    if notifications.lock().unwrap().len() >= count {
      return true;
    }
    sleep(Duration::from_millis(10)).await;
  }
  false
}

fn test_pool(pool_name: &str, max_workers: usize) -> Pool {
  Pool::with_config(
    PoolConfig::new(max_workers, 4)
      .with_name(pool_name)
      .with_drain_poll_interval(Duration::from_millis(20)),
  )
}

#[tokio::test]
async fn test_completion_notifier_success() {
  setup_tracing_for_test();
  let pool = test_pool("test_notifier_success", 1);
  let (notifications, handler) = create_collecting_handler();
  pool.add_completion_handler(handler);
  pool.start().unwrap();

  pool.submit(job_fn(|| async { Ok::<(), JobError>(()) })).unwrap();
  assert!(wait_for_notifications(&notifications, 1).await);

  let collected = notifications.lock().unwrap();
  assert_eq!(collected.len(), 1);
  let info = &collected[0];
  assert_eq!(info.status, JobCompletionStatus::Success);
  assert_eq!(info.worker_id, 1);
  assert_eq!(info.pool_name.as_str(), "test_notifier_success");
  assert!(info.error.is_none());
  drop(collected);

  pool.stop(StopMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_completion_notifier_reports_job_failure() {
  setup_tracing_for_test();
  let pool = test_pool("test_notifier_failure", 1);
  let (notifications, handler) = create_collecting_handler();
  pool.add_completion_handler(handler);
  pool.start().unwrap();

  pool
    .submit(job_fn(|| async { Err::<(), JobError>("worker error".into()) }))
    .unwrap();
  assert!(wait_for_notifications(&notifications, 1).await);

  {
    let collected = notifications.lock().unwrap();
    assert_eq!(collected[0].status, JobCompletionStatus::Failed);
    assert_eq!(collected[0].error.as_deref(), Some("error running worker 1: worker error"));
  }

  // The failure is swallowed: the pool keeps accepting and running jobs.
  pool.submit(job_fn(|| async { Ok::<(), JobError>(()) })).unwrap();
  assert!(wait_for_notifications(&notifications, 2).await);
  assert_eq!(notifications.lock().unwrap()[1].status, JobCompletionStatus::Success);

  pool.stop(StopMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_completion_notifier_reports_panics_and_worker_survives() {
  setup_tracing_for_test();
  let pool = test_pool("test_notifier_panic", 1);
  let (notifications, handler) = create_collecting_handler();
  pool.add_completion_handler(handler);
  pool.start().unwrap();

  pool
    .submit(PanickingJob {
      reason: "job intentionally panicked",
    })
    .unwrap();
  assert!(wait_for_notifications(&notifications, 1).await);
  assert_eq!(notifications.lock().unwrap()[0].status, JobCompletionStatus::Panicked);

  pool.submit(job_fn(|| async { Ok::<(), JobError>(()) })).unwrap();
  assert!(wait_for_notifications(&notifications, 2).await);
  assert_eq!(notifications.lock().unwrap()[1].status, JobCompletionStatus::Success);
  assert_eq!(pool.running_workers(), 1);

  pool.stop(StopMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_handlers_added_after_start_and_multiple_handlers() {
  setup_tracing_for_test();
  let pool = test_pool("test_notifier_multiple_handlers", 2);
  pool.start().unwrap();

  let (first_notifications, first_handler) = create_collecting_handler();
  let (second_notifications, second_handler) = create_collecting_handler();
  pool.add_completion_handler(first_handler);
  pool.add_completion_handler(second_handler);

  for _ in 0..3 {
    pool.submit(job_fn(|| async { Ok::<(), JobError>(()) })).unwrap();
  }

  assert!(wait_for_notifications(&first_notifications, 3).await);
  assert!(wait_for_notifications(&second_notifications, 3).await);

  let mut job_ids: Vec<u64> = first_notifications.lock().unwrap().iter().map(|info| info.job_id).collect();
  job_ids.sort_unstable();
  job_ids.dedup();
  assert_eq!(job_ids.len(), 3, "each job is reported exactly once per handler");

  pool.stop(StopMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_does_not_block_others() {
  setup_tracing_for_test();
  let pool = test_pool("test_notifier_handler_panic", 1);
  pool.add_completion_handler(|_| panic!("handler intentionally panicked"));
  let (notifications, handler) = create_collecting_handler();
  pool.add_completion_handler(handler);
  pool.start().unwrap();

  pool.submit(job_fn(|| async { Ok::<(), JobError>(()) })).unwrap();
  pool.submit(job_fn(|| async { Ok::<(), JobError>(()) })).unwrap();
  assert!(wait_for_notifications(&notifications, 2).await);

  pool.stop(StopMode::Graceful).await.unwrap();
}
