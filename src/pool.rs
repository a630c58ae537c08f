use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::job::{ActiveJobGuard, Job, QueuedJob};
use crate::notifier::{CompletionNotifier, JobCompletionInfo};
use crate::status::{PoolStats, PoolStatus, StatusCell};
use crate::worker::{JobSlot, Worker};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kanal::{AsyncReceiver, AsyncSender};
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Defines how [`Pool::stop`] treats outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
  /// Waits until the queue is empty and every worker is idle, then stops the
  /// workers. Gives up with `PoolError::DrainTimeout` after the configured
  /// budget, leaving the workers running.
  Graceful,
  /// Signals every worker right away. Jobs already handed to a worker finish;
  /// queued jobs are abandoned.
  Immediate,
}

impl From<bool> for StopMode {
  /// `true` selects the graceful drain.
  fn from(graceful: bool) -> Self {
    if graceful {
      StopMode::Graceful
    } else {
      StopMode::Immediate
    }
  }
}

/// A fixed set of workers draining a capacity-limited job queue.
///
/// Lifecycle: `NotStarted -> Started -> Stopped`. Jobs are only accepted while
/// started. Wrap the pool in an `Arc` to submit from several tasks.
pub struct Pool {
  config: PoolConfig,
  pool_name: Arc<String>,
  status: StatusCell,
  job_tx: AsyncSender<QueuedJob>,
  job_rx: AsyncReceiver<QueuedJob>,
  available_tx: AsyncSender<JobSlot>,
  available_rx: AsyncReceiver<JobSlot>,
  /// Idle workers taken out of the registry by the dispatcher while it waits
  /// for a job. Still free from the caller's point of view.
  reserved_workers: Arc<AtomicUsize>,
  active_jobs: Arc<AtomicUsize>,
  workers: Mutex<Vec<Worker>>,
  notifier: CompletionNotifier,
  shutdown_token: CancellationToken,
  dispatcher_join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
  /// Creates a pool with default settings. Workers are not running until
  /// [`start`](Self::start) is called.
  pub fn new(max_workers: usize, max_job_queue: usize) -> Self {
    Self::with_config(PoolConfig::new(max_workers, max_job_queue))
  }

  pub fn with_config(config: PoolConfig) -> Self {
    let mut config = config;
    config.max_workers = config.max_workers.max(1);

    // A zero-capacity queue rejects every submit before touching the channel.
    let (job_tx, job_rx) = kanal::bounded_async(config.max_job_queue.max(1));
    let (available_tx, available_rx) = kanal::bounded_async(config.max_workers);
    let pool_name = Arc::new(config.name.clone());

    debug!(
      pool_name = %*pool_name,
      max_workers = config.max_workers,
      max_job_queue = config.max_job_queue,
      "Pool created."
    );

    Self {
      notifier: CompletionNotifier::new(pool_name.clone()),
      config,
      pool_name,
      status: StatusCell::new(PoolStatus::NotStarted),
      job_tx,
      job_rx,
      available_tx,
      available_rx,
      reserved_workers: Arc::new(AtomicUsize::new(0)),
      active_jobs: Arc::new(AtomicUsize::new(0)),
      workers: Mutex::new(Vec::new()),
      shutdown_token: CancellationToken::new(),
      dispatcher_join_handle: Mutex::new(None),
    }
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn max_workers(&self) -> usize {
    self.config.max_workers
  }

  pub fn max_job_queue(&self) -> usize {
    self.config.max_job_queue
  }

  pub fn status(&self) -> PoolStatus {
    self.status.load()
  }

  /// Number of workers created by `start`.
  pub fn worker_count(&self) -> usize {
    self.workers.lock().len()
  }

  /// Number of workers whose execution loop has not exited yet.
  pub fn running_workers(&self) -> usize {
    self.workers.lock().iter().filter(|worker| worker.is_running()).count()
  }

  pub fn stats(&self) -> PoolStats {
    let queued_jobs = self.job_tx.len();
    PoolStats {
      free_job_queue_spaces: self.config.max_job_queue.saturating_sub(queued_jobs),
      free_workers: self.free_workers(),
      queued_jobs,
      active_jobs: self.active_jobs.load(Ordering::Acquire),
      running_workers: self.running_workers(),
    }
  }

  /// Registers a handler invoked once for every job a worker finishes.
  pub fn add_completion_handler(&self, handler: impl Fn(JobCompletionInfo) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  /// Spawns the workers and the dispatcher.
  ///
  /// # Errors
  /// `PoolError::AlreadyStarted` unless the pool is `NotStarted`.
  /// `PoolError::RuntimeUnavailable` when called outside a Tokio runtime and
  /// no handle was configured.
  pub fn start(&self) -> Result<(), PoolError> {
    let tokio_handle = match &self.config.tokio_handle {
      Some(handle) => handle.clone(),
      None => TokioHandle::try_current().map_err(|_| PoolError::RuntimeUnavailable)?,
    };

    if let Err(status) = self.status.transition(PoolStatus::NotStarted, PoolStatus::Started) {
      warn!(pool_name = %self.pool_name, %status, "Start requested on a pool that is not in 'not started' state.");
      return Err(PoolError::AlreadyStarted { status });
    }

    let completions = self.notifier.start(&tokio_handle);
    {
      let mut workers = self.workers.lock();
      for id in 1..=self.config.max_workers {
        let mut worker = Worker::new(
          id,
          self.pool_name.clone(),
          self.available_tx.clone(),
          completions.clone(),
        );
        worker.start(&tokio_handle);
        workers.push(worker);
      }
    }

    let dispatcher = Self::run_dispatch_loop(
      self.job_rx.clone(),
      self.available_rx.clone(),
      self.reserved_workers.clone(),
      self.shutdown_token.clone(),
    )
    .instrument(info_span!("pool_dispatcher", pool_name = %self.pool_name));
    *self.dispatcher_join_handle.lock() = Some(tokio_handle.spawn(dispatcher));

    info!(pool_name = %self.pool_name, workers = self.config.max_workers, "Pool started.");
    Ok(())
  }

  /// Enqueues a job. Never waits for a worker.
  ///
  /// # Errors
  /// `PoolError::NotAcceptingJobs` unless the pool is `Started`.
  /// `PoolError::QueueFull` when the queue already holds `max_job_queue` jobs.
  pub fn submit<J: Job>(&self, job: J) -> Result<(), PoolError> {
    self.submit_boxed(Box::new(job))
  }

  pub fn submit_boxed(&self, job: Box<dyn Job>) -> Result<(), PoolError> {
    // Counted as active before the status is read, so a graceful stop that
    // flips the status afterwards cannot observe the pool as drained while
    // this job is still on its way into the queue.
    let guard = ActiveJobGuard::acquire(&self.active_jobs);

    let status = self.status.load();
    if status != PoolStatus::Started {
      debug!(pool_name = %self.pool_name, %status, "Submit: rejected, pool is not accepting jobs.");
      return Err(PoolError::NotAcceptingJobs { status });
    }

    let queued_jobs = self.job_tx.len();
    if queued_jobs >= self.config.max_job_queue {
      debug!(pool_name = %self.pool_name, queued_jobs, "Submit: rejected, job queue is full.");
      return Err(PoolError::QueueFull { queued: queued_jobs });
    }

    let queued = QueuedJob::new(job, guard);
    let job_id = queued.job_id;

    // try_send keeps a concurrent submitter that slipped past the length check
    // from blocking; it gets QueueFull instead.
    match self.job_tx.try_send(queued) {
      Ok(true) => {
        debug!(pool_name = %self.pool_name, %job_id, "Job queued.");
        Ok(())
      }
      Ok(false) => {
        let queued_now = self.job_tx.len();
        debug!(pool_name = %self.pool_name, %job_id, queued_now, "Submit: lost the race for the last queue slot.");
        Err(PoolError::QueueFull { queued: queued_now })
      }
      Err(send_error) => {
        error!(pool_name = %self.pool_name, %job_id, "Submit: job queue closed unexpectedly: {:?}", send_error);
        Err(PoolError::NotAcceptingJobs {
          status: self.status.load(),
        })
      }
    }
  }

  /// Stops the pool. The status flips to `Stopped` before this returns in
  /// every mode, so no later `submit` succeeds.
  ///
  /// # Errors
  /// `PoolError::DrainTimeout` when a graceful stop does not observe an empty
  /// queue and idle workers within the drain budget. The workers keep running
  /// in that case; retry `stop` or escalate to `StopMode::Immediate`.
  pub async fn stop(&self, mode: impl Into<StopMode>) -> Result<(), PoolError> {
    let mode = mode.into();
    let previous = self.status.swap(PoolStatus::Stopped);
    info!(pool_name = %self.pool_name, ?mode, previous = %previous, "Stopping pool.");

    if previous == PoolStatus::NotStarted {
      info!(pool_name = %self.pool_name, "Pool was never started, nothing to stop.");
      return Ok(());
    }

    match mode {
      StopMode::Immediate => self.signal_shutdown(),
      StopMode::Graceful => self.drain_and_stop().await?,
    }
    self.join_dispatcher().await;
    Ok(())
  }

  async fn drain_and_stop(&self) -> Result<(), PoolError> {
    if self.shutdown_token.is_cancelled() {
      trace!(pool_name = %self.pool_name, "Workers already signalled, nothing to drain.");
      return Ok(());
    }

    let started_at = Instant::now();
    let mut ticker = tokio::time::interval(self.config.drain_poll_interval.max(Duration::from_millis(1)));

    loop {
      ticker.tick().await;

      if self.is_quiescent() {
        self.signal_shutdown();
        info!(
          pool_name = %self.pool_name,
          elapsed = ?started_at.elapsed(),
          "Queue drained and all workers idle. Workers signalled to stop."
        );
        return Ok(());
      }

      let elapsed = started_at.elapsed();
      if elapsed >= self.config.drain_timeout {
        warn!(
          pool_name = %self.pool_name,
          ?elapsed,
          stats = ?self.stats(),
          "Graceful stop gave up waiting for the queue to drain. Workers left running."
        );
        return Err(PoolError::DrainTimeout { elapsed });
      }

      trace!(pool_name = %self.pool_name, stats = ?self.stats(), "Still draining.");
    }
  }

  fn is_quiescent(&self) -> bool {
    self.job_tx.is_empty()
      && self.active_jobs.load(Ordering::SeqCst) == 0
      && self.free_workers() == self.config.max_workers
  }

  // The two counters are read separately, so a worker moving between them
  // can be seen twice; clamp to the worker count.
  fn free_workers(&self) -> usize {
    let free = self.available_rx.len() + self.reserved_workers.load(Ordering::Acquire);
    free.min(self.config.max_workers)
  }

  fn signal_shutdown(&self) {
    self.shutdown_token.cancel();
    for worker in self.workers.lock().iter() {
      debug!(pool_name = %self.pool_name, worker_id = worker.id(), "Stop signal sent to worker.");
      worker.stop();
    }
  }

  async fn join_dispatcher(&self) {
    let handle_to_await = self.dispatcher_join_handle.lock().take();

    if let Some(handle) = handle_to_await {
      if let Err(join_error) = handle.await {
        error!(pool_name = %self.pool_name, "Error joining dispatcher loop: {:?}", join_error);
      } else {
        debug!(pool_name = %self.pool_name, "Dispatcher loop joined.");
      }
    }
  }

  /// Pairs the next idle worker with the next queued job, one hand-off at a
  /// time. A worker is claimed first so a job only leaves the queue once some
  /// worker can take it.
  async fn run_dispatch_loop(
    job_rx: AsyncReceiver<QueuedJob>,
    available_rx: AsyncReceiver<JobSlot>,
    reserved_workers: Arc<AtomicUsize>,
    shutdown_token: CancellationToken,
  ) {
    info!("Dispatcher loop started.");

    loop {
      let slot = tokio::select! {
        biased;
        _ = shutdown_token.cancelled() => break,
        received = available_rx.recv() => match received {
          Ok(slot) => slot,
          Err(_) => {
            error!("Availability registry closed. Dispatcher exiting.");
            break;
          }
        },
      };
      reserved_workers.fetch_add(1, Ordering::AcqRel);

      let queued = tokio::select! {
        biased;
        _ = shutdown_token.cancelled() => {
          reserved_workers.fetch_sub(1, Ordering::AcqRel);
          break;
        }
        received = job_rx.recv() => match received {
          Ok(queued) => queued,
          Err(_) => {
            reserved_workers.fetch_sub(1, Ordering::AcqRel);
            error!("Job queue closed. Dispatcher exiting.");
            break;
          }
        },
      };

      // Released before delivery: once the job lands in the slot the worker may
      // finish it and register again.
      reserved_workers.fetch_sub(1, Ordering::AcqRel);

      let job_id = queued.job_id;
      if slot.send(queued).await.is_err() {
        warn!(%job_id, "Worker slot closed before delivery, job abandoned.");
      } else {
        trace!(%job_id, "Job handed to worker.");
      }
    }

    info!("Dispatcher loop stopped.");
  }
}

impl std::fmt::Debug for Pool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Pool")
      .field("name", &self.pool_name)
      .field("status", &self.status())
      .field("max_workers", &self.config.max_workers)
      .field("max_job_queue", &self.config.max_job_queue)
      .field("stats", &self.stats())
      .field("notifier", &self.notifier)
      .finish()
  }
}

impl Drop for Pool {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.pool_name,
        "Pool dropped without stop. Signalling workers and dispatcher."
      );
      self.status.swap(PoolStatus::Stopped);
      self.shutdown_token.cancel();
      for worker in self.workers.get_mut().iter() {
        worker.stop();
      }
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: Pool already stopped.");
    }
  }
}
