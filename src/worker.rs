use crate::error::PoolError;
use crate::job::{QueuedJob, WorkerId};
use crate::notifier::{CompletionSender, InternalCompletionMessage};

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use kanal::{AsyncReceiver, AsyncSender};
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Single-slot delivery channel used to hand one worker its next job.
pub(crate) type JobSlot = AsyncSender<QueuedJob>;

/// One execution lane of the pool.
///
/// While idle the worker parks its [`JobSlot`] in the pool's availability
/// registry; the dispatcher takes the slot out, drops a job into it, and the
/// worker re-registers once that job has finished.
pub(crate) struct Worker {
  id: WorkerId,
  pool_name: Arc<String>,
  slot_tx: JobSlot,
  slot_rx: Option<AsyncReceiver<QueuedJob>>,
  available_tx: AsyncSender<JobSlot>,
  completions: Option<CompletionSender>,
  stop_token: CancellationToken,
  running: Arc<AtomicBool>,
}

impl fmt::Debug for Worker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Worker")
      .field("id", &self.id)
      .field("pool_name", &self.pool_name)
      .field("started", &self.slot_rx.is_none())
      .field("running", &self.is_running())
      .field("stop_requested", &self.stop_token.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl Worker {
  pub(crate) fn new(
    id: WorkerId,
    pool_name: Arc<String>,
    available_tx: AsyncSender<JobSlot>,
    completions: Option<CompletionSender>,
  ) -> Self {
    let (slot_tx, slot_rx) = kanal::bounded_async(1);
    Self {
      id,
      pool_name,
      slot_tx,
      slot_rx: Some(slot_rx),
      available_tx,
      completions,
      stop_token: CancellationToken::new(),
      running: Arc::new(AtomicBool::new(false)),
    }
  }

  pub(crate) fn id(&self) -> WorkerId {
    self.id
  }

  pub(crate) fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  /// Spawns the execution loop. Returns `None` if the loop was already spawned.
  pub(crate) fn start(&mut self, tokio_handle: &TokioHandle) -> Option<JoinHandle<()>> {
    let Some(slot_rx) = self.slot_rx.take() else {
      warn!(pool_name = %*self.pool_name, worker_id = self.id, "Worker already started, ignoring start request.");
      return None;
    };

    self.running.store(true, Ordering::Release);

    let loop_future = Self::run_loop(
      self.id,
      self.pool_name.clone(),
      self.slot_tx.clone(),
      slot_rx,
      self.available_tx.clone(),
      self.completions.take(),
      self.stop_token.clone(),
      self.running.clone(),
    );

    Some(tokio_handle.spawn(loop_future.instrument(info_span!(
      "pool_worker",
      pool_name = %*self.pool_name,
      worker_id = self.id
    ))))
  }

  /// Signals the worker to stop. Returns immediately; a job in flight is
  /// finished before the loop exits.
  pub(crate) fn stop(&self) {
    self.stop_token.cancel();
  }

  #[allow(clippy::too_many_arguments)]
  async fn run_loop(
    id: WorkerId,
    pool_name: Arc<String>,
    slot_tx: JobSlot,
    slot_rx: AsyncReceiver<QueuedJob>,
    available_tx: AsyncSender<JobSlot>,
    mut completions: Option<CompletionSender>,
    stop_token: CancellationToken,
    running: Arc<AtomicBool>,
  ) {
    info!("Worker loop started.");

    loop {
      if stop_token.is_cancelled() {
        break;
      }

      // Register as available.
      let registered = tokio::select! {
        biased;
        _ = stop_token.cancelled() => break,
        sent = available_tx.send(slot_tx.clone()) => sent,
      };
      if registered.is_err() {
        warn!("Availability registry closed. Worker loop exiting.");
        break;
      }
      trace!("Worker registered as available.");

      // A job that already reached the slot wins over a concurrent stop signal.
      let queued = tokio::select! {
        biased;
        received = slot_rx.recv() => match received {
          Ok(queued) => queued,
          Err(_) => {
            warn!("Job slot closed. Worker loop exiting.");
            break;
          }
        },
        _ = stop_token.cancelled() => break,
      };

      Self::execute_job(id, &pool_name, queued, completions.as_mut()).await;
    }

    running.store(false, Ordering::Release);
    info!("worker {} stopping", id);
  }

  async fn execute_job(
    id: WorkerId,
    pool_name: &Arc<String>,
    mut queued: QueuedJob,
    completions: Option<&mut CompletionSender>,
  ) {
    let job_id = queued.job_id;
    debug!(%job_id, "Executing job.");

    // Both calls run user code; a panic in either must not unwind the worker.
    let guarded = AssertUnwindSafe(async {
      queued.job.set_worker_id(id);
      queued.job.execute().await
    });
    let outcome = match guarded.catch_unwind().await {
      Ok(Ok(())) => {
        trace!(%job_id, "Job executed successfully.");
        Ok(())
      }
      Ok(Err(job_error)) => {
        error!(%job_id, "error running worker {}: {}", id, job_error);
        Err(PoolError::JobFailed {
          worker_id: id,
          reason: job_error.to_string(),
        })
      }
      Err(_panic_payload) => {
        error!(%job_id, "Job panicked on worker {}.", id);
        Err(PoolError::JobPanicked { worker_id: id })
      }
    };

    // Releases the job's active count before the worker re-registers.
    drop(queued);

    if let Some(tx) = completions {
      let message = InternalCompletionMessage {
        job_id,
        worker_id: id,
        pool_name: pool_name.clone(),
        outcome,
      };
      if tx.send(message).await.is_err() {
        trace!(%job_id, "Completion notifier is gone, outcome not reported.");
      }
    }
  }
}
