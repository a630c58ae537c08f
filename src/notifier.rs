use crate::error::PoolError;
use crate::job::WorkerId;

use fibre::mpsc::{self, UnboundedAsyncReceiver as AsyncReceiver, UnboundedAsyncSender as AsyncSender};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

// --- Public Event Structs for Handlers ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCompletionStatus {
  Success,
  Failed,
  Panicked,
}

impl From<&Result<(), PoolError>> for JobCompletionStatus {
  fn from(result: &Result<(), PoolError>) -> Self {
    match result {
      Ok(()) => JobCompletionStatus::Success,
      Err(PoolError::JobPanicked { .. }) => JobCompletionStatus::Panicked,
      Err(_) => JobCompletionStatus::Failed,
    }
  }
}

/// Delivered to every completion handler once per executed job.
#[derive(Debug, Clone)]
pub struct JobCompletionInfo {
  pub job_id: u64,
  pub worker_id: WorkerId,
  pub pool_name: Arc<String>,
  pub status: JobCompletionStatus,
  /// Rendered error for `Failed` and `Panicked` jobs.
  pub error: Option<String>,
  pub completion_time: SystemTime,
}

type CompletionHandler = Arc<dyn Fn(JobCompletionInfo) + Send + Sync + 'static>;

// --- Internal Message (crate-public) ---
#[derive(Debug)]
pub(crate) struct InternalCompletionMessage {
  pub(crate) job_id: u64,
  pub(crate) worker_id: WorkerId,
  pub(crate) pool_name: Arc<String>,
  pub(crate) outcome: Result<(), PoolError>,
}

pub(crate) type CompletionSender = AsyncSender<InternalCompletionMessage>;

struct NotifierState {
  tx: Option<CompletionSender>,
  rx: Option<AsyncReceiver<InternalCompletionMessage>>,
  worker_join_handle: Option<JoinHandle<()>>,
}

/// Fans job outcomes reported by workers out to user-registered handlers.
pub(crate) struct CompletionNotifier {
  pool_name: Arc<String>,
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  state: Mutex<NotifierState>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    let started = self
      .state
      .try_lock()
      .map_or(true, |guard| guard.worker_join_handle.is_some());

    f.debug_struct("CompletionNotifier")
      .field("pool_name", &self.pool_name)
      .field("handler_count", &handler_count)
      .field("started", &started)
      .finish()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(pool_name: Arc<String>) -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    Self {
      pool_name,
      handlers: Arc::new(RwLock::new(Vec::new())),
      state: Mutex::new(NotifierState {
        tx: Some(tx),
        rx: Some(rx),
        worker_join_handle: None,
      }),
    }
  }

  /// Spawns the notification loop and hands back the sender workers report
  /// into. The loop ends once every returned sender clone has been dropped.
  pub(crate) fn start(&self, tokio_handle: &TokioHandle) -> Option<CompletionSender> {
    let mut state = self.state.lock();
    let (tx, rx) = match (state.tx.take(), state.rx.take()) {
      (Some(tx), Some(rx)) => (tx, rx),
      _ => {
        warn!(pool_name = %*self.pool_name, "Notifier: start requested twice, ignoring.");
        return None;
      }
    };

    let worker_handlers = self.handlers.clone();
    let join_handle = tokio_handle.spawn(
      Self::run_notification_loop(rx, worker_handlers, tokio_handle.clone())
        .instrument(info_span!("notification_loop", pool_name = %*self.pool_name)),
    );
    state.worker_join_handle = Some(join_handle);
    Some(tx)
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(JobCompletionInfo) + Send + Sync + 'static) {
    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(pool_name = %*self.pool_name, "Notifier: Added new completion handler. Total handlers: {}", handlers_guard.len());
  }

  async fn run_notification_loop(
    mut queue_rx: AsyncReceiver<InternalCompletionMessage>,
    handlers: Arc<RwLock<Vec<CompletionHandler>>>,
    tokio_handle: TokioHandle,
  ) {
    info!("Notification loop started.");

    while let Ok(message) = queue_rx.recv().await {
      Self::dispatch(&handlers, message, &tokio_handle);
    }

    info!("Notification loop stopped (all workers dropped their senders).");
  }

  /// Each handler runs on its own task, so a slow handler never holds up the
  /// loop or the other handlers.
  fn dispatch(
    handlers: &RwLock<Vec<CompletionHandler>>,
    message: InternalCompletionMessage,
    tokio_handle: &TokioHandle,
  ) {
    // Snapshot so handlers can register further handlers without deadlocking.
    let handlers_snapshot: Vec<CompletionHandler> = handlers.read().clone();
    if handlers_snapshot.is_empty() {
      trace!(job_id = %message.job_id, "No completion handlers registered, dropping notification.");
      return;
    }

    let info = JobCompletionInfo {
      job_id: message.job_id,
      worker_id: message.worker_id,
      pool_name: message.pool_name,
      status: JobCompletionStatus::from(&message.outcome),
      error: message.outcome.err().map(|e| e.to_string()),
      completion_time: SystemTime::now(),
    };

    debug!(
      job_id = %info.job_id,
      worker_id = %info.worker_id,
      "Dispatching notification to {} handlers.",
      handlers_snapshot.len()
    );

    for handler in handlers_snapshot {
      let info_for_handler = info.clone();
      tokio_handle.spawn(async move {
        let pool_name = info_for_handler.pool_name.clone();
        let job_id = info_for_handler.job_id;
        if catch_unwind(AssertUnwindSafe(|| handler(info_for_handler))).is_err() {
          error!(
            "A completion handler panicked during execution. Pool: {}, Job ID: {}",
            pool_name, job_id
          );
        }
      });
    }
  }
}
