//! Serial job dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashSet;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::retry::RetryScheduler;
use crate::{
    DispatchError, DispatcherConfig, FailureDisposition, JobContext, JobDelegate, JobHandlers,
    JobId, JobIdAllocator, JobKind, JobOutcome, JobRecord, JobReporter, JobStatus, JobStore,
};

/// Handle to a running dispatcher.
///
/// Cheap to clone. Constructed once by the application and passed to
/// whatever needs to submit work.
#[derive(Clone)]
pub struct Dispatcher {
    core: Arc<Core>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// State shared by the handle, the consumer task and the retry timer.
struct Core {
    store: Arc<dyn JobStore>,
    handlers: JobHandlers,
    config: DispatcherConfig,
    ids: JobIdAllocator,
    queue_tx: mpsc::UnboundedSender<JobRecord>,
    retries: RetryScheduler,
    /// Ids admitted in this process that have not reached a terminal state.
    in_flight: DashSet<JobId>,
    resumed: AtomicBool,
}

impl Dispatcher {
    /// Start the consumer and retry timer tasks.
    ///
    /// Both stop when `shutdown_rx` observes `true` or its sender is
    /// dropped. Must be called from within a tokio runtime.
    pub fn spawn(
        store: Arc<dyn JobStore>,
        handlers: JobHandlers,
        config: DispatcherConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, DispatchError> {
        handlers.ensure_complete()?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (retries, retry_timer) = RetryScheduler::new(config.max_pending_retries);

        let core = Arc::new(Core {
            store,
            handlers,
            config,
            ids: JobIdAllocator::new(),
            queue_tx,
            retries,
            in_flight: DashSet::new(),
            resumed: AtomicBool::new(false),
        });

        let consumer = tokio::spawn(Arc::clone(&core).run(queue_rx, shutdown_rx.clone()));

        let timer_core = Arc::clone(&core);
        let timer = tokio::spawn(retry_timer.run(shutdown_rx, move |record| {
            let core = Arc::clone(&timer_core);
            async move { core.readmit(record).await }
        }));

        Ok(Self {
            core,
            tasks: Arc::new(Mutex::new(vec![consumer, timer])),
        })
    }

    /// Submit a new job.
    ///
    /// The record is persisted before it becomes visible to the consumer.
    /// Returns once the job is admitted; execution happens asynchronously.
    #[tracing::instrument(skip(self, payload))]
    pub async fn add(&self, kind: JobKind, payload: Value) -> Result<JobId, DispatchError> {
        let record = self.core.persist_new(kind, payload, true).await?;
        let id = record.id;
        self.core.enqueue(record)?;
        debug!(id = %id, "job added");
        Ok(id)
    }

    /// Persist a new job without admitting it.
    ///
    /// The job runs when [`resume`](Self::resume) next replays pending work,
    /// typically after a restart.
    #[tracing::instrument(skip(self, payload))]
    pub async fn add_without_executing(
        &self,
        kind: JobKind,
        payload: Value,
    ) -> Result<JobId, DispatchError> {
        // Left unclaimed so a concurrent resume can admit it.
        let record = self.core.persist_new(kind, payload, false).await?;
        debug!(id = %record.id, "job persisted for later execution");
        Ok(record.id)
    }

    /// Replay every pending job found in storage, oldest first per kind.
    ///
    /// Only the first call in a process does anything; later calls return
    /// `Ok(0)`. Jobs already admitted in this process are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self) -> Result<usize, DispatchError> {
        if self.core.resumed.swap(true, Ordering::AcqRel) {
            debug!("pending jobs were already resumed; ignoring");
            return Ok(0);
        }

        let mut resumed = 0;
        for kind in JobKind::ALL {
            let mut pending = self.core.store.get_all_pending_jobs(kind).await?;
            pending.sort_by_key(|record| record.id);

            for record in pending {
                if !self.core.in_flight.insert(record.id) {
                    debug!(id = %record.id, "job already in flight; not resuming");
                    continue;
                }
                info!(id = %record.id, kind = %kind, failure_count = record.failure_count, "resuming pending job");
                self.core.enqueue(record)?;
                resumed += 1;
            }
        }

        info!(count = resumed, "resumed pending jobs");
        Ok(resumed)
    }

    /// Jobs admitted in this process that have not reached a terminal state.
    pub fn in_flight(&self) -> usize {
        self.core.in_flight.len()
    }

    /// Retries waiting for their backoff delay to elapse.
    pub fn pending_retries(&self) -> usize {
        self.core.retries.outstanding()
    }

    /// Wait for the background tasks to stop after shutdown was signalled.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "dispatcher task ended abnormally");
            }
        }
    }
}

impl Core {
    /// Allocate an id and durably store a new record.
    ///
    /// With `claim`, the id is marked in flight before the write so a
    /// concurrent resume cannot admit it too.
    async fn persist_new(
        &self,
        kind: JobKind,
        payload: Value,
        claim: bool,
    ) -> Result<JobRecord, DispatchError> {
        let id = self.ids.next();
        let record = JobRecord::new(id, kind, payload)
            .with_max_failure_count(self.config.max_failure_count(kind));

        if claim {
            self.in_flight.insert(id);
        }
        if let Err(e) = self.store.persist_job(&record).await {
            if claim {
                self.in_flight.remove(&id);
            }
            return Err(e.into());
        }
        Ok(record)
    }

    fn enqueue(&self, record: JobRecord) -> Result<(), DispatchError> {
        self.queue_tx
            .send(record)
            .map_err(|mpsc::error::SendError(record)| {
                self.in_flight.remove(&record.id);
                DispatchError::ShutDown
            })
    }

    /// The single consumer loop.
    async fn run(
        self: Arc<Self>,
        mut queue_rx: mpsc::UnboundedReceiver<JobRecord>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("dispatcher starting");

        loop {
            if *shutdown_rx.borrow() {
                info!("dispatcher shutting down");
                break;
            }

            let record = tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                record = queue_rx.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            self.dispatch(record).await;
        }

        info!("dispatcher shut down gracefully");
    }

    /// Execute one admitted job and apply its outcome.
    #[tracing::instrument(skip_all, fields(id = %record.id, kind = %record.kind))]
    async fn dispatch(&self, mut record: JobRecord) {
        let outcome = match self.handlers.get(record.kind) {
            Some(handler) => {
                record.status = JobStatus::Running;
                debug!(failure_count = record.failure_count, "executing job");

                let context = JobContext::from(&record);
                let (reporter, outcome_rx) = JobReporter::channel(record.id);
                let task = tokio::spawn(async move { handler.execute(context, reporter).await });
                self.await_outcome(task, outcome_rx).await
            }
            None => JobOutcome::FailedPermanently(format!(
                "no handler registered for job kind {}",
                record.kind
            )),
        };

        let result = match outcome {
            JobOutcome::Succeeded => self.handle_job_succeeded(record).await,
            JobOutcome::Failed(error) => self.handle_job_failed(record, error).await,
            JobOutcome::FailedPermanently(error) => {
                self.handle_job_failed_permanently(record, error).await
            }
        };

        if let Err(e) = result {
            error!(error = %e, "failed to record job outcome");
        }
    }

    /// Wait for the job's report, converting panics, silence and timeouts
    /// into recoverable failures.
    async fn await_outcome(
        &self,
        mut task: JoinHandle<()>,
        mut outcome_rx: oneshot::Receiver<JobOutcome>,
    ) -> JobOutcome {
        let timeout = self.config.job_timeout();

        let wait = async {
            tokio::select! {
                biased;
                outcome = &mut outcome_rx => match outcome {
                    Ok(outcome) => outcome,
                    // The reporter was dropped. Stop whatever is left of the
                    // job before its retry can be admitted, and find out
                    // whether it panicked.
                    Err(_) => {
                        task.abort();
                        match (&mut task).await {
                            Err(e) if e.is_panic() => JobOutcome::panicked(),
                            _ => JobOutcome::unreported(),
                        }
                    }
                },
                joined = &mut task => match joined {
                    Err(e) if e.is_panic() => JobOutcome::panicked(),
                    // The reporter may have been moved into a task the job spawned.
                    _ => (&mut outcome_rx).await.unwrap_or_else(|_| JobOutcome::unreported()),
                },
            }
        };

        let waited = tokio::time::timeout(timeout, wait).await;
        match waited {
            Ok(outcome) => outcome,
            Err(_) => {
                task.abort();
                JobOutcome::Failed(format!(
                    "job did not report an outcome within {}s",
                    timeout.as_secs()
                ))
            }
        }
    }

    /// Hand a retried job back to the consumer unless it was canceled.
    async fn readmit(&self, record: JobRecord) {
        match self.store.is_job_canceled(&record).await {
            Ok(true) => {
                info!(id = %record.id, kind = %record.kind, "job canceled; dropping scheduled retry");
                self.in_flight.remove(&record.id);
            }
            Ok(false) => {
                info!(id = %record.id, kind = %record.kind, failure_count = record.failure_count, "retrying job");
                if let Err(e) = self.enqueue(record) {
                    warn!(error = %e, "could not re-admit retried job");
                }
            }
            Err(e) => {
                error!(
                    id = %record.id,
                    error = %e,
                    "failed to check cancellation; retry deferred until next resume"
                );
                self.in_flight.remove(&record.id);
            }
        }
    }

    /// Persist a failure-driven mutation, releasing the id if that fails.
    async fn persist_failure(&self, record: &JobRecord) -> Result<(), DispatchError> {
        if let Err(e) = self.store.persist_job(record).await {
            self.in_flight.remove(&record.id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Record a terminal failure with the store.
    async fn finish_failed(&self, record: &JobRecord) -> Result<(), DispatchError> {
        let result = self.store.mark_job_as_failed(record).await;
        self.in_flight.remove(&record.id);
        result.map_err(Into::into)
    }
}

#[async_trait]
impl JobDelegate for Core {
    async fn handle_job_succeeded(&self, mut record: JobRecord) -> Result<(), DispatchError> {
        if !record.record_success() {
            warn!(id = %record.id, status = %record.status, "ignoring success for terminal job");
            return Ok(());
        }

        let result = self.store.mark_job_as_succeeded(&record).await;
        self.in_flight.remove(&record.id);
        result?;

        info!(id = %record.id, kind = %record.kind, "job succeeded");
        Ok(())
    }

    async fn handle_job_failed(
        &self,
        mut record: JobRecord,
        error: String,
    ) -> Result<(), DispatchError> {
        match record.record_failure(&error) {
            FailureDisposition::AlreadyTerminal => {
                warn!(id = %record.id, status = %record.status, "ignoring failure for terminal job");
                Ok(())
            }
            FailureDisposition::Retry => {
                self.persist_failure(&record).await?;

                let delay = self.config.backoff.delay_for(record.failure_count);
                info!(
                    id = %record.id,
                    kind = %record.kind,
                    failure_count = record.failure_count,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "job failed; scheduling retry"
                );

                if let Err(record) = self.retries.schedule(record, delay) {
                    warn!(
                        id = %record.id,
                        pending_retries = self.retries.outstanding(),
                        "retry queue full; job will be retried after next resume"
                    );
                    self.in_flight.remove(&record.id);
                }
                Ok(())
            }
            FailureDisposition::Exhausted => {
                self.persist_failure(&record).await?;
                warn!(
                    id = %record.id,
                    kind = %record.kind,
                    failure_count = record.failure_count,
                    error = %error,
                    "job failed too many times; giving up"
                );
                self.finish_failed(&record).await
            }
        }
    }

    async fn handle_job_failed_permanently(
        &self,
        mut record: JobRecord,
        error: String,
    ) -> Result<(), DispatchError> {
        if !record.record_permanent_failure(&error) {
            warn!(id = %record.id, status = %record.status, "ignoring failure for terminal job");
            return Ok(());
        }

        self.persist_failure(&record).await?;
        error!(
            id = %record.id,
            kind = %record.kind,
            failure_count = record.failure_count,
            error = %error,
            "job failed permanently"
        );
        self.finish_failed(&record).await
    }
}
