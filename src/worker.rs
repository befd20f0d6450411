// src/worker.rs
use crate::client::StoreClient;
use crate::events::QueueEvent;
use crate::job::JobRecord;
use crate::queue::{Queue, QueueOptions};
use crate::transitions::{now_ms, ActiveClaim, FinishTarget, Transitions};
use crate::{AppContext, JobContext, JobRegistry, Result, SwitchyardError};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{broadcast, oneshot, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::{interval, sleep, timeout, Duration},
};
use tracing::{error, info, warn};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queue_options: QueueOptions,
    pub concurrency: usize,
    /// How long a claimed job's lock lives between renewals.
    pub lock_duration: Duration,
    /// Renewal cadence; keep it well under `lock_duration`.
    pub lock_renew_time: Duration,
    /// How long the blocking pop waits before reporting the queue drained.
    pub drain_delay: Duration,
    pub shutdown_timeout: Duration,
    pub worker_id: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            queue_options: QueueOptions::default(),
            concurrency: 10,
            lock_duration: Duration::from_secs(30),
            lock_renew_time: Duration::from_secs(15),
            drain_delay: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }
}

/// Worker builder for fluent configuration
pub struct WorkerBuilder {
    options: WorkerOptions,
    registry: JobRegistry,
    app_context: Option<Arc<dyn AppContext>>,
}

impl WorkerBuilder {
    pub fn new(redis_url: impl Into<String>, registry: JobRegistry) -> Self {
        let mut options = WorkerOptions::default();
        options.queue_options.redis_url = redis_url.into();

        Self {
            options,
            registry,
            app_context: None,
        }
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.options.queue_options.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.options.concurrency = concurrency.max(1);
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.options.lock_duration = duration;
        self.options.lock_renew_time = duration / 2;
        self
    }

    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.options.drain_delay = delay;
        self
    }

    pub fn with_limiter(mut self, limiter: crate::limiter::RateLimiterOptions) -> Self {
        self.options.queue_options.limiter = Some(limiter);
        self
    }

    pub fn with_app_context(mut self, ctx: Arc<dyn AppContext>) -> Self {
        self.app_context = Some(ctx);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.shutdown_timeout = timeout;
        self
    }

    pub async fn spawn(self) -> Result<Worker> {
        let app_context = self
            .app_context
            .ok_or_else(|| SwitchyardError::Worker("App context is required".to_string()))?;

        Worker::new(self.options, self.registry, app_context).await
    }
}

/// Everything a processing chain needs, shared behind one Arc.
struct WorkerCore {
    options: WorkerOptions,
    queue: Arc<Queue>,
    registry: Arc<JobRegistry>,
    app_context: Arc<dyn AppContext>,
    semaphore: Arc<Semaphore>,
    is_shutting_down: Arc<AtomicBool>,
}

/// Job worker that claims and processes queued jobs
pub struct Worker {
    core: Arc<WorkerCore>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Worker {
    async fn new(
        options: WorkerOptions,
        registry: JobRegistry,
        app_context: Arc<dyn AppContext>,
    ) -> Result<Self> {
        let queue = Arc::new(Queue::new(options.queue_options.clone()).await?);
        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            core: Arc::new(WorkerCore {
                options,
                queue,
                registry: Arc::new(registry),
                app_context,
                semaphore,
                is_shutting_down: Arc::new(AtomicBool::new(false)),
            }),
            handles: Vec::new(),
            shutdown_tx,
        })
    }

    pub fn queue(&self) -> Arc<Queue> {
        Arc::clone(&self.core.queue)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.core.queue.subscribe()
    }

    /// Start the worker and block until shutdown
    pub async fn start(&mut self) -> Result<()> {
        info!(
            "Starting worker {} with concurrency {}",
            self.core.options.worker_id, self.core.options.concurrency
        );

        self.setup_signal_handlers();

        let core = Arc::clone(&self.core);
        self.handles
            .push(tokio::spawn(async move { core.dispatch_loop().await }));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        shutdown_rx.recv().await.ok();

        self.graceful_shutdown().await;
        Ok(())
    }

    fn setup_signal_handlers(&self) {
        let shutdown_tx = self.shutdown_tx.clone();
        let worker_id = self.core.options.worker_id.clone();

        tokio::spawn(async move {
            Self::wait_for_shutdown_signal().await;
            info!("Shutdown signal received by worker {}", worker_id);
            let _ = shutdown_tx.send(());
        });
    }

    async fn wait_for_shutdown_signal() {
        use tokio::signal;

        #[cfg(unix)]
        {
            use signal::unix::{signal, SignalKind};

            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = sigint.recv() => info!("SIGINT received"),
                _ = signal::ctrl_c() => info!("CTRL+C received"),
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c()
                .await
                .expect("Failed to setup CTRL+C handler");
            info!("CTRL+C received");
        }
    }

    /// Perform graceful shutdown
    async fn graceful_shutdown(&mut self) {
        info!(
            "Initiating graceful shutdown for worker {}",
            self.core.options.worker_id
        );

        // stop claiming new jobs, then cancel the dispatch loop
        self.core.is_shutting_down.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            handle.abort();
        }

        // wait for in-flight jobs; past the timeout their locks simply
        // expire and the stall monitor recovers them
        let concurrency = self.core.options.concurrency;
        let active = concurrency - self.core.semaphore.available_permits();
        if active > 0 {
            info!("Waiting for {} active jobs to complete...", active);
            match timeout(
                self.core.options.shutdown_timeout,
                self.wait_for_jobs_completion(),
            )
            .await
            {
                Ok(_) => info!("All jobs completed during shutdown"),
                Err(_) => {
                    let remaining = concurrency - self.core.semaphore.available_permits();
                    warn!(
                        "Shutdown timeout reached. {} jobs may still be running",
                        remaining
                    );
                }
            }
        }
        info!("Worker {} shutdown complete", self.core.options.worker_id);
    }

    async fn wait_for_jobs_completion(&self) {
        let permits = match self
            .core
            .semaphore
            .clone()
            .acquire_many_owned(self.core.options.concurrency as u32)
            .await
        {
            Ok(permits) => permits,
            Err(_) => return,
        };
        drop(permits);
    }

    /// Stop the worker gracefully (public API)
    pub async fn stop(&mut self) {
        info!("Stop requested for worker {}", self.core.options.worker_id);
        let _ = self.shutdown_tx.send(());
    }

    /// Force immediate shutdown (emergency only)
    pub async fn force_stop(&mut self) {
        self.core.is_shutting_down.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }

    /// Get worker statistics
    pub fn stats(&self) -> WorkerStats {
        let concurrency = self.core.options.concurrency;
        let available = self.core.semaphore.available_permits();
        WorkerStats {
            worker_id: self.core.options.worker_id.clone(),
            concurrency,
            queue_name: self.core.options.queue_options.name.clone(),
            is_shutting_down: self.core.is_shutting_down.load(Ordering::SeqCst),
            active_jobs: concurrency - available,
        }
    }
}

impl WorkerCore {
    fn shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Claims jobs and hands each to a processing chain. The scripted claim
    /// is tried first; when nothing is ready the blocking pop parks on
    /// `wait` and its result is fed back through the claim script so
    /// priority and the rate limiter still apply.
    async fn dispatch_loop(self: Arc<Self>) {
        let transitions = self.queue.transitions();
        let limiter = self.options.queue_options.limiter.clone();
        let mut conn = self.queue.connection();
        let keys = self.queue.transitions().keys().clone();

        let mut blocking = loop {
            match self.queue.store().blocking_connection().await {
                Ok(conn) => break conn,
                Err(err) => {
                    error!("failed to open blocking connection: {}", err);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        };

        loop {
            if self.shutting_down() {
                break;
            }

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if self.shutting_down() {
                break;
            }

            let token = format!("{}:{}", self.options.worker_id, uuid::Uuid::new_v4());
            let lock_ms = self.options.lock_duration.as_millis() as u64;

            let claim = transitions
                .move_to_active(&mut conn, &token, None, lock_ms, limiter.as_ref())
                .await;

            match claim {
                Ok(ActiveClaim::Claimed(record)) => {
                    self.spawn_chain(record, token, permit);
                }
                Ok(ActiveClaim::RateLimited { delay_ms }) => {
                    drop(permit);
                    sleep(Duration::from_millis(delay_ms.max(10))).await;
                }
                Ok(ActiveClaim::Idle) => {
                    // nothing ready: park on the blocking arm
                    let popped = StoreClient::brpoplpush(
                        &mut blocking,
                        &keys.wait(),
                        &keys.active(),
                        self.options.drain_delay.as_secs_f64(),
                    )
                    .await;
                    match popped {
                        Ok(Some(job_id)) => {
                            let claim = transitions
                                .move_to_active(
                                    &mut conn,
                                    &token,
                                    Some(&job_id),
                                    lock_ms,
                                    limiter.as_ref(),
                                )
                                .await;
                            match claim {
                                Ok(ActiveClaim::Claimed(record)) => {
                                    self.spawn_chain(record, token, permit);
                                }
                                Ok(ActiveClaim::RateLimited { delay_ms }) => {
                                    drop(permit);
                                    sleep(Duration::from_millis(delay_ms.max(10))).await;
                                }
                                Ok(ActiveClaim::Idle) => drop(permit),
                                Err(err) => {
                                    error!("failed to finalise claim: {}", err);
                                    drop(permit);
                                    sleep(Duration::from_secs(1)).await;
                                }
                            }
                        }
                        Ok(None) => {
                            self.queue.events().emit(QueueEvent::Drained);
                            drop(permit);
                        }
                        Err(err) => {
                            error!("blocking pop failed: {}", err);
                            drop(permit);
                            sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                Err(err) => {
                    error!("failed to claim job: {}", err);
                    drop(permit);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Worker loop terminated");
    }

    /// Runs a chain of jobs under one permit: each finish fetches the next
    /// ready job in the same script call until the queue is empty.
    fn spawn_chain(self: &Arc<Self>, first: JobRecord, token: String, permit: OwnedSemaphorePermit) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            let mut current = Some(first);
            while let Some(record) = current.take() {
                current = core.process_one(record, &token).await;
                if core.shutting_down() {
                    break;
                }
            }
        });
    }

    /// Processes one claimed job to its conclusion and returns the next
    /// chained job, if any.
    async fn process_one(&self, record: JobRecord, token: &str) -> Option<JobRecord> {
        let transitions = self.queue.transitions();
        let limiter = self.options.queue_options.limiter.clone();
        let mut conn = self.queue.connection();
        let job_id = record.id.clone();
        let lock_ms = self.options.lock_duration.as_millis() as u64;
        let fetch_next = !self.shutting_down();

        self.queue
            .events()
            .emit(QueueEvent::Active { id: job_id.clone() });

        // keep the lock alive for as long as the processor runs
        let (lost_tx, mut lost_rx) = oneshot::channel();
        let renew_handle = tokio::spawn(renew_lock_loop(
            Arc::clone(&transitions),
            self.queue.connection(),
            record.id.clone(),
            token.to_string(),
            self.options.lock_renew_time,
            lock_ms,
            lost_tx,
        ));

        let ctx = JobContext::new(
            record.clone(),
            self.app_context.clone_context(),
            self.queue.connection(),
            Arc::clone(&transitions),
        );

        let outcome = tokio::select! {
            result = self
                .registry
                .execute_job(&record.name, record.data.clone(), &ctx) => Some(result),
            _ = &mut lost_rx => None,
        };
        renew_handle.abort();

        let result = match outcome {
            Some(result) => result,
            None => {
                // lock lost mid-flight: abort without finalizing; the stall
                // monitor owns this job now
                warn!("lock lost while processing job {}; aborting", job_id);
                return None;
            }
        };

        match result {
            Ok(returnvalue) => {
                let target = FinishTarget::Completed {
                    returnvalue: returnvalue.clone(),
                };
                // a completion attempt can race children being added or
                // finishing, so try the park-and-finish dance twice
                for _ in 0..2 {
                    match transitions
                        .move_to_finished(
                            &mut conn,
                            &job_id,
                            token,
                            &target,
                            record.opts.remove_on_complete.encode(),
                            fetch_next,
                            lock_ms,
                            limiter.as_ref(),
                        )
                        .await
                    {
                        Ok(next) => {
                            self.queue.events().emit(QueueEvent::Completed {
                                id: job_id.clone(),
                                returnvalue: returnvalue.clone(),
                            });
                            info!("Job {} completed", job_id);
                            return next;
                        }
                        Err(SwitchyardError::PendingDependencies(_)) => {
                            match transitions
                                .move_to_waiting_children(&mut conn, &job_id, token)
                                .await
                            {
                                Ok(true) => {
                                    info!("Job {} waiting for children", job_id);
                                    return None;
                                }
                                // dependencies emptied in between; finish
                                Ok(false) => continue,
                                Err(err) => {
                                    error!(
                                        "failed to park job {} for children: {}",
                                        job_id, err
                                    );
                                    return None;
                                }
                            }
                        }
                        Err(err) => {
                            error!("failed to complete job {}: {}", job_id, err);
                            return None;
                        }
                    }
                }
                None
            }
            Err(err) => {
                let reason = err.to_string();
                let attempts_made = record.attempts_made.max(1);
                let max_attempts = record.opts.attempts.max(1);

                if attempts_made < max_attempts {
                    let delay = record
                        .opts
                        .backoff
                        .as_ref()
                        .map(|b| b.delay_for(attempts_made))
                        .unwrap_or(0);
                    let retried = if delay > 0 {
                        transitions
                            .move_to_delayed(
                                &mut conn,
                                &job_id,
                                Some(token),
                                now_ms() + delay as i64,
                            )
                            .await
                    } else {
                        transitions
                            .retry_job(&mut conn, &job_id, Some(token), false)
                            .await
                    };
                    match retried {
                        Ok(()) => warn!(
                            "Job {} failed (attempt {}/{}), retrying in {}ms: {}",
                            job_id, attempts_made, max_attempts, delay, reason
                        ),
                        Err(err) => error!("failed to schedule retry for {}: {}", job_id, err),
                    }
                    None
                } else {
                    let target = FinishTarget::Failed {
                        reason: reason.clone(),
                    };
                    match transitions
                        .move_to_finished(
                            &mut conn,
                            &job_id,
                            token,
                            &target,
                            record.opts.remove_on_fail.encode(),
                            fetch_next,
                            lock_ms,
                            limiter.as_ref(),
                        )
                        .await
                    {
                        Ok(next) => {
                            self.queue.events().emit(QueueEvent::Failed {
                                id: job_id.clone(),
                                reason: reason.clone(),
                            });
                            error!("Job {} failed permanently: {}", job_id, reason);
                            next
                        }
                        Err(err) => {
                            error!("failed to fail job {}: {}", job_id, err);
                            None
                        }
                    }
                }
            }
        }
    }
}

async fn renew_lock_loop(
    transitions: Arc<Transitions>,
    mut conn: redis::aio::ConnectionManager,
    job_id: crate::JobId,
    token: String,
    renew_every: Duration,
    lock_ms: u64,
    lost_tx: oneshot::Sender<()>,
) {
    let mut ticker = interval(renew_every);
    // the first tick fires immediately; the lock is already fresh
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match transitions
            .extend_lock(&mut conn, &job_id, &token, lock_ms)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                let _ = lost_tx.send(());
                break;
            }
            Err(err) => {
                // transient store trouble; the lock may still be alive, so
                // keep trying until it either renews or is truly gone
                warn!("lock renewal for {} errored: {}", job_id, err);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub worker_id: String,
    pub concurrency: usize,
    pub queue_name: String,
    pub is_shutting_down: bool,
    pub active_jobs: usize,
}
