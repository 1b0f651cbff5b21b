use crate::admission::AdmissionController;
use crate::budget::BudgetGuard;
use crate::provider::{ChatResponse, ProviderRegistry};
use chrono::Utc;
use foundry_core::{
    ChatMessage, DomainEvent, EventBus, FoundryError, FoundryResult, JobStatus,
    LlmJob, OwnershipRegistry, QueueConfig,
};
use foundry_store::Store;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Called once per job when this queue moves it to `completed` or `failed`.
pub type CompletionCallback = Arc<dyn Fn(&LlmJob) + Send + Sync>;

const DEFAULT_MAX_TOKENS: u32 = 4096;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Parameters for [`JobQueue::submit`].
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Project charged for the tokens.
    pub project_id: Uuid,
    /// Requesting agent.
    pub agent_id: Uuid,
    /// Provider to dispatch to.
    pub provider_id: String,
    /// Model name.
    pub model: String,
    /// Messages to send.
    pub prompt: Vec<ChatMessage>,
    /// Override the completion token cap.
    pub max_tokens: u32,
    /// Higher runs first.
    pub priority: i32,
}

impl JobRequest {
    /// Request with default token cap and priority 0.
    pub fn new(
        project_id: Uuid,
        agent_id: Uuid,
        provider_id: impl Into<String>,
        model: impl Into<String>,
        prompt: Vec<ChatMessage>,
    ) -> Self {
        Self {
            project_id,
            agent_id,
            provider_id: provider_id.into(),
            model: model.into(),
            prompt,
            max_tokens: DEFAULT_MAX_TOKENS,
            priority: 0,
        }
    }

    /// Override the completion token cap.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Higher runs first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Durable, concurrency- and budget-limited dispatcher for provider calls.
///
/// A ticker polls the store for pending jobs in priority order. Each
/// candidate must pass admission control (provider and group ceilings) and
/// find a free slot in the bounded worker pool before it is claimed with
/// [`Db::claim_job`](foundry_store::Db::claim_job). Only the claimer that
/// wins the conditional update runs the job, so several queues (or several
/// processes) can poll the same store without dispatching a job twice.
pub struct JobQueue {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    providers: ProviderRegistry,
    config: QueueConfig,
    admission: AdmissionController,
    budget: BudgetGuard,
    pool: Arc<Semaphore>,
    in_flight: Arc<OwnershipRegistry>,
    on_complete: RwLock<Vec<CompletionCallback>>,
    shutdown: watch::Sender<bool>,
}

impl JobQueue {
    /// Queue over `store`, not polling until [`start`](Self::start).
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        providers: ProviderRegistry,
        config: QueueConfig,
    ) -> FoundryResult<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            admission: AdmissionController::new(&config),
            budget: BudgetGuard::new(config.budget.clone()),
            pool: Arc::new(Semaphore::new(config.max_workers)),
            in_flight: Arc::new(OwnershipRegistry::new()),
            on_complete: RwLock::new(Vec::new()),
            shutdown,
            store,
            bus,
            providers,
            config,
        })
    }

    /// Queue settings.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Concurrency gate.
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Token budget gate.
    pub fn budget(&self) -> &BudgetGuard {
        &self.budget
    }

    /// Jobs currently executing in this process.
    pub fn in_flight(&self) -> Arc<OwnershipRegistry> {
        Arc::clone(&self.in_flight)
    }

    /// Add a completion callback. Every registered callback runs, in
    /// registration order, once per job this queue finishes.
    ///
    /// Jobs failed outside the queue (an agent cancellation, for one) are
    /// reported through [`DomainEvent::JobFailed`] only.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: Fn(&LlmJob) + Send + Sync + 'static,
    {
        self.on_complete.write().push(Arc::new(callback));
    }

    /// Queue a provider call. Returns the new job's id.
    ///
    /// Fails with a validation error for an unknown provider or project, and
    /// with [`FoundryError::BudgetExceeded`] under hard enforcement once the
    /// project's usage reached the limit. A refused submission writes nothing.
    pub fn submit(&self, request: JobRequest) -> FoundryResult<Uuid> {
        if !self.providers.contains(&request.provider_id) {
            return Err(FoundryError::Validation(format!(
                "unknown provider '{}'",
                request.provider_id
            )));
        }
        if request.max_tokens == 0 {
            return Err(FoundryError::Validation("max_tokens must be positive".into()));
        }

        let job = LlmJob::new(
            request.project_id,
            request.agent_id,
            request.provider_id,
            request.model,
            request.prompt,
            request.max_tokens,
            request.priority,
        );
        self.store.transaction(|db| {
            db.require_project(job.project_id)?;
            self.budget.check(db, job.project_id)?;
            db.insert_job(&job)
        })?;

        debug!(job_id = %job.id, project_id = %job.project_id, provider = %job.provider_id, "Job submitted");
        self.bus.publish(&DomainEvent::JobSubmitted {
            project_id: job.project_id,
            job_id: job.id,
            provider_id: job.provider_id.clone(),
        });
        Ok(job.id)
    }

    /// Job by id, or `NotFound`.
    pub fn get_job(&self, id: Uuid) -> FoundryResult<LlmJob> {
        self.store.read(|db| db.require_job(id))
    }

    /// Poll the job's status until it is terminal or `timeout` elapses.
    /// Returns `None` on timeout.
    pub async fn wait_for_completion(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> FoundryResult<Option<LlmJob>> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.get_job(id)?;
            if job.status.is_terminal() {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Spawn the ticker loop. It runs until [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(queue.config.poll_interval());
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = queue.config.poll_interval_ms,
                workers = queue.config.max_workers,
                "Job queue started"
            );
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if queue.is_shut_down() {
                            break;
                        }
                        if let Err(e) = queue.poll_once().await {
                            error!(error = %e, "Job queue poll failed");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || queue.is_shut_down() {
                            break;
                        }
                    }
                }
            }
            info!("Job queue poller stopped");
        })
    }

    /// Stop polling and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let slots = u32::try_from(self.config.max_workers).unwrap_or(u32::MAX);
        if let Ok(all) = self.pool.acquire_many(slots).await {
            drop(all);
        }
        info!("Job queue drained");
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run one dispatch tick. Returns how many jobs were claimed and spawned.
    pub async fn poll_once(self: &Arc<Self>) -> FoundryResult<usize> {
        if self.is_shut_down() {
            return Ok(0);
        }
        let candidates = self
            .store
            .read(|db| db.list_claimable(self.config.batch_size))?;

        let mut dispatched = 0;
        for candidate in candidates {
            let Some(admission) = self.admission.try_admit(&candidate.provider_id) else {
                debug!(job_id = %candidate.id, provider = %candidate.provider_id, "Provider at capacity, job deferred");
                continue;
            };
            let Ok(worker) = Arc::clone(&self.pool).try_acquire_owned() else {
                debug!("Worker pool saturated, ending tick");
                break;
            };

            // The candidate may be stale; only the claimed row is run.
            let Some(job) = self
                .store
                .transaction(|db| db.claim_job(candidate.id, Utc::now()))?
            else {
                debug!(job_id = %candidate.id, "Job already claimed by another poller");
                continue;
            };

            self.in_flight.acquire(job.id);
            info!(job_id = %job.id, provider = %job.provider_id, attempt = job.retry_count + 1, "Job started");
            self.bus.publish(&DomainEvent::JobStarted {
                project_id: job.project_id,
                job_id: job.id,
                provider_id: job.provider_id.clone(),
            });

            let queue = Arc::clone(self);
            tokio::spawn(async move {
                let _admission = admission;
                let _worker = worker;
                queue.execute(job).await;
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn execute(&self, mut job: LlmJob) {
        let outcome = match self.providers.get(&job.provider_id) {
            Some(client) => client.chat(&job.prompt, &job.model, job.max_tokens).await,
            None => Err(FoundryError::Validation(format!(
                "provider '{}' is not registered",
                job.provider_id
            ))),
        };
        let recorded = match outcome {
            Ok(response) => self.record_success(&mut job, response),
            Err(e) => self.record_failure(&mut job, e),
        };
        self.in_flight.release(job.id);
        if let Err(e) = recorded {
            error!(job_id = %job.id, error = %e, "Failed to persist job outcome");
        }
    }

    fn record_success(&self, job: &mut LlmJob, response: ChatResponse) -> FoundryResult<()> {
        job.status = JobStatus::Completed;
        job.response = Some(response.content);
        job.input_tokens = response.input_tokens;
        job.output_tokens = response.output_tokens;
        job.error = None;
        job.completed_at = Some(Utc::now());
        if !self.persist(job)? {
            return Ok(());
        }

        info!(
            job_id = %job.id,
            input_tokens = job.input_tokens,
            output_tokens = job.output_tokens,
            "Job completed"
        );
        self.bus.publish(&DomainEvent::JobCompleted {
            project_id: job.project_id,
            job_id: job.id,
            input_tokens: job.input_tokens,
            output_tokens: job.output_tokens,
        });
        self.notify_complete(job);
        Ok(())
    }

    fn record_failure(&self, job: &mut LlmJob, err: FoundryError) -> FoundryResult<()> {
        if !err.is_retryable() || job.retry_count >= self.config.max_job_retries {
            return self.fail_job(job, err.to_string());
        }

        job.retry_count += 1;
        job.status = JobStatus::Pending;
        job.error = Some(err.to_string());
        job.started_at = None;
        if !self.persist(job)? {
            return Ok(());
        }
        warn!(
            job_id = %job.id,
            retry = job.retry_count,
            max_retries = self.config.max_job_retries,
            error = %err,
            "Job failed, requeued for retry"
        );
        self.bus.publish(&DomainEvent::JobRetried {
            project_id: job.project_id,
            job_id: job.id,
            retry_count: job.retry_count,
            error: err.to_string(),
        });
        Ok(())
    }

    fn fail_job(&self, job: &mut LlmJob, reason: String) -> FoundryResult<()> {
        job.status = JobStatus::Failed;
        job.error = Some(reason.clone());
        job.completed_at = Some(Utc::now());
        if !self.persist(job)? {
            return Ok(());
        }
        error!(job_id = %job.id, retries = job.retry_count, error = %reason, "Job failed permanently");
        self.bus.publish(&DomainEvent::JobFailed {
            project_id: job.project_id,
            job_id: job.id,
            error: reason,
        });
        self.notify_complete(job);
        Ok(())
    }

    /// Write back a running job. `false` if the row left `running` meanwhile,
    /// e.g. because its agent was cancelled; the outcome is then dropped.
    fn persist(&self, job: &LlmJob) -> FoundryResult<bool> {
        let written = self
            .store
            .transaction(|db| db.transition_job(job, JobStatus::Running))?;
        if !written {
            warn!(job_id = %job.id, "Job row changed while running, outcome discarded");
        }
        Ok(written)
    }

    fn notify_complete(&self, job: &LlmJob) {
        let callbacks = self.on_complete.read().clone();
        for callback in callbacks {
            callback(job);
        }
    }
}
