use crate::auto_approval::AutoApprovalHandler;
use crate::checkpoint::CheckpointWorkflow;
use crate::context::Context;
use crate::intervention::InterventionService;
use crate::lifecycle::{Activation, LifecycleManager};
use crate::projects::ProjectService;
use crate::quality::QualitySettings;
use crate::recovery::{RecoveryReport, RecoveryService};
use crate::scheduler::DependencyScheduler;
use crate::snapshot::SnapshotService;
use crate::spawner::WorkerSpawner;
use foundry_core::{
    AgentStatus, EventBus, FoundryError, FoundryResult, Intervention, InterventionPriority,
    JobStatus, LlmJob, PipelineConfig, QueueConfig,
};
use foundry_queue::{JobQueue, JobRequest, ProviderRegistry};
use foundry_store::Store;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Completion callback charging a finished job's tokens to its agent.
fn record_job_tokens(lifecycle: &LifecycleManager, job: &LlmJob) {
    if job.status != JobStatus::Completed {
        return;
    }
    match lifecycle.record_tokens(job.agent_id, job.input_tokens, job.output_tokens) {
        Ok(()) | Err(FoundryError::NotFound { .. }) => {}
        Err(e) => {
            warn!(job_id = %job.id, agent_id = %job.agent_id, error = %e, "Failed to record job tokens");
        }
    }
}

/// Result of [`ControlPlane::intervene`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionOutcome {
    /// The recorded intervention.
    pub intervention: Intervention,
    /// Set when the intervention targeted an agent that could be activated.
    pub activation: Option<Activation>,
}

/// The wired-up orchestration core.
///
/// Owns one store, one event bus and one job queue, and hands out the
/// services that operate on them. Call [`ControlPlane::boot`] once, inside
/// a tokio runtime, before accepting work: it reconciles orphaned state and
/// only then starts the queue's poller.
pub struct ControlPlane {
    ctx: Context,
    queue: Arc<JobQueue>,
    lifecycle: LifecycleManager,
    scheduler: DependencyScheduler,
    checkpoints: CheckpointWorkflow,
    auto_approval: AutoApprovalHandler,
    interventions: InterventionService,
    spawner: WorkerSpawner,
    snapshots: SnapshotService,
    quality: QualitySettings,
    projects: ProjectService,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ControlPlane {
    /// Wire every service over `store` and register token accounting on the queue.
    pub fn new(
        store: Arc<Store>,
        pipeline: PipelineConfig,
        queue_config: QueueConfig,
        providers: ProviderRegistry,
    ) -> FoundryResult<Self> {
        pipeline.validate()?;
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(JobQueue::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            providers,
            queue_config,
        )?);
        let ctx = Context::new(store, bus, Arc::new(pipeline));
        let lifecycle = LifecycleManager::new(ctx.clone());
        let accounting = lifecycle.clone();
        queue.on_complete(move |job| record_job_tokens(&accounting, job));
        Ok(Self {
            lifecycle,
            scheduler: DependencyScheduler::new(ctx.clone()),
            checkpoints: CheckpointWorkflow::new(ctx.clone()),
            auto_approval: AutoApprovalHandler::new(ctx.clone()),
            interventions: InterventionService::new(ctx.clone()),
            spawner: WorkerSpawner::new(ctx.clone()),
            snapshots: SnapshotService::new(ctx.clone()),
            quality: QualitySettings::new(ctx.clone()),
            projects: ProjectService::new(ctx.clone()),
            poller: Mutex::new(None),
            queue,
            ctx,
        })
    }

    /// Event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.ctx.bus
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<Store> {
        &self.ctx.store
    }

    /// Pipeline layout.
    pub fn pipeline(&self) -> &PipelineConfig {
        &self.ctx.pipeline
    }

    /// Job queue.
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Agent state machine.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Dependency scheduler.
    pub fn scheduler(&self) -> &DependencyScheduler {
        &self.scheduler
    }

    /// Checkpoint workflow.
    pub fn checkpoints(&self) -> &CheckpointWorkflow {
        &self.checkpoints
    }

    /// Auto-approval rules.
    pub fn auto_approval(&self) -> &AutoApprovalHandler {
        &self.auto_approval
    }

    /// Intervention service.
    pub fn interventions(&self) -> &InterventionService {
        &self.interventions
    }

    /// Worker spawner.
    pub fn spawner(&self) -> &WorkerSpawner {
        &self.spawner
    }

    /// Snapshot service.
    pub fn snapshots(&self) -> &SnapshotService {
        &self.snapshots
    }

    /// Quality settings.
    pub fn quality(&self) -> &QualitySettings {
        &self.quality
    }

    /// Project service.
    pub fn projects(&self) -> &ProjectService {
        &self.projects
    }

    /// Run a recovery pass against this process's ownership registries.
    pub fn recover(&self) -> FoundryResult<RecoveryReport> {
        RecoveryService::new(
            Arc::clone(&self.ctx.store),
            Arc::clone(&self.ctx.bus),
            Arc::clone(&self.ctx.running),
            self.queue.in_flight(),
        )
        .run()
    }

    /// Recover, then start the job poller.
    ///
    /// Recovery finishes before the first poll so a requeued job is never
    /// dispatched while its old row is still being reconciled.
    pub fn boot(&self) -> FoundryResult<RecoveryReport> {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return Err(FoundryError::conflict(
                "control plane",
                "local",
                "booted",
                "boot",
            ));
        }
        let report = self.recover()?;
        *poller = Some(self.queue.start());
        info!(
            interrupted_agents = report.interrupted_agents.len(),
            requeued_jobs = report.requeued_jobs.len(),
            "Control plane booted"
        );
        Ok(report)
    }

    /// Stop the poller and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Job poller terminated abnormally");
            }
        }
        info!("Control plane stopped");
    }

    /// Create an intervention and, when it targets an agent, activate that
    /// agent for it.
    ///
    /// A target still waiting on checkpoint approval keeps the intervention
    /// on record but is not activated.
    pub fn intervene(
        &self,
        project_id: Uuid,
        target_agent_id: Option<Uuid>,
        message: &str,
        priority: InterventionPriority,
    ) -> FoundryResult<InterventionOutcome> {
        let intervention =
            self.interventions
                .create(project_id, target_agent_id, message, priority)?;
        let Some(target) = target_agent_id else {
            return Ok(InterventionOutcome {
                intervention,
                activation: None,
            });
        };
        let activation = match self
            .lifecycle
            .activate_for_intervention(target, intervention.id)
        {
            Ok(activation) => Some(activation),
            Err(e @ FoundryError::StateConflict { .. }) => {
                info!(agent_id = %target, intervention_id = %intervention.id, reason = %e, "Intervention target not activated");
                None
            }
            Err(e) => return Err(e),
        };
        let intervention = self.interventions.get(intervention.id)?;
        Ok(InterventionOutcome {
            intervention,
            activation,
        })
    }

    /// Queue a provider call on behalf of a running agent.
    pub fn submit_job(&self, request: JobRequest) -> FoundryResult<Uuid> {
        let agent = self.lifecycle.get(request.agent_id)?;
        if agent.project_id != request.project_id {
            return Err(FoundryError::Validation(format!(
                "agent {} does not belong to project {}",
                agent.id, request.project_id
            )));
        }
        if agent.status != AgentStatus::Running {
            return Err(FoundryError::conflict(
                "agent",
                agent.id,
                agent.status,
                "submit a job for",
            ));
        }
        self.queue.submit(request)
    }
}
