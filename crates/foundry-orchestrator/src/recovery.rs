use foundry_core::{
    AgentStatus, DomainEvent, EventBus, FoundryResult, JobStatus, OwnershipRegistry,
};
use foundry_store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What a recovery pass reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Agents found `running` without a live owner, now `interrupted`.
    pub interrupted_agents: Vec<Uuid>,
    /// Jobs found `running` without a live worker, now `pending` again.
    pub requeued_jobs: Vec<Uuid>,
}

impl RecoveryReport {
    /// Whether nothing needed resetting.
    pub fn is_clean(&self) -> bool {
        self.interrupted_agents.is_empty() && self.requeued_jobs.is_empty()
    }
}

/// Startup reconciliation of work orphaned by a previous process.
///
/// Nothing left in flight is assumed to have succeeded. A `running` agent
/// with no owner becomes `interrupted` and waits for an explicit retry; a
/// `running` job with no worker goes back to `pending` with its retry count
/// untouched. Agents waiting on a human (`waiting_approval`,
/// `waiting_response`) or `paused` need no live owner and are left as is.
pub struct RecoveryService {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    running_agents: Arc<OwnershipRegistry>,
    in_flight_jobs: Arc<OwnershipRegistry>,
}

impl RecoveryService {
    /// Service over the store and both ownership registries.
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        running_agents: Arc<OwnershipRegistry>,
        in_flight_jobs: Arc<OwnershipRegistry>,
    ) -> Self {
        Self {
            store,
            bus,
            running_agents,
            in_flight_jobs,
        }
    }

    /// Run one pass. Must complete before the queue starts polling.
    pub fn run(&self) -> FoundryResult<RecoveryReport> {
        let mut events = Vec::new();
        let report = self.store.transaction(|db| {
            let mut report = RecoveryReport::default();

            for mut agent in db.list_agents_with_status(&[AgentStatus::Running])? {
                if self.running_agents.owns(agent.id) {
                    continue;
                }
                let previous_status = agent.status;
                agent.status = AgentStatus::Interrupted;
                db.update_agent(&agent)?;
                warn!(agent_id = %agent.id, project_id = %agent.project_id, "Orphaned agent interrupted");
                events.push(DomainEvent::AgentInterrupted {
                    project_id: agent.project_id,
                    agent_id: agent.id,
                    previous_status,
                });
                report.interrupted_agents.push(agent.id);
            }

            for mut job in db.list_jobs_with_status(JobStatus::Running)? {
                if self.in_flight_jobs.owns(job.id) {
                    continue;
                }
                job.status = JobStatus::Pending;
                job.started_at = None;
                // Lost to a concurrent writer; that writer owns the job now.
                if !db.transition_job(&job, JobStatus::Running)? {
                    continue;
                }
                warn!(job_id = %job.id, project_id = %job.project_id, "Orphaned job requeued");
                events.push(DomainEvent::JobRequeued {
                    project_id: job.project_id,
                    job_id: job.id,
                    previous_status: JobStatus::Running,
                });
                report.requeued_jobs.push(job.id);
            }
            Ok(report)
        })?;

        self.bus.publish_all(&events);
        info!(
            interrupted_agents = report.interrupted_agents.len(),
            requeued_jobs = report.requeued_jobs.len(),
            "Recovery complete"
        );
        Ok(report)
    }
}
