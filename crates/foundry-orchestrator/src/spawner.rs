use crate::context::Context;
use foundry_core::{Agent, AgentStatus, AgentType, FoundryError, FoundryResult};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// A request to fan a worker out under a running leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Leader the worker belongs to.
    pub leader_id: Uuid,
    /// Must be the worker type paired with the leader's type.
    pub agent_type: AgentType,
    /// Task label the worker starts with.
    pub task: String,
}

impl SpawnRequest {
    /// Build a request.
    pub fn new(leader_id: Uuid, agent_type: AgentType, task: impl Into<String>) -> Self {
        Self {
            leader_id,
            agent_type,
            task: task.into(),
        }
    }
}

/// Creates worker agents under leaders, bounded by the pipeline's
/// `max_workers_per_leader`.
///
/// Workers are created `pending` in their leader's phase and have no type
/// dependencies of their own, so the scheduler starts them on its next pass.
#[derive(Clone)]
pub struct WorkerSpawner {
    ctx: Context,
}

impl WorkerSpawner {
    /// Spawner over the shared context.
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Spawn one worker.
    ///
    /// Fails if the leader does not exist, is not running, is not a leader
    /// of `agent_type` workers, or already has the maximum number of children.
    pub fn spawn(&self, request: SpawnRequest) -> FoundryResult<Agent> {
        let max = self.ctx.pipeline.max_workers_per_leader;
        if request.task.trim().is_empty() {
            return Err(FoundryError::Validation("worker task is empty".into()));
        }
        self.ctx.commit(|db, _| {
            let leader = db.require_agent(request.leader_id)?;
            match leader.agent_type.worker_type() {
                Some(worker) if worker == request.agent_type => {}
                _ => {
                    return Err(FoundryError::Validation(format!(
                        "{} agents cannot spawn {} workers",
                        leader.agent_type, request.agent_type
                    )))
                }
            }
            if leader.status != AgentStatus::Running {
                return Err(FoundryError::conflict(
                    "agent",
                    leader.id,
                    leader.status,
                    "spawn workers from",
                ));
            }
            let children = db.children_of(leader.id)?.len();
            if children >= max as usize {
                return Err(FoundryError::Validation(format!(
                    "leader {} already has {children} workers (max {max})",
                    leader.id
                )));
            }

            let mut worker = Agent::new(leader.project_id, request.agent_type, leader.phase)
                .with_parent(leader.id);
            worker.current_task = Some(request.task.clone());
            db.insert_agent(&worker)?;
            info!(
                leader_id = %leader.id,
                worker_id = %worker.id,
                worker_type = %worker.agent_type,
                "Worker spawned"
            );
            Ok(worker)
        })
    }

    /// Direct children of a leader, in creation order.
    pub fn children_of(&self, leader_id: Uuid) -> FoundryResult<Vec<Agent>> {
        self.ctx.read(|db| {
            db.require_agent(leader_id)?;
            db.children_of(leader_id)
        })
    }
}
