use crate::context::Context;
use crate::lifecycle::ensure_status;
use chrono::Utc;
use foundry_core::{
    Agent, AgentStatus, DomainEvent, FoundryError, FoundryResult, WorkerTask, WorkflowSnapshot,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Result of [`SnapshotService::rollback`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollback {
    /// The agent after restoring.
    pub agent: Agent,
    /// The snapshot restored.
    pub snapshot: WorkflowSnapshot,
    /// Snapshots of the same run captured after the restored one, now deleted.
    pub discarded: usize,
}

/// Point-in-time captures of an agent's working state.
#[derive(Clone)]
pub struct SnapshotService {
    ctx: Context,
}

impl SnapshotService {
    /// Service over the shared context.
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Capture the agent's current progress and task label together with
    /// caller-supplied state and worker list.
    pub fn capture(
        &self,
        agent_id: Uuid,
        workflow_run_id: Uuid,
        step: &str,
        state: serde_json::Value,
        worker_tasks: Vec<WorkerTask>,
    ) -> FoundryResult<WorkflowSnapshot> {
        if step.trim().is_empty() {
            return Err(FoundryError::Validation("snapshot step is empty".into()));
        }
        self.ctx.commit(|db, _| {
            let agent = db.require_agent(agent_id)?;
            let snapshot = WorkflowSnapshot {
                id: Uuid::new_v4(),
                agent_id,
                workflow_run_id,
                step: step.to_string(),
                progress: agent.progress,
                current_task: agent.current_task.clone(),
                state,
                worker_tasks,
                created_at: Utc::now(),
            };
            db.insert_snapshot(agent.project_id, &snapshot)?;
            info!(agent_id = %agent_id, run = %workflow_run_id, step, "Snapshot captured");
            Ok(snapshot)
        })
    }

    /// Snapshots of an agent, optionally limited to one run, oldest first.
    pub fn list(
        &self,
        agent_id: Uuid,
        workflow_run_id: Option<Uuid>,
    ) -> FoundryResult<Vec<WorkflowSnapshot>> {
        self.ctx.read(|db| db.list_snapshots(agent_id, workflow_run_id))
    }

    /// Most recent snapshot of an agent.
    pub fn latest(&self, agent_id: Uuid) -> FoundryResult<Option<WorkflowSnapshot>> {
        self.ctx.read(|db| db.latest_snapshot(agent_id))
    }

    /// Restore an agent to a snapshot's progress and task label.
    ///
    /// Only a stopped agent (`paused`, `interrupted` or `pending`) can be
    /// rolled back. Later snapshots of the same run are discarded.
    pub fn rollback(&self, snapshot_id: Uuid) -> FoundryResult<Rollback> {
        self.ctx.commit(|db, events| {
            let snapshot = db.require_snapshot(snapshot_id)?;
            let mut agent = db.require_agent(snapshot.agent_id)?;
            ensure_status(
                &agent,
                &[
                    AgentStatus::Paused,
                    AgentStatus::Interrupted,
                    AgentStatus::Pending,
                ],
                "roll back",
            )?;
            agent.progress = snapshot.progress;
            agent.current_task = snapshot.current_task.clone();
            db.update_agent(&agent)?;
            let discarded = db.delete_snapshots_after(snapshot_id)?;
            info!(
                agent_id = %agent.id,
                snapshot_id = %snapshot_id,
                step = %snapshot.step,
                discarded,
                "Agent rolled back"
            );
            events.push(DomainEvent::AgentProgress {
                project_id: agent.project_id,
                agent_id: agent.id,
                progress: agent.progress,
                current_task: agent.current_task.clone(),
            });
            Ok(Rollback {
                agent,
                snapshot,
                discarded,
            })
        })
    }
}
