use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of an agent in the production pipeline.
///
/// Leaders own a stage of the work; workers are fanned out under a leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Pitches the game concept.
    Concept,
    /// Writes the game design document.
    Design,
    /// Writes the scenario.
    Scenario,
    /// Designs the cast.
    Character,
    /// Builds the setting.
    World,
    /// Breaks the design into code and asset tasks.
    TaskSplit,
    /// Owns the code stage and fans out code workers.
    CodeLeader,
    /// Owns the asset stage and fans out asset workers.
    AssetLeader,
    /// Implements one code task.
    CodeWorker,
    /// Produces one asset task.
    AssetWorker,
    /// Merges worker output into a build.
    Integrator,
    /// Tests the integrated build.
    Tester,
    /// Final review before release.
    Reviewer,
}

text_enum!(AgentType {
    Concept => "concept",
    Design => "design",
    Scenario => "scenario",
    Character => "character",
    World => "world",
    TaskSplit => "task_split",
    CodeLeader => "code_leader",
    AssetLeader => "asset_leader",
    CodeWorker => "code_worker",
    AssetWorker => "asset_worker",
    Integrator => "integrator",
    Tester => "tester",
    Reviewer => "reviewer",
});

impl AgentType {
    /// Whether this type is spawned under a leader.
    pub fn is_worker(&self) -> bool {
        matches!(self, AgentType::CodeWorker | AgentType::AssetWorker)
    }

    /// The worker type a leader fans out to, if it has one.
    pub fn worker_type(&self) -> Option<AgentType> {
        match self {
            AgentType::CodeLeader => Some(AgentType::CodeWorker),
            AgentType::AssetLeader => Some(AgentType::AssetWorker),
            _ => None,
        }
    }
}

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Created, not started yet.
    Pending,
    /// Owned by a process and working.
    Running,
    /// Blocked on a checkpoint.
    WaitingApproval,
    /// Blocked on a human reply.
    WaitingResponse,
    /// Suspended by a human or a project pause.
    Paused,
    /// Finished successfully.
    Completed,
    /// Gave up, was rejected or was cancelled.
    Failed,
    /// Left mid-flight by an unclean shutdown; restartable via retry.
    Interrupted,
}

text_enum!(AgentStatus {
    Pending => "pending",
    Running => "running",
    WaitingApproval => "waiting_approval",
    WaitingResponse => "waiting_response",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
    Interrupted => "interrupted",
});

impl AgentStatus {
    /// `completed` and `failed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Failed)
    }
}

/// One unit of orchestrated work within a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent ID.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Pipeline role.
    pub agent_type: AgentType,
    /// Phase ordinal the agent belongs to.
    pub phase: u32,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// 0..=100.
    pub progress: u8,
    /// Human-readable label of the current task.
    pub current_task: Option<String>,
    /// Prompt tokens billed so far.
    pub input_tokens: u64,
    /// Completion tokens billed so far.
    pub output_tokens: u64,
    /// Leader that spawned this worker.
    pub parent_agent_id: Option<Uuid>,
    /// Retries used so far.
    pub retry_count: u32,
    /// Error from the last failure, cleared on retry.
    pub last_error: Option<String>,
    /// When the agent was created.
    pub created_at: DateTime<Utc>,
    /// When the agent first started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the agent reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Agent {
    /// New pending agent with a fresh ID.
    pub fn new(project_id: Uuid, agent_type: AgentType, phase: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            agent_type,
            phase,
            status: AgentStatus::Pending,
            progress: 0,
            current_task: None,
            input_tokens: 0,
            output_tokens: 0,
            parent_agent_id: None,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Attach the spawning leader.
    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_agent_id = Some(parent);
        self
    }

    /// Input plus output tokens.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Created, pipeline not started.
    Draft,
    /// Pipeline in progress.
    Running,
    /// Held by a human or an urgent intervention.
    Paused,
    /// Every phase is done.
    Completed,
    /// Stopped after an unrecoverable failure.
    Failed,
}

text_enum!(ProjectStatus {
    Draft => "draft",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
});

/// A production project. Owns its agents, checkpoints, assets, interventions and jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Unique project ID.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: ProjectStatus,
    /// Ordinal of the active phase.
    pub current_phase: u32,
    /// When the project was created.
    pub created_at: DateTime<Utc>,
    /// Last status or phase change.
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// New draft project at phase 0.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: ProjectStatus::Draft,
            current_phase: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Status of a human-review checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Awaiting a reviewer.
    Pending,
    /// Accepted.
    Approved,
    /// Refused; the agent fails.
    Rejected,
    /// Sent back for another pass.
    RevisionRequested,
}

text_enum!(CheckpointStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    RevisionRequested => "revision_requested",
});

/// A reviewer's decision on a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Accept the output.
    Approved,
    /// Refuse the output.
    Rejected,
    /// Ask for another pass.
    RevisionRequested,
}

text_enum!(Resolution {
    Approved => "approved",
    Rejected => "rejected",
    RevisionRequested => "revision_requested",
});

impl From<Resolution> for CheckpointStatus {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Approved => CheckpointStatus::Approved,
            Resolution::Rejected => CheckpointStatus::Rejected,
            Resolution::RevisionRequested => CheckpointStatus::RevisionRequested,
        }
    }
}

/// A human-review gate blocking an agent's completion until resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint ID.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Agent whose output is under review.
    pub agent_id: Uuid,
    /// Category key, e.g. `"design"`. Matched against phase sets and auto-approval rules.
    pub checkpoint_type: String,
    /// Current status.
    pub status: CheckpointStatus,
    /// Output under review.
    pub output: serde_json::Value,
    /// Reviewer feedback, if any.
    pub feedback: Option<String>,
    /// When the checkpoint was opened.
    pub created_at: DateTime<Utc>,
    /// When it was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// New pending checkpoint.
    pub fn new(
        project_id: Uuid,
        agent_id: Uuid,
        checkpoint_type: impl Into<String>,
        output: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            agent_id,
            checkpoint_type: checkpoint_type.into(),
            status: CheckpointStatus::Pending,
            output,
            feedback: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Review status of a generated asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    /// Awaiting review.
    Pending,
    /// Accepted.
    Approved,
    /// Refused.
    Rejected,
}

text_enum!(AssetStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// A generated asset awaiting (or past) review. Gates dependents like a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Unique asset ID.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Agent that produced it.
    pub agent_id: Uuid,
    /// Category key, e.g. `"sprite"`.
    pub category: String,
    /// Display name.
    pub name: String,
    /// Asset content or a reference to it.
    pub payload: serde_json::Value,
    /// Review status.
    pub status: AssetStatus,
    /// When the asset was recorded.
    pub created_at: DateTime<Utc>,
}

impl Asset {
    /// New pending asset.
    pub fn new(
        project_id: Uuid,
        agent_id: Uuid,
        category: impl Into<String>,
        name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            agent_id,
            category: category.into(),
            name: name.into(),
            payload,
            status: AssetStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Per-project, per-agent-type quality policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualitySetting {
    /// Owning project.
    pub project_id: Uuid,
    /// Agent type the policy applies to.
    pub agent_type: AgentType,
    /// When enabled, the agent's output goes through a checkpoint.
    pub enabled: bool,
    /// Retries allowed before the agent stays failed.
    pub max_retries: u32,
    /// Fixed when the setting is first created.
    pub high_cost: bool,
}

/// A task in a leader's worker list, captured by workflow snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTask {
    /// Task ID.
    pub id: Uuid,
    /// What the worker should do.
    pub description: String,
    /// Status of the worker running it.
    pub status: AgentStatus,
}

/// Immutable point-in-time capture of an agent's working state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Unique snapshot ID.
    pub id: Uuid,
    /// Agent captured.
    pub agent_id: Uuid,
    /// Run the snapshot belongs to.
    pub workflow_run_id: Uuid,
    /// Workflow step name.
    pub step: String,
    /// Progress in percent.
    pub progress: u8,
    /// Task label at capture time.
    pub current_task: Option<String>,
    /// Opaque workflow state.
    pub state: serde_json::Value,
    /// Worker list, for leaders.
    pub worker_tasks: Vec<WorkerTask>,
    /// When it was captured.
    pub created_at: DateTime<Utc>,
}
