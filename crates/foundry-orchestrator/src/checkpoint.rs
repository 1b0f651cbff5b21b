use crate::context::Context;
use crate::lifecycle::{
    complete_agent, ensure_status, fail_agent, wait_for_approval, REJECTED_REASON,
};
use crate::quality::effective_setting;
use crate::scheduler::advance_phase_if_ready;
use chrono::Utc;
use foundry_core::{
    Agent, AgentStatus, Asset, AssetStatus, Checkpoint, CheckpointStatus, DomainEvent,
    FoundryError, FoundryResult, Resolution,
};
use foundry_store::Db;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Progress an agent is rewound to when a revision is requested.
pub const REVISION_PROGRESS: u8 = 80;
/// Task label of an agent reworking its output after a revision request.
pub const REVISION_TASK: &str = "revision in progress";

/// Apply a resolution to a pending checkpoint and its agent.
///
/// Returns the agent's status afterwards. The caller runs the phase check.
pub(crate) fn apply_resolution(
    db: &Db<'_>,
    checkpoint: &mut Checkpoint,
    resolution: Resolution,
    feedback: Option<String>,
    events: &mut Vec<DomainEvent>,
) -> FoundryResult<AgentStatus> {
    if checkpoint.status != CheckpointStatus::Pending {
        return Err(FoundryError::conflict(
            "checkpoint",
            checkpoint.id,
            checkpoint.status,
            "resolve",
        ));
    }
    let mut agent = db.require_agent(checkpoint.agent_id)?;

    match resolution {
        Resolution::Rejected => {
            checkpoint.status = CheckpointStatus::Rejected;
            checkpoint.feedback = feedback;
            checkpoint.resolved_at = Some(Utc::now());
            db.update_checkpoint(checkpoint)?;
            if !agent.status.is_terminal() {
                fail_agent(db, &mut agent, REJECTED_REASON, events)?;
            }
        }
        Resolution::RevisionRequested => {
            // The checkpoint is discarded; the agent re-enters its work loop.
            checkpoint.status = CheckpointStatus::RevisionRequested;
            checkpoint.feedback = feedback;
            checkpoint.resolved_at = Some(Utc::now());
            db.delete_checkpoint(checkpoint.id)?;
            if matches!(
                agent.status,
                AgentStatus::WaitingApproval | AgentStatus::Running
            ) {
                agent.status = AgentStatus::Running;
                agent.progress = REVISION_PROGRESS;
                agent.current_task = Some(REVISION_TASK.to_string());
                agent.completed_at = None;
                db.update_agent(&agent)?;
                events.push(DomainEvent::AgentProgress {
                    project_id: agent.project_id,
                    agent_id: agent.id,
                    progress: agent.progress,
                    current_task: agent.current_task.clone(),
                });
            }
        }
        Resolution::Approved => {
            checkpoint.status = CheckpointStatus::Approved;
            checkpoint.feedback = feedback;
            checkpoint.resolved_at = Some(Utc::now());
            db.update_checkpoint(checkpoint)?;
            if agent.status == AgentStatus::WaitingApproval
                && db.count_pending_checkpoints(agent.id)? == 0
            {
                complete_agent(db, &mut agent, events)?;
            }
        }
    }

    info!(
        checkpoint_id = %checkpoint.id,
        agent_id = %agent.id,
        resolution = %resolution,
        agent_status = %agent.status,
        "Checkpoint resolved"
    );
    events.push(DomainEvent::CheckpointResolved {
        project_id: checkpoint.project_id,
        agent_id: agent.id,
        checkpoint_id: checkpoint.id,
        resolution,
        agent_status: agent.status,
    });
    Ok(agent.status)
}

/// Approve a pending asset.
pub(crate) fn approve_asset(
    db: &Db<'_>,
    asset: &mut Asset,
    events: &mut Vec<DomainEvent>,
) -> FoundryResult<()> {
    asset.status = AssetStatus::Approved;
    db.update_asset_status(asset.id, asset.status)?;
    events.push(DomainEvent::AssetResolved {
        project_id: asset.project_id,
        asset_id: asset.id,
        approved: true,
    });
    Ok(())
}

/// Result of [`CheckpointWorkflow::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveOutcome {
    /// The resolved checkpoint.
    pub checkpoint: Checkpoint,
    /// Status of the reviewed agent afterwards.
    pub agent_status: AgentStatus,
    /// New phase ordinal if the resolution cleared the project's phase.
    pub advanced_to: Option<u32>,
}

/// What happened to an agent's submitted output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputOutcome {
    /// Review is disabled for the type; the agent completed directly.
    Accepted {
        /// The completed agent.
        agent: Agent,
    },
    /// A checkpoint was created (and possibly auto-approved).
    Checkpoint {
        /// The new checkpoint.
        checkpoint: Checkpoint,
        /// The agent, `waiting_approval` or already `completed`.
        agent: Agent,
    },
}

/// Human review gates for agent output and generated assets.
#[derive(Clone)]
pub struct CheckpointWorkflow {
    ctx: Context,
}

impl CheckpointWorkflow {
    /// Workflow over the shared context.
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Checkpoint by id.
    pub fn get(&self, checkpoint_id: Uuid) -> FoundryResult<Checkpoint> {
        self.ctx.read(|db| db.require_checkpoint(checkpoint_id))
    }

    /// Checkpoints of a project, oldest first.
    pub fn list(&self, project_id: Uuid) -> FoundryResult<Vec<Checkpoint>> {
        self.ctx.read(|db| db.list_checkpoints(project_id))
    }

    /// Pending checkpoints of a project, oldest first.
    pub fn list_pending(&self, project_id: Uuid) -> FoundryResult<Vec<Checkpoint>> {
        self.ctx.read(|db| db.list_pending_checkpoints(project_id))
    }

    /// Hand in a running agent's output.
    ///
    /// When the type's quality setting is enabled the output goes through a
    /// checkpoint of the type's configured category; otherwise the agent is
    /// completed without review.
    pub fn submit_output(
        &self,
        agent_id: Uuid,
        output: serde_json::Value,
    ) -> FoundryResult<OutputOutcome> {
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            ensure_status(&agent, &[AgentStatus::Running], "submit output for")?;
            let setting =
                effective_setting(db, &self.ctx.pipeline, agent.project_id, agent.agent_type)?;
            if !setting.enabled {
                complete_agent(db, &mut agent, events)?;
                advance_phase_if_ready(db, &self.ctx.pipeline, agent.project_id, events)?;
                return Ok(OutputOutcome::Accepted { agent });
            }
            let checkpoint_type = self.ctx.pipeline.checkpoint_type_for(agent.agent_type);
            let checkpoint = self.insert_checkpoint(db, &mut agent, &checkpoint_type, output, events)?;
            Ok(OutputOutcome::Checkpoint { checkpoint, agent })
        })
    }

    /// Open a checkpoint for a running (or already waiting) agent.
    ///
    /// If an auto-approval rule covers `checkpoint_type` the checkpoint is
    /// born approved and the agent completes once nothing else is pending;
    /// otherwise the agent moves to `waiting_approval`.
    pub fn create(
        &self,
        agent_id: Uuid,
        checkpoint_type: &str,
        output: serde_json::Value,
    ) -> FoundryResult<Checkpoint> {
        if checkpoint_type.trim().is_empty() {
            return Err(FoundryError::Validation("checkpoint type is empty".into()));
        }
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            ensure_status(
                &agent,
                &[AgentStatus::Running, AgentStatus::WaitingApproval],
                "open a checkpoint for",
            )?;
            self.insert_checkpoint(db, &mut agent, checkpoint_type, output, events)
        })
    }

    fn insert_checkpoint(
        &self,
        db: &Db<'_>,
        agent: &mut Agent,
        checkpoint_type: &str,
        output: serde_json::Value,
        events: &mut Vec<DomainEvent>,
    ) -> FoundryResult<Checkpoint> {
        let mut checkpoint = Checkpoint::new(agent.project_id, agent.id, checkpoint_type, output);
        let auto = db.is_auto_approved(agent.project_id, checkpoint_type)?;
        if auto {
            checkpoint.status = CheckpointStatus::Approved;
            checkpoint.resolved_at = Some(Utc::now());
        }
        db.insert_checkpoint(&checkpoint)?;
        info!(
            checkpoint_id = %checkpoint.id,
            agent_id = %agent.id,
            checkpoint_type,
            auto_approved = auto,
            "Checkpoint created"
        );
        events.push(DomainEvent::CheckpointCreated {
            project_id: agent.project_id,
            agent_id: agent.id,
            checkpoint_id: checkpoint.id,
            checkpoint_type: checkpoint.checkpoint_type.clone(),
            status: checkpoint.status,
        });

        if !auto {
            if agent.status == AgentStatus::Running {
                wait_for_approval(db, agent, events)?;
            }
        } else if db.count_pending_checkpoints(agent.id)? == 0 {
            complete_agent(db, agent, events)?;
            advance_phase_if_ready(db, &self.ctx.pipeline, agent.project_id, events)?;
        }
        Ok(checkpoint)
    }

    /// Resolve a pending checkpoint.
    ///
    /// * `approved` completes a `waiting_approval` agent once it has no other
    ///   pending checkpoint.
    /// * `rejected` fails the agent with reason `rejected`.
    /// * `revision_requested` deletes the checkpoint and sends the agent back
    ///   to `running` at 80% progress.
    ///
    /// The phase check runs in the same transaction as the status write.
    /// Resolving a checkpoint that is no longer pending is refused.
    pub fn resolve(
        &self,
        checkpoint_id: Uuid,
        resolution: Resolution,
        feedback: Option<String>,
    ) -> FoundryResult<ResolveOutcome> {
        self.ctx.commit(|db, events| {
            let mut checkpoint = db.require_checkpoint(checkpoint_id)?;
            let agent_status = apply_resolution(db, &mut checkpoint, resolution, feedback, events)?;
            let advanced_to =
                advance_phase_if_ready(db, &self.ctx.pipeline, checkpoint.project_id, events)?;
            Ok(ResolveOutcome {
                checkpoint,
                agent_status,
                advanced_to,
            })
        })
    }

    /// Record a generated asset. Auto-approval rules on `category` apply.
    pub fn create_asset(
        &self,
        agent_id: Uuid,
        category: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> FoundryResult<Asset> {
        self.ctx.commit(|db, events| {
            let agent = db.require_agent(agent_id)?;
            let mut asset = Asset::new(agent.project_id, agent.id, category, name, payload);
            let auto = db.is_auto_approved(agent.project_id, category)?;
            if auto {
                asset.status = AssetStatus::Approved;
            }
            db.insert_asset(&asset)?;
            events.push(DomainEvent::AssetCreated {
                project_id: asset.project_id,
                asset_id: asset.id,
                category: asset.category.clone(),
                auto_approved: auto,
            });
            Ok(asset)
        })
    }

    /// Approve or reject a pending asset.
    pub fn resolve_asset(&self, asset_id: Uuid, approved: bool) -> FoundryResult<Asset> {
        self.ctx.commit(|db, events| {
            let mut asset = db.require_asset(asset_id)?;
            if asset.status != AssetStatus::Pending {
                return Err(FoundryError::conflict("asset", asset_id, asset.status, "resolve"));
            }
            if approved {
                approve_asset(db, &mut asset, events)?;
            } else {
                asset.status = AssetStatus::Rejected;
                db.update_asset_status(asset.id, asset.status)?;
                events.push(DomainEvent::AssetResolved {
                    project_id: asset.project_id,
                    asset_id,
                    approved: false,
                });
            }
            Ok(asset)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleManager;
    use crate::testing::fixture;
    use foundry_core::{AgentType, EventKind, QualitySetting};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn running_agent(ctx: &Context, project_id: Uuid, agent_type: AgentType) -> Agent {
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = lifecycle.register_agent(project_id, agent_type, None).unwrap();
        lifecycle.start(agent.id).unwrap()
    }

    #[test]
    fn test_checkpoint_moves_agent_to_waiting_approval() {
        let (ctx, project) = fixture();
        let workflow = CheckpointWorkflow::new(ctx.clone());
        let agent = running_agent(&ctx, project.id, AgentType::Concept);

        let outcome = workflow.submit_output(agent.id, json!({"pitch": "..."})).unwrap();
        let OutputOutcome::Checkpoint { checkpoint, agent } = outcome else {
            panic!("review is enabled for concept agents");
        };
        assert_eq!(checkpoint.checkpoint_type, "concept");
        assert_eq!(checkpoint.status, CheckpointStatus::Pending);
        assert_eq!(agent.status, AgentStatus::WaitingApproval);
        assert!(!ctx.running.owns(agent.id));
    }

    #[test]
    fn test_approval_completes_only_after_last_pending() {
        let (ctx, project) = fixture();
        let workflow = CheckpointWorkflow::new(ctx.clone());
        let agent = running_agent(&ctx, project.id, AgentType::Design);
        let first = workflow.create(agent.id, "design", json!(1)).unwrap();
        let second = workflow.create(agent.id, "design", json!(2)).unwrap();

        let outcome = workflow.resolve(first.id, Resolution::Approved, None).unwrap();
        assert_eq!(outcome.agent_status, AgentStatus::WaitingApproval);

        let outcome = workflow
            .resolve(second.id, Resolution::Approved, Some("ship it".into()))
            .unwrap();
        assert_eq!(outcome.agent_status, AgentStatus::Completed);
        assert_eq!(outcome.checkpoint.feedback.as_deref(), Some("ship it"));
    }

    #[test]
    fn test_rejection_fails_agent() {
        let (ctx, project) = fixture();
        let workflow = CheckpointWorkflow::new(ctx.clone());
        let agent = running_agent(&ctx, project.id, AgentType::Concept);
        let checkpoint = workflow.create(agent.id, "concept", json!({})).unwrap();

        let outcome = workflow
            .resolve(checkpoint.id, Resolution::Rejected, Some("off brief".into()))
            .unwrap();
        assert_eq!(outcome.agent_status, AgentStatus::Failed);
        let agent = ctx.store.read(|db| db.require_agent(agent.id)).unwrap();
        assert_eq!(agent.last_error.as_deref(), Some(REJECTED_REASON));
    }

    #[test]
    fn test_revision_deletes_checkpoint_and_rewinds() {
        let (ctx, project) = fixture();
        let workflow = CheckpointWorkflow::new(ctx.clone());
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = running_agent(&ctx, project.id, AgentType::Concept);
        lifecycle.update_progress(agent.id, 95, None).unwrap();
        let checkpoint = workflow.create(agent.id, "concept", json!({})).unwrap();

        let outcome = workflow
            .resolve(checkpoint.id, Resolution::RevisionRequested, Some("more color".into()))
            .unwrap();
        assert_eq!(outcome.agent_status, AgentStatus::Running);

        let agent = lifecycle.get(agent.id).unwrap();
        assert_eq!(agent.progress, REVISION_PROGRESS);
        assert_eq!(agent.current_task.as_deref(), Some(REVISION_TASK));
        assert!(ctx.running.owns(agent.id));
        assert!(ctx
            .store
            .read(|db| db.get_checkpoint(checkpoint.id))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_second_resolution_is_refused_and_advances_once() {
        let (ctx, project) = fixture();
        let workflow = CheckpointWorkflow::new(ctx.clone());
        let advanced = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&advanced);
        ctx.bus.subscribe(EventKind::PhaseAdvanced, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let agent = running_agent(&ctx, project.id, AgentType::Concept);
        let checkpoint = workflow.create(agent.id, "concept", json!({})).unwrap();
        let outcome = workflow.resolve(checkpoint.id, Resolution::Approved, None).unwrap();
        assert_eq!(outcome.advanced_to, Some(1));

        let err = workflow
            .resolve(checkpoint.id, Resolution::Approved, None)
            .unwrap_err();
        assert!(matches!(err, FoundryError::StateConflict { .. }));
        assert_eq!(advanced.load(Ordering::SeqCst), 1);
        let project = ctx.store.read(|db| db.require_project(project.id)).unwrap();
        assert_eq!(project.current_phase, 1);
    }

    #[test]
    fn test_disabled_review_accepts_output_directly() {
        let (ctx, project) = fixture();
        let workflow = CheckpointWorkflow::new(ctx.clone());
        let agent = running_agent(&ctx, project.id, AgentType::Tester);
        ctx.store
            .transaction(|db| {
                db.upsert_quality_setting(&QualitySetting {
                    project_id: project.id,
                    agent_type: AgentType::Tester,
                    enabled: false,
                    max_retries: 3,
                    high_cost: false,
                })
            })
            .unwrap();

        let outcome = workflow.submit_output(agent.id, json!({"passed": 12})).unwrap();
        let OutputOutcome::Accepted { agent } = outcome else {
            panic!("review disabled");
        };
        assert_eq!(agent.status, AgentStatus::Completed);
        assert!(workflow.list(project.id).unwrap().is_empty());
    }

    #[test]
    fn test_asset_resolution() {
        let (ctx, project) = fixture();
        let workflow = CheckpointWorkflow::new(ctx.clone());
        let agent = running_agent(&ctx, project.id, AgentType::AssetLeader);
        let asset = workflow
            .create_asset(agent.id, "sprite", "hero.png", json!({"w": 64}))
            .unwrap();
        assert_eq!(asset.status, AssetStatus::Pending);

        let resolved = workflow.resolve_asset(asset.id, false).unwrap();
        assert_eq!(resolved.status, AssetStatus::Rejected);
        assert!(workflow.resolve_asset(asset.id, true).is_err());
    }
}
