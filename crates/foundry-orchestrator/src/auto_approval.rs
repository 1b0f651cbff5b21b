use crate::checkpoint::{apply_resolution, approve_asset};
use crate::context::Context;
use crate::scheduler::advance_phase_if_ready;
use foundry_core::{AgentStatus, DomainEvent, FoundryError, FoundryResult, Resolution};
use foundry_store::Db;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

/// What a rule change approved retroactively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoApprovalSummary {
    /// Pending checkpoints approved.
    pub checkpoints_approved: usize,
    /// Pending assets approved.
    pub assets_approved: usize,
    /// Agents that left `waiting_approval` because their last pending checkpoint was approved.
    pub agents_completed: usize,
}

impl AutoApprovalSummary {
    /// Whether nothing was approved.
    pub fn is_empty(&self) -> bool {
        self.checkpoints_approved == 0 && self.assets_approved == 0
    }
}

/// Per-project `{category -> enabled}` rules that skip human review.
///
/// Rules are consulted when checkpoints and assets are created (see
/// [`CheckpointWorkflow`](crate::CheckpointWorkflow)) and applied to
/// everything still pending whenever they change.
#[derive(Clone)]
pub struct AutoApprovalHandler {
    ctx: Context,
}

impl AutoApprovalHandler {
    /// Handler over the shared context.
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Current rules of a project.
    pub fn rules(&self, project_id: Uuid) -> FoundryResult<HashMap<String, bool>> {
        self.ctx.read(|db| {
            db.require_project(project_id)?;
            db.auto_approval_rules(project_id)
        })
    }

    /// Persist `rules` and approve every pending checkpoint and asset whose
    /// category is now enabled, in one transaction.
    pub fn set_rules(
        &self,
        project_id: Uuid,
        rules: HashMap<String, bool>,
    ) -> FoundryResult<AutoApprovalSummary> {
        if rules.keys().any(|category| category.trim().is_empty()) {
            return Err(FoundryError::Validation(
                "auto-approval category is empty".into(),
            ));
        }
        self.ctx.commit(|db, events| {
            db.require_project(project_id)?;
            for (category, enabled) in &rules {
                db.set_auto_approval_rule(project_id, category, *enabled)?;
            }
            let summary = self.apply_in(db, project_id, events)?;
            info!(
                project_id = %project_id,
                rules = rules.len(),
                checkpoints = summary.checkpoints_approved,
                assets = summary.assets_approved,
                "Auto-approval rules updated"
            );
            Ok(summary)
        })
    }

    /// Re-apply the stored rules to whatever is pending.
    pub fn apply(&self, project_id: Uuid) -> FoundryResult<AutoApprovalSummary> {
        self.ctx.commit(|db, events| {
            db.require_project(project_id)?;
            self.apply_in(db, project_id, events)
        })
    }

    fn apply_in(
        &self,
        db: &Db<'_>,
        project_id: Uuid,
        events: &mut Vec<DomainEvent>,
    ) -> FoundryResult<AutoApprovalSummary> {
        let rules = db.auto_approval_rules(project_id)?;
        let enabled = |category: &str| rules.get(category).copied().unwrap_or(false);
        let mut summary = AutoApprovalSummary::default();

        for mut checkpoint in db.list_pending_checkpoints(project_id)? {
            if !enabled(&checkpoint.checkpoint_type) {
                continue;
            }
            let before = db.require_agent(checkpoint.agent_id)?.status;
            let after = apply_resolution(db, &mut checkpoint, Resolution::Approved, None, events)?;
            summary.checkpoints_approved += 1;
            if before == AgentStatus::WaitingApproval && after == AgentStatus::Completed {
                summary.agents_completed += 1;
            }
        }

        for mut asset in db.list_pending_assets(project_id)? {
            if enabled(&asset.category) {
                approve_asset(db, &mut asset, events)?;
                summary.assets_approved += 1;
            }
        }

        if !summary.is_empty() {
            advance_phase_if_ready(db, &self.ctx.pipeline, project_id, events)?;
        }
        Ok(summary)
    }
}
