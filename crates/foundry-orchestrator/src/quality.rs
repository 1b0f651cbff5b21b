use crate::context::Context;
use foundry_core::{AgentType, FoundryError, FoundryResult, PipelineConfig, QualitySetting};
use foundry_store::Db;
use tracing::info;
use uuid::Uuid;

/// The stored setting, or the pipeline default for the type when none is stored.
pub(crate) fn effective_setting(
    db: &Db<'_>,
    pipeline: &PipelineConfig,
    project_id: Uuid,
    agent_type: AgentType,
) -> FoundryResult<QualitySetting> {
    if let Some(setting) = db.get_quality_setting(project_id, agent_type)? {
        return Ok(setting);
    }
    let defaults = pipeline.agent(agent_type);
    Ok(QualitySetting {
        project_id,
        agent_type,
        enabled: defaults.map(|a| a.review).unwrap_or(true),
        max_retries: defaults.map(|a| a.max_retries).unwrap_or(3),
        high_cost: defaults.map(|a| a.high_cost).unwrap_or(false),
    })
}

/// Per-project, per-agent-type review policy.
#[derive(Clone)]
pub struct QualitySettings {
    ctx: Context,
}

impl QualitySettings {
    /// Service over the shared context.
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Effective setting, falling back to the pipeline defaults when none is stored.
    pub fn get(&self, project_id: Uuid, agent_type: AgentType) -> FoundryResult<QualitySetting> {
        self.ctx.read(|db| {
            db.require_project(project_id)?;
            effective_setting(db, &self.ctx.pipeline, project_id, agent_type)
        })
    }

    /// Store a new `enabled`/`max_retries` pair. `high_cost` is fixed and
    /// any attempt to change it is refused.
    pub fn update(&self, setting: QualitySetting) -> FoundryResult<QualitySetting> {
        self.ctx.commit(|db, _| {
            db.require_project(setting.project_id)?;
            let current =
                effective_setting(db, &self.ctx.pipeline, setting.project_id, setting.agent_type)?;
            if current.high_cost != setting.high_cost {
                return Err(FoundryError::Validation(format!(
                    "high_cost of {} is immutable",
                    setting.agent_type
                )));
            }
            db.upsert_quality_setting(&setting)?;
            info!(
                project_id = %setting.project_id,
                agent_type = %setting.agent_type,
                enabled = setting.enabled,
                max_retries = setting.max_retries,
                "Quality setting updated"
            );
            Ok(setting)
        })
    }
}
