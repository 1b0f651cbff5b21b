use foundry_core::{BudgetConfig, BudgetEnforcement, FoundryError, FoundryResult};
use foundry_store::Db;
use tracing::warn;
use uuid::Uuid;

/// Per-project token accounting checked on every job submission.
///
/// Usage is summed from the project's completed jobs in the store at every
/// check, so tokens recorded by other queues or processes sharing the store
/// count the same as this queue's own.
pub struct BudgetGuard {
    config: BudgetConfig,
}

impl BudgetGuard {
    /// Guard enforcing `config`.
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    /// Limits and enforcement mode in effect.
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Tokens used so far by the project's completed jobs.
    pub fn usage(&self, db: &Db<'_>, project_id: Uuid) -> FoundryResult<u64> {
        db.project_token_usage(project_id)
    }

    /// Admission check for a new submission. Fails only under hard enforcement.
    pub fn check(&self, db: &Db<'_>, project_id: Uuid) -> FoundryResult<u64> {
        if self.config.enforcement == BudgetEnforcement::Off {
            return Ok(0);
        }
        let used = self.usage(db, project_id)?;
        if used >= self.config.hard_limit {
            if self.config.enforcement == BudgetEnforcement::Hard {
                warn!(project_id = %project_id, used, limit = self.config.hard_limit, "Submission refused: token budget exhausted");
                return Err(FoundryError::BudgetExceeded {
                    project_id: project_id.to_string(),
                    used,
                    limit: self.config.hard_limit,
                });
            }
            warn!(project_id = %project_id, used, limit = self.config.hard_limit, "Project is over its token budget (soft enforcement)");
        } else if used >= self.config.warning_threshold {
            warn!(project_id = %project_id, used, threshold = self.config.warning_threshold, "Project is approaching its token budget");
        }
        Ok(used)
    }
}
