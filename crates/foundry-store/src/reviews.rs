use crate::{count_col, json_col, text_col, Db, SqlContext};
use foundry_core::{
    AgentType, Asset, AssetStatus, Checkpoint, CheckpointStatus, FoundryError, FoundryResult,
    QualitySetting,
};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;
use uuid::Uuid;

const CHECKPOINT_COLUMNS: &str =
    "id, project_id, agent_id, checkpoint_type, status, output, feedback, created_at, resolved_at";

const ASSET_COLUMNS: &str = "id, project_id, agent_id, category, name, payload, status, created_at";

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: row.get(0)?,
        project_id: row.get(1)?,
        agent_id: row.get(2)?,
        checkpoint_type: row.get(3)?,
        status: text_col(row, 4)?,
        output: json_col(row, 5)?,
        feedback: row.get(6)?,
        created_at: row.get(7)?,
        resolved_at: row.get(8)?,
    })
}

fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<Asset> {
    Ok(Asset {
        id: row.get(0)?,
        project_id: row.get(1)?,
        agent_id: row.get(2)?,
        category: row.get(3)?,
        name: row.get(4)?,
        payload: json_col(row, 5)?,
        status: text_col(row, 6)?,
        created_at: row.get(7)?,
    })
}

impl Db<'_> {
    // --- Checkpoints ---

    /// Insert a new checkpoint row.
    pub fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> FoundryResult<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO checkpoints ({CHECKPOINT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    checkpoint.id,
                    checkpoint.project_id,
                    checkpoint.agent_id,
                    checkpoint.checkpoint_type,
                    checkpoint.status.as_str(),
                    serde_json::to_string(&checkpoint.output)?,
                    checkpoint.feedback,
                    checkpoint.created_at,
                    checkpoint.resolved_at,
                ],
            )
            .sql()?;
        Ok(())
    }

    /// Checkpoint by id, if any.
    pub fn get_checkpoint(&self, id: Uuid) -> FoundryResult<Option<Checkpoint>> {
        self.conn
            .query_row(
                &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1"),
                params![id],
                checkpoint_from_row,
            )
            .optional()
            .sql()
    }

    /// Checkpoint by id, or `NotFound`.
    pub fn require_checkpoint(&self, id: Uuid) -> FoundryResult<Checkpoint> {
        self.get_checkpoint(id)?
            .ok_or_else(|| FoundryError::not_found("checkpoint", id))
    }

    /// Persist a checkpoint's resolution.
    pub fn update_checkpoint(&self, checkpoint: &Checkpoint) -> FoundryResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE checkpoints SET status = ?2, feedback = ?3, resolved_at = ?4 WHERE id = ?1",
                params![
                    checkpoint.id,
                    checkpoint.status.as_str(),
                    checkpoint.feedback,
                    checkpoint.resolved_at,
                ],
            )
            .sql()?;
        if changed == 0 {
            return Err(FoundryError::not_found("checkpoint", checkpoint.id));
        }
        Ok(())
    }

    /// Delete a checkpoint. Returns `false` if there was none.
    pub fn delete_checkpoint(&self, id: Uuid) -> FoundryResult<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM checkpoints WHERE id = ?1", params![id])
            .sql()?;
        Ok(rows > 0)
    }

    /// Checkpoints of a project, oldest first.
    pub fn list_checkpoints(&self, project_id: Uuid) -> FoundryResult<Vec<Checkpoint>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE project_id = ?1
                 ORDER BY created_at ASC"
            ))
            .sql()?;
        let rows = stmt.query_map(params![project_id], checkpoint_from_row).sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Checkpoints raised by one agent, oldest first.
    pub fn list_checkpoints_for_agent(&self, agent_id: Uuid) -> FoundryResult<Vec<Checkpoint>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE agent_id = ?1
                 ORDER BY created_at ASC"
            ))
            .sql()?;
        let rows = stmt.query_map(params![agent_id], checkpoint_from_row).sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Pending checkpoints of a project, oldest first.
    pub fn list_pending_checkpoints(&self, project_id: Uuid) -> FoundryResult<Vec<Checkpoint>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
                 WHERE project_id = ?1 AND status = ?2
                 ORDER BY created_at ASC"
            ))
            .sql()?;
        let rows = stmt
            .query_map(
                params![project_id, CheckpointStatus::Pending.as_str()],
                checkpoint_from_row,
            )
            .sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Pending checkpoints raised by one agent.
    pub fn count_pending_checkpoints(&self, agent_id: Uuid) -> FoundryResult<u64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE agent_id = ?1 AND status = ?2",
                params![agent_id, CheckpointStatus::Pending.as_str()],
                |row| count_col(row, 0),
            )
            .sql()
    }

    // --- Assets ---

    /// Insert a new asset row.
    pub fn insert_asset(&self, asset: &Asset) -> FoundryResult<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO assets ({ASSET_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    asset.id,
                    asset.project_id,
                    asset.agent_id,
                    asset.category,
                    asset.name,
                    serde_json::to_string(&asset.payload)?,
                    asset.status.as_str(),
                    asset.created_at,
                ],
            )
            .sql()?;
        Ok(())
    }

    /// Asset by id, or `NotFound`.
    pub fn require_asset(&self, id: Uuid) -> FoundryResult<Asset> {
        self.conn
            .query_row(
                &format!("SELECT {ASSET_COLUMNS} FROM assets WHERE id = ?1"),
                params![id],
                asset_from_row,
            )
            .optional()
            .sql()?
            .ok_or_else(|| FoundryError::not_found("asset", id))
    }

    /// Set an asset's review status. `NotFound` if the row is gone.
    pub fn update_asset_status(&self, id: Uuid, status: AssetStatus) -> FoundryResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE assets SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .sql()?;
        if changed == 0 {
            return Err(FoundryError::not_found("asset", id));
        }
        Ok(())
    }

    /// Assets of a project, oldest first.
    pub fn list_assets(&self, project_id: Uuid) -> FoundryResult<Vec<Asset>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ASSET_COLUMNS} FROM assets WHERE project_id = ?1 ORDER BY created_at ASC"
            ))
            .sql()?;
        let rows = stmt.query_map(params![project_id], asset_from_row).sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Pending assets of a project, oldest first.
    pub fn list_pending_assets(&self, project_id: Uuid) -> FoundryResult<Vec<Asset>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ASSET_COLUMNS} FROM assets WHERE project_id = ?1 AND status = ?2
                 ORDER BY created_at ASC"
            ))
            .sql()?;
        let rows = stmt
            .query_map(
                params![project_id, AssetStatus::Pending.as_str()],
                asset_from_row,
            )
            .sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Pending assets produced by one agent.
    pub fn count_pending_assets(&self, agent_id: Uuid) -> FoundryResult<u64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM assets WHERE agent_id = ?1 AND status = ?2",
                params![agent_id, AssetStatus::Pending.as_str()],
                |row| count_col(row, 0),
            )
            .sql()
    }

    // --- Quality settings ---

    /// Stored quality setting for a project and agent type, if any.
    pub fn get_quality_setting(
        &self,
        project_id: Uuid,
        agent_type: AgentType,
    ) -> FoundryResult<Option<QualitySetting>> {
        self.conn
            .query_row(
                "SELECT enabled, max_retries, high_cost FROM quality_settings
                 WHERE project_id = ?1 AND agent_type = ?2",
                params![project_id, agent_type.as_str()],
                |row| {
                    Ok(QualitySetting {
                        project_id,
                        agent_type,
                        enabled: row.get(0)?,
                        max_retries: row.get(1)?,
                        high_cost: row.get(2)?,
                    })
                },
            )
            .optional()
            .sql()
    }

    /// Insert a quality setting, or update `enabled` and `max_retries`.
    /// `high_cost` keeps its first value.
    pub fn upsert_quality_setting(&self, setting: &QualitySetting) -> FoundryResult<()> {
        self.conn
            .execute(
                "INSERT INTO quality_settings (project_id, agent_type, enabled, max_retries, high_cost)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(project_id, agent_type) DO UPDATE SET
                    enabled = excluded.enabled,
                    max_retries = excluded.max_retries",
                params![
                    setting.project_id,
                    setting.agent_type.as_str(),
                    setting.enabled,
                    setting.max_retries,
                    setting.high_cost,
                ],
            )
            .sql()?;
        Ok(())
    }

    // --- Auto-approval rules ---

    /// Enable or disable auto-approval for a checkpoint category.
    pub fn set_auto_approval_rule(
        &self,
        project_id: Uuid,
        category: &str,
        enabled: bool,
    ) -> FoundryResult<()> {
        self.conn
            .execute(
                "INSERT INTO auto_approval_rules (project_id, category, enabled)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_id, category) DO UPDATE SET enabled = excluded.enabled",
                params![project_id, category, enabled],
            )
            .sql()?;
        Ok(())
    }

    /// Auto-approval flags of a project, keyed by category.
    pub fn auto_approval_rules(&self, project_id: Uuid) -> FoundryResult<HashMap<String, bool>> {
        let mut stmt = self
            .conn
            .prepare("SELECT category, enabled FROM auto_approval_rules WHERE project_id = ?1")
            .sql()?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
            })
            .sql()?;
        rows.collect::<rusqlite::Result<HashMap<_, _>>>().sql()
    }

    /// `false` when no rule exists for the category.
    pub fn is_auto_approved(&self, project_id: Uuid, category: &str) -> FoundryResult<bool> {
        let enabled: Option<bool> = self
            .conn
            .query_row(
                "SELECT enabled FROM auto_approval_rules WHERE project_id = ?1 AND category = ?2",
                params![project_id, category],
                |row| row.get(0),
            )
            .optional()
            .sql()?;
        Ok(enabled.unwrap_or(false))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use crate::Store;
    use foundry_core::{
        Agent, AgentType, Asset, AssetStatus, Checkpoint, CheckpointStatus, Project,
        QualitySetting,
    };
    use serde_json::json;

    fn seeded() -> (Store, Project, Agent) {
        let store = Store::open_in_memory().unwrap();
        let project = Project::new("Harbor");
        let agent = Agent::new(project.id, AgentType::Design, 1);
        store
            .transaction(|db| {
                db.insert_project(&project)?;
                db.insert_agent(&agent)
            })
            .unwrap();
        (store, project, agent)
    }

    #[test]
    fn test_pending_checkpoint_count_tracks_resolution() {
        let (store, project, agent) = seeded();
        let mut checkpoint =
            Checkpoint::new(project.id, agent.id, "design", json!({"doc": "v1"}));
        store.transaction(|db| db.insert_checkpoint(&checkpoint)).unwrap();
        assert_eq!(
            store.read(|db| db.count_pending_checkpoints(agent.id)).unwrap(),
            1
        );

        checkpoint.status = CheckpointStatus::Approved;
        checkpoint.resolved_at = Some(chrono::Utc::now());
        store.transaction(|db| db.update_checkpoint(&checkpoint)).unwrap();
        assert_eq!(
            store.read(|db| db.count_pending_checkpoints(agent.id)).unwrap(),
            0
        );
        let loaded = store.read(|db| db.require_checkpoint(checkpoint.id)).unwrap();
        assert_eq!(loaded.output, json!({"doc": "v1"}));
        assert_eq!(loaded.status, CheckpointStatus::Approved);
    }

    #[test]
    fn test_pending_assets() {
        let (store, project, agent) = seeded();
        let asset = Asset::new(project.id, agent.id, "sprite", "hero.png", json!({}));
        store.transaction(|db| db.insert_asset(&asset)).unwrap();
        assert_eq!(store.read(|db| db.count_pending_assets(agent.id)).unwrap(), 1);

        store
            .transaction(|db| db.update_asset_status(asset.id, AssetStatus::Approved))
            .unwrap();
        assert!(store
            .read(|db| db.list_pending_assets(project.id))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_quality_upsert_keeps_high_cost() {
        let (store, project, _) = seeded();
        let mut setting = QualitySetting {
            project_id: project.id,
            agent_type: AgentType::AssetWorker,
            enabled: true,
            max_retries: 3,
            high_cost: true,
        };
        store.transaction(|db| db.upsert_quality_setting(&setting)).unwrap();

        setting.enabled = false;
        setting.high_cost = false;
        store.transaction(|db| db.upsert_quality_setting(&setting)).unwrap();

        let loaded = store
            .read(|db| db.get_quality_setting(project.id, AgentType::AssetWorker))
            .unwrap()
            .unwrap();
        assert!(!loaded.enabled);
        assert!(loaded.high_cost);
    }

    #[test]
    fn test_auto_approval_rules_default_off() {
        let (store, project, _) = seeded();
        assert!(!store
            .read(|db| db.is_auto_approved(project.id, "design"))
            .unwrap());
        store
            .transaction(|db| db.set_auto_approval_rule(project.id, "design", true))
            .unwrap();
        assert!(store
            .read(|db| db.is_auto_approved(project.id, "design"))
            .unwrap());
        let rules = store.read(|db| db.auto_approval_rules(project.id)).unwrap();
        assert_eq!(rules.get("design"), Some(&true));
    }
}
