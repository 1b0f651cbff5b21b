use crate::{json_col, text_col, Db, SqlContext};
use foundry_core::{FoundryError, FoundryResult, Intervention, WorkflowSnapshot};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

const INTERVENTION_COLUMNS: &str =
    "id, project_id, target_agent_id, message, priority, status, responses, created_at";

const SNAPSHOT_COLUMNS: &str = "id, agent_id, workflow_run_id, step, progress, current_task, \
     state, worker_tasks, created_at";

fn intervention_from_row(row: &Row<'_>) -> rusqlite::Result<Intervention> {
    Ok(Intervention {
        id: row.get(0)?,
        project_id: row.get(1)?,
        target_agent_id: row.get(2)?,
        message: row.get(3)?,
        priority: text_col(row, 4)?,
        status: text_col(row, 5)?,
        responses: json_col(row, 6)?,
        created_at: row.get(7)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowSnapshot> {
    Ok(WorkflowSnapshot {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        workflow_run_id: row.get(2)?,
        step: row.get(3)?,
        progress: row.get(4)?,
        current_task: row.get(5)?,
        state: json_col(row, 6)?,
        worker_tasks: json_col(row, 7)?,
        created_at: row.get(8)?,
    })
}

impl Db<'_> {
    // --- Interventions ---

    /// Insert a new intervention row.
    pub fn insert_intervention(&self, intervention: &Intervention) -> FoundryResult<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO interventions ({INTERVENTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    intervention.id,
                    intervention.project_id,
                    intervention.target_agent_id,
                    intervention.message,
                    intervention.priority.as_str(),
                    intervention.status.as_str(),
                    serde_json::to_string(&intervention.responses)?,
                    intervention.created_at,
                ],
            )
            .sql()?;
        Ok(())
    }

    /// Intervention by id, or `NotFound`.
    pub fn require_intervention(&self, id: Uuid) -> FoundryResult<Intervention> {
        self.conn
            .query_row(
                &format!("SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE id = ?1"),
                params![id],
                intervention_from_row,
            )
            .optional()
            .sql()?
            .ok_or_else(|| FoundryError::not_found("intervention", id))
    }

    /// Persist status and reply thread. `NotFound` if the row is gone.
    pub fn update_intervention(&self, intervention: &Intervention) -> FoundryResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE interventions SET status = ?2, responses = ?3 WHERE id = ?1",
                params![
                    intervention.id,
                    intervention.status.as_str(),
                    serde_json::to_string(&intervention.responses)?,
                ],
            )
            .sql()?;
        if changed == 0 {
            return Err(FoundryError::not_found("intervention", intervention.id));
        }
        Ok(())
    }

    /// Interventions of a project, oldest first.
    pub fn list_interventions(&self, project_id: Uuid) -> FoundryResult<Vec<Intervention>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE project_id = ?1
                 ORDER BY created_at ASC"
            ))
            .sql()?;
        let rows = stmt
            .query_map(params![project_id], intervention_from_row)
            .sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    // --- Workflow snapshots ---

    /// Append a snapshot. Snapshots are never updated.
    pub fn insert_snapshot(
        &self,
        project_id: Uuid,
        snapshot: &WorkflowSnapshot,
    ) -> FoundryResult<()> {
        self.conn
            .execute(
                "INSERT INTO workflow_snapshots (id, project_id, agent_id, workflow_run_id, step,
                    progress, current_task, state, worker_tasks, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    snapshot.id,
                    project_id,
                    snapshot.agent_id,
                    snapshot.workflow_run_id,
                    snapshot.step,
                    snapshot.progress,
                    snapshot.current_task,
                    serde_json::to_string(&snapshot.state)?,
                    serde_json::to_string(&snapshot.worker_tasks)?,
                    snapshot.created_at,
                ],
            )
            .sql()?;
        Ok(())
    }

    /// Snapshot by id, or `NotFound`.
    pub fn require_snapshot(&self, id: Uuid) -> FoundryResult<WorkflowSnapshot> {
        self.conn
            .query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM workflow_snapshots WHERE id = ?1"),
                params![id],
                snapshot_from_row,
            )
            .optional()
            .sql()?
            .ok_or_else(|| FoundryError::not_found("snapshot", id))
    }

    /// Snapshots of an agent in capture order, optionally narrowed to one run.
    pub fn list_snapshots(
        &self,
        agent_id: Uuid,
        workflow_run_id: Option<Uuid>,
    ) -> FoundryResult<Vec<WorkflowSnapshot>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM workflow_snapshots
                 WHERE agent_id = ?1 AND (?2 IS NULL OR workflow_run_id = ?2)
                 ORDER BY rowid ASC"
            ))
            .sql()?;
        let rows = stmt
            .query_map(params![agent_id, workflow_run_id], snapshot_from_row)
            .sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Most recently inserted snapshot of an agent.
    pub fn latest_snapshot(&self, agent_id: Uuid) -> FoundryResult<Option<WorkflowSnapshot>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM workflow_snapshots WHERE agent_id = ?1
                     ORDER BY rowid DESC LIMIT 1"
                ),
                params![agent_id],
                snapshot_from_row,
            )
            .optional()
            .sql()
    }

    /// Drop every snapshot of the same run captured after `snapshot_id`.
    pub fn delete_snapshots_after(&self, snapshot_id: Uuid) -> FoundryResult<usize> {
        self.conn
            .execute(
                "DELETE FROM workflow_snapshots
                 WHERE rowid > (SELECT rowid FROM workflow_snapshots WHERE id = ?1)
                   AND agent_id = (SELECT agent_id FROM workflow_snapshots WHERE id = ?1)
                   AND workflow_run_id = (SELECT workflow_run_id FROM workflow_snapshots WHERE id = ?1)",
                params![snapshot_id],
            )
            .sql()
    }
}
