use crate::{text_col, Db, SqlContext};
use foundry_core::{Agent, AgentStatus, AgentType, FoundryError, FoundryResult, Project};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

const PROJECT_COLUMNS: &str = "id, name, status, current_phase, created_at, updated_at";

const AGENT_COLUMNS: &str = "id, project_id, agent_type, phase, status, progress, current_task, \
     input_tokens, output_tokens, parent_agent_id, retry_count, last_error, created_at, \
     started_at, completed_at";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        status: text_col(row, 2)?,
        current_phase: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let input_tokens: i64 = row.get(7)?;
    let output_tokens: i64 = row.get(8)?;
    Ok(Agent {
        id: row.get(0)?,
        project_id: row.get(1)?,
        agent_type: text_col(row, 2)?,
        phase: row.get(3)?,
        status: text_col(row, 4)?,
        progress: row.get(5)?,
        current_task: row.get(6)?,
        input_tokens: input_tokens as u64,
        output_tokens: output_tokens as u64,
        parent_agent_id: row.get(9)?,
        retry_count: row.get(10)?,
        last_error: row.get(11)?,
        created_at: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

impl Db<'_> {
    // --- Projects ---

    /// Insert a new project row.
    pub fn insert_project(&self, project: &Project) -> FoundryResult<()> {
        self.conn
            .execute(
                "INSERT INTO projects (id, name, status, current_phase, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project.id,
                    project.name,
                    project.status.as_str(),
                    project.current_phase,
                    project.created_at,
                    project.updated_at,
                ],
            )
            .sql()?;
        Ok(())
    }

    /// Project by id, if any.
    pub fn get_project(&self, id: Uuid) -> FoundryResult<Option<Project>> {
        self.conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
                project_from_row,
            )
            .optional()
            .sql()
    }

    /// Project by id, or `NotFound`.
    pub fn require_project(&self, id: Uuid) -> FoundryResult<Project> {
        self.get_project(id)?
            .ok_or_else(|| FoundryError::not_found("project", id))
    }

    /// All projects, oldest first.
    pub fn list_projects(&self) -> FoundryResult<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at ASC"
            ))
            .sql()?;
        let rows = stmt.query_map([], project_from_row).sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Overwrite the mutable project columns. `NotFound` if the row is gone.
    pub fn update_project(&self, project: &Project) -> FoundryResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE projects SET name = ?2, status = ?3, current_phase = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    project.id,
                    project.name,
                    project.status.as_str(),
                    project.current_phase,
                    project.updated_at,
                ],
            )
            .sql()?;
        if changed == 0 {
            return Err(FoundryError::not_found("project", project.id));
        }
        Ok(())
    }

    /// Delete a project and, by cascade, everything it owns.
    pub fn delete_project(&self, id: Uuid) -> FoundryResult<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .sql()?;
        Ok(rows > 0)
    }

    // --- Agents ---

    /// Insert a new agent row.
    pub fn insert_agent(&self, agent: &Agent) -> FoundryResult<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO agents ({AGENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    agent.id,
                    agent.project_id,
                    agent.agent_type.as_str(),
                    agent.phase,
                    agent.status.as_str(),
                    agent.progress,
                    agent.current_task,
                    agent.input_tokens as i64,
                    agent.output_tokens as i64,
                    agent.parent_agent_id,
                    agent.retry_count,
                    agent.last_error,
                    agent.created_at,
                    agent.started_at,
                    agent.completed_at,
                ],
            )
            .sql()?;
        Ok(())
    }

    /// Agent by id, if any.
    pub fn get_agent(&self, id: Uuid) -> FoundryResult<Option<Agent>> {
        self.conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                params![id],
                agent_from_row,
            )
            .optional()
            .sql()
    }

    /// Agent by id, or `NotFound`.
    pub fn require_agent(&self, id: Uuid) -> FoundryResult<Agent> {
        self.get_agent(id)?
            .ok_or_else(|| FoundryError::not_found("agent", id))
    }

    /// Write every mutable column of `agent` back.
    pub fn update_agent(&self, agent: &Agent) -> FoundryResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE agents SET phase = ?2, status = ?3, progress = ?4, current_task = ?5,
                    input_tokens = ?6, output_tokens = ?7, retry_count = ?8, last_error = ?9,
                    started_at = ?10, completed_at = ?11
                 WHERE id = ?1",
                params![
                    agent.id,
                    agent.phase,
                    agent.status.as_str(),
                    agent.progress,
                    agent.current_task,
                    agent.input_tokens as i64,
                    agent.output_tokens as i64,
                    agent.retry_count,
                    agent.last_error,
                    agent.started_at,
                    agent.completed_at,
                ],
            )
            .sql()?;
        if changed == 0 {
            return Err(FoundryError::not_found("agent", agent.id));
        }
        Ok(())
    }

    /// Add to an agent's token counters without a read-modify-write race.
    pub fn add_agent_tokens(&self, id: Uuid, input: u64, output: u64) -> FoundryResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE agents SET input_tokens = input_tokens + ?2,
                    output_tokens = output_tokens + ?3
                 WHERE id = ?1",
                params![id, input as i64, output as i64],
            )
            .sql()?;
        if changed == 0 {
            return Err(FoundryError::not_found("agent", id));
        }
        Ok(())
    }

    /// Agents of a project, by phase then creation time.
    pub fn list_agents(&self, project_id: Uuid) -> FoundryResult<Vec<Agent>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {AGENT_COLUMNS} FROM agents WHERE project_id = ?1
                 ORDER BY phase ASC, created_at ASC"
            ))
            .sql()?;
        let rows = stmt.query_map(params![project_id], agent_from_row).sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Agents of one type in a project, oldest first.
    pub fn find_agents_by_type(
        &self,
        project_id: Uuid,
        agent_type: AgentType,
    ) -> FoundryResult<Vec<Agent>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {AGENT_COLUMNS} FROM agents WHERE project_id = ?1 AND agent_type = ?2
                 ORDER BY created_at ASC"
            ))
            .sql()?;
        let rows = stmt
            .query_map(params![project_id, agent_type.as_str()], agent_from_row)
            .sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Agents in any of `statuses`, across all projects.
    pub fn list_agents_with_status(&self, statuses: &[AgentStatus]) -> FoundryResult<Vec<Agent>> {
        let mut out = Vec::new();
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {AGENT_COLUMNS} FROM agents WHERE status = ?1 ORDER BY created_at ASC"
            ))
            .sql()?;
        for status in statuses {
            let rows = stmt.query_map(params![status.as_str()], agent_from_row).sql()?;
            for row in rows {
                out.push(row.sql()?);
            }
        }
        Ok(out)
    }

    /// Workers spawned by `parent_id`, oldest first.
    pub fn children_of(&self, parent_id: Uuid) -> FoundryResult<Vec<Agent>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {AGENT_COLUMNS} FROM agents WHERE parent_agent_id = ?1
                 ORDER BY created_at ASC"
            ))
            .sql()?;
        let rows = stmt.query_map(params![parent_id], agent_from_row).sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }
}
