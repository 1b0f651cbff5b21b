use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How disruptive an intervention is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionPriority {
    /// Delivered without pausing anything.
    Normal,
    /// Forces the owning project to `paused`.
    Urgent,
}

text_enum!(InterventionPriority {
    Normal => "normal",
    Urgent => "urgent",
});

/// Delivery status of an intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionStatus {
    /// Not seen by its target yet.
    Pending,
    /// Handed to the target agent.
    Delivered,
    /// Closed.
    Resolved,
}

text_enum!(InterventionStatus {
    Pending => "pending",
    Delivered => "delivered",
    Resolved => "resolved",
});

/// One message in an intervention's response thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterventionResponse {
    /// `"human"` or the responding agent's id.
    pub author: String,
    /// Reply text.
    pub message: String,
    /// When it was written.
    pub at: DateTime<Utc>,
}

/// An out-of-band human message targeted at one agent or all agents of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    /// Unique intervention ID.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// `None` targets every agent in the project.
    pub target_agent_id: Option<Uuid>,
    /// Human message.
    pub message: String,
    /// Priority.
    pub priority: InterventionPriority,
    /// Delivery status.
    pub status: InterventionStatus,
    /// Reply thread, oldest first.
    pub responses: Vec<InterventionResponse>,
    /// When it was recorded.
    pub created_at: DateTime<Utc>,
}

impl Intervention {
    /// New pending intervention with an empty thread.
    pub fn new(
        project_id: Uuid,
        target_agent_id: Option<Uuid>,
        message: impl Into<String>,
        priority: InterventionPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            target_agent_id,
            message: message.into(),
            priority,
            status: InterventionStatus::Pending,
            responses: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Task label injected into an agent activated by this intervention.
    pub fn task_label(&self) -> String {
        const MAX: usize = 80;
        let mut summary: String = self.message.chars().take(MAX).collect();
        if self.message.chars().count() > MAX {
            summary.push_str("...");
        }
        format!("intervention: {summary}")
    }
}
