use serde::{Deserialize, Serialize};

/// One unit of work handed to a card worker. Not persisted on its own; it
/// lives only as the payload of a queued task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub session_id: String,
    pub driver_id: i64,
    pub template_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    RenderCard(WorkItem),
    Finalize { session_id: String },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::RenderCard(_) => TaskKind::RenderCard,
            TaskPayload::Finalize { .. } => TaskKind::Finalize,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            TaskPayload::RenderCard(item) => &item.session_id,
            TaskPayload::Finalize { session_id } => session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    RenderCard,
    Finalize,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::RenderCard => "render_card",
            TaskKind::Finalize => "finalize",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "render_card" => Some(TaskKind::RenderCard),
            "finalize" => Some(TaskKind::Finalize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// A task claimed from the queue.
///
/// `attempt` identifies this particular claim: completing or failing a
/// task whose attempt has since been re-queued and re-claimed is a no-op.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub queue: String,
    pub payload: TaskPayload,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    pub fn session_id(&self) -> &str {
        self.payload.session_id()
    }
}

/// Per-status task counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

impl TaskCounts {
    pub fn in_flight(&self) -> u64 {
        self.pending + self.running
    }
}
