use crate::config::TargetClass;
use crate::task::{PendingTask, TaskState};
use crate::Params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub target_key: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: Params,
    pub action_hook: String,
}

/// One task per target; each becomes an independent `ready` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkEnqueueRequest {
    pub target_keys: Vec<String>,
    pub task_type: String,
    #[serde(default)]
    pub payload: Params,
    pub action_hook: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub target_key: Option<String>,
    #[serde(default)]
    pub state: Option<TaskState>,
    #[serde(default)]
    pub task_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskActionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskList {
    pub tasks: Vec<PendingTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionView {
    pub target_id: String,
    pub target_class: TargetClass,
    pub script_id: String,
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub task_id: Option<String>,
    pub finished_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleEvent {
    OperationCompleted { completion: CompletionView },
    TaskUpdated { task: PendingTask },
}
