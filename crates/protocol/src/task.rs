use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Params;

/// Payload key holding the failure reason of a failed task.
pub const ERROR_KEY: &str = "error";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Ready,
    InProcess,
    Complete,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Ready => "ready",
            TaskState::InProcess => "in-process",
            TaskState::Complete => "complete",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "ready" => Ok(TaskState::Ready),
            "in-process" | "in_process" => Ok(TaskState::InProcess),
            "complete" => Ok(TaskState::Complete),
            "failed" => Ok(TaskState::Failed),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingTask {
    pub id: String,
    pub target_key: String,
    pub task_type: String,
    pub state: TaskState,
    #[serde(default)]
    pub payload: Params,
    pub action_hook: String,
    pub sequence: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub retry_of: Option<String>,
}

impl PendingTask {
    pub fn error(&self) -> Option<&str> {
        self.payload.get(ERROR_KEY).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_kebab_case() {
        let json = serde_json::to_string(&TaskState::InProcess).expect("serialize");
        assert_eq!(json, "\"in-process\"");
        assert_eq!("in-process".parse::<TaskState>(), Ok(TaskState::InProcess));
        assert!("running".parse::<TaskState>().is_err());
    }

    #[test]
    fn only_complete_and_failed_are_terminal() {
        assert!(!TaskState::Ready.is_terminal());
        assert!(!TaskState::InProcess.is_terminal());
        assert!(TaskState::Complete.is_terminal());
        assert!(TaskState::Failed.is_terminal());
    }
}
