use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod config;
pub mod control;
pub mod task;

pub type Params = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRequest {
    pub target_id: String,
    pub script_id: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub mode: OperationMode,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl OperationRequest {
    pub fn new(
        target_id: impl Into<String>,
        script_id: impl Into<String>,
        params: Params,
        mode: OperationMode,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            script_id: script_id.into(),
            params,
            mode,
            task_id: None,
            timeout_ms: None,
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Succeeded,
    Failed,
    Dispatched,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationResponse {
    pub target_id: String,
    pub script_id: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub ticket: Option<String>,
}

impl OperationResponse {
    pub fn finished(
        target_id: impl Into<String>,
        script_id: impl Into<String>,
        success: bool,
        exit_code: Option<i32>,
        output: String,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            script_id: script_id.into(),
            status: if success {
                OperationStatus::Succeeded
            } else {
                OperationStatus::Failed
            },
            exit_code,
            output: Some(output),
            ticket: None,
        }
    }

    pub fn dispatched(
        target_id: impl Into<String>,
        script_id: impl Into<String>,
        ticket: impl Into<String>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            script_id: script_id.into(),
            status: OperationStatus::Dispatched,
            exit_code: None,
            output: None,
            ticket: Some(ticket.into()),
        }
    }
}
