//! One operation request through escape, resolve, execute and classify.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use protocol::task::{PendingTask, TaskState, ERROR_KEY};
use protocol::{OperationMode, OperationRequest};
use serde::Serialize;

use crate::callbacks::{callback_url, CallbackRegistry};
use crate::classify::OutcomeClassifier;
use crate::dispatcher::{
    CompletionContext, CompletionDispatcher, CompletionEvent, CompletionListener,
};
use crate::error::{OperationError, QueueError};
use crate::escape::escape;
use crate::gateway::{DispatchTicket, ExecutionGateway};
use crate::queue::TaskQueue;
use crate::runner::{HandlerOutcome, TaskHandler};
use crate::store::RecordStore;
use crate::target::TargetDirectory;
use crate::template::{resolve, ScriptRegistry};
use crate::time::now_ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub raw_output: String,
    pub exit_code: Option<i32>,
    pub classified_success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Finished(ExecutionResult),
    Dispatched(DispatchTicket),
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Base of the URL remote targets post completions to.
    pub callback_base_url: String,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            callback_base_url: "http://127.0.0.1:19310".to_string(),
            default_timeout: Duration::from_secs(120),
            max_timeout: Duration::from_secs(30 * 60),
        }
    }
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    targets: Arc<TargetDirectory>,
    registry: Arc<dyn ScriptRegistry>,
    gateway: Arc<dyn ExecutionGateway>,
    classifier: Arc<dyn OutcomeClassifier>,
    callbacks: CallbackRegistry,
    dispatcher: Arc<CompletionDispatcher>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        targets: Arc<TargetDirectory>,
        registry: Arc<dyn ScriptRegistry>,
        gateway: Arc<dyn ExecutionGateway>,
        classifier: Arc<dyn OutcomeClassifier>,
        callbacks: CallbackRegistry,
        dispatcher: Arc<CompletionDispatcher>,
    ) -> Self {
        Self {
            settings,
            targets,
            registry,
            gateway,
            classifier,
            callbacks,
            dispatcher,
        }
    }

    pub fn targets(&self) -> &TargetDirectory {
        &self.targets
    }

    pub async fn execute(
        &self,
        request: OperationRequest,
    ) -> Result<OperationOutcome, OperationError> {
        let target = self
            .targets
            .get(&request.target_id)
            .ok_or_else(|| OperationError::UnknownTarget(request.target_id.clone()))?;
        let params = escape(&request.params)?;
        let command = resolve(self.registry.as_ref(), &request.script_id, &params)?;
        tracing::info!(
            event = "operation.start",
            target = %target.id,
            script_id = %request.script_id,
            mode = ?request.mode,
            task_id = ?request.task_id,
            command = %command.display_text(),
        );

        match request.mode {
            OperationMode::Sync => {
                let timeout = request
                    .timeout_ms
                    .map(Duration::from_millis)
                    .or(command.timeout())
                    .unwrap_or(self.settings.default_timeout)
                    .min(self.settings.max_timeout);
                let raw = self.gateway.run_sync(target, &command, timeout).await?;
                let success = self.classifier.classify(&request.script_id, &raw.text);
                tracing::info!(
                    event = "operation.finished",
                    target = %target.id,
                    script_id = %request.script_id,
                    exit_code = ?raw.exit_code,
                    truncated = raw.truncated,
                    success,
                );
                self.dispatcher
                    .notify(CompletionEvent {
                        target_id: target.id.clone(),
                        target_class: target.class,
                        script_id: request.script_id.clone(),
                        success,
                        context: CompletionContext {
                            task_id: request.task_id.clone(),
                            exit_code: raw.exit_code,
                            output: raw.text.clone(),
                            ticket: None,
                            finished_at_ms: now_ms(),
                        },
                    })
                    .await;
                Ok(OperationOutcome::Finished(ExecutionResult {
                    raw_output: raw.text,
                    exit_code: raw.exit_code,
                    classified_success: success,
                }))
            }
            OperationMode::Async => {
                let registration = self.callbacks.register(
                    &target.id,
                    &request.script_id,
                    request.task_id.as_deref(),
                )?;
                let url = callback_url(&self.settings.callback_base_url, &registration);
                match self.gateway.dispatch_async(target, &command, &url).await {
                    Ok(ticket) => Ok(OperationOutcome::Dispatched(ticket)),
                    Err(err) => {
                        if let Err(discard_err) = self.callbacks.discard(&registration) {
                            tracing::warn!(
                                event = "callback.discard_failed",
                                target = %target.id,
                                error = %discard_err,
                            );
                        }
                        Err(err.into())
                    }
                }
            }
        }
    }
}

/// Queue handler that runs one script with the task payload as parameters.
/// The task is settled by [`QueueCompletionListener`] once the operation
/// completes; failures before that surface as handler errors.
pub struct ScriptTaskHandler {
    orchestrator: Arc<Orchestrator>,
    script_id: String,
    mode: OperationMode,
}

impl ScriptTaskHandler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        script_id: impl Into<String>,
        mode: OperationMode,
    ) -> Self {
        Self {
            orchestrator,
            script_id: script_id.into(),
            mode,
        }
    }
}

#[async_trait]
impl TaskHandler for ScriptTaskHandler {
    async fn handle(&self, task: &PendingTask) -> anyhow::Result<HandlerOutcome> {
        let mut params = task.payload.clone();
        params.remove(ERROR_KEY);
        let request = OperationRequest::new(&task.target_key, &self.script_id, params, self.mode)
            .for_task(&task.id);
        self.orchestrator
            .execute(request)
            .await
            .with_context(|| format!("{} on {}", self.script_id, task.target_key))?;
        Ok(HandlerOutcome::AwaitingCompletion)
    }
}

/// Settles the task a completion was produced for.
pub struct QueueCompletionListener {
    queue: Arc<TaskQueue>,
}

impl QueueCompletionListener {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl CompletionListener for QueueCompletionListener {
    fn name(&self) -> &str {
        "queue"
    }

    async fn on_complete(&self, event: &CompletionEvent) -> anyhow::Result<()> {
        let Some(task_id) = event.context.task_id.as_deref() else {
            return Ok(());
        };
        let task = match self.queue.get(task_id) {
            Ok(task) => task,
            Err(QueueError::NotFound(_)) => {
                tracing::warn!(
                    event = "queue.completion_for_unknown_task",
                    task_id = %task_id,
                    target = %event.target_id,
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if task.target_key != event.target_id {
            tracing::warn!(
                event = "queue.completion_target_mismatch",
                task_id = %task_id,
                task_target = %task.target_key,
                target = %event.target_id,
                script_id = %event.script_id,
            );
            return Ok(());
        }
        if task.state == TaskState::Ready {
            tracing::warn!(
                event = "queue.completion_for_unclaimed_task",
                task_id = %task_id,
                target = %event.target_id,
            );
            return Ok(());
        }
        let result = if event.success {
            self.queue.mark_complete(task_id)
        } else {
            self.queue.mark_failed(task_id, &failure_reason(event))
        };
        match result {
            Ok(_) => Ok(()),
            Err(QueueError::Terminal { state, .. }) => {
                tracing::info!(
                    event = "queue.duplicate_completion",
                    task_id = %task_id,
                    state = %state,
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn failure_reason(event: &CompletionEvent) -> String {
    match event.context.exit_code {
        Some(code) => format!("{} reported failure (exit {code})", event.script_id),
        None => format!("{} reported failure", event.script_id),
    }
}

#[derive(Debug, Serialize)]
struct OperationStamp<'a> {
    success: bool,
    exit_code: Option<i32>,
    task_id: Option<&'a str>,
    finished_at_ms: u64,
}

pub fn target_entity(target_id: &str) -> String {
    format!("target:{target_id}")
}

/// Records the latest outcome of each script on the target's own record.
pub struct RecordStampListener {
    store: Arc<dyn RecordStore>,
}

impl RecordStampListener {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CompletionListener for RecordStampListener {
    fn name(&self) -> &str {
        "record-stamp"
    }

    async fn on_complete(&self, event: &CompletionEvent) -> anyhow::Result<()> {
        let stamp = serde_json::to_string(&OperationStamp {
            success: event.success,
            exit_code: event.context.exit_code,
            task_id: event.context.task_id.as_deref(),
            finished_at_ms: event.context.finished_at_ms,
        })?;
        self.store
            .set(
                &target_entity(&event.target_id),
                &format!("last_operation.{}", event.script_id),
                &stamp,
            )
            .context("stamp target record")?;
        Ok(())
    }
}

/// Task settlement runs first so later listeners observe the final state.
pub fn wire_default_listeners(
    dispatcher: &CompletionDispatcher,
    queue: Arc<TaskQueue>,
    store: Arc<dyn RecordStore>,
) {
    dispatcher.on_operation_complete(None, None, Arc::new(QueueCompletionListener::new(queue)));
    dispatcher.on_operation_complete(None, None, Arc::new(RecordStampListener::new(store)));
}
