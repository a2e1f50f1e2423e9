//! Remote command orchestration: escaping, script resolution, execution over
//! ssh, outcome classification, completion callbacks and a durable task queue.

mod audit;
pub mod callbacks;
pub mod classify;
pub mod dispatcher;
pub mod error;
pub mod escape;
pub mod gateway;
pub mod operations;
pub mod queue;
pub mod runner;
pub mod store;
pub mod target;
pub mod template;
#[cfg(test)]
mod test_utils;
mod time;

pub use audit::AuditLog;
pub use callbacks::{CallbackReceiver, CallbackRegistry, ReceiveOutcome};
pub use classify::{MarkerClassifier, OutcomeClassifier};
pub use dispatcher::{
    completion_channel, spawn_dispatch_worker, CompletionContext, CompletionDispatcher,
    CompletionEvent, CompletionListener,
};
pub use error::{
    EscapeError, GatewayError, OperationError, QueueError, ResolveError, StoreError,
};
pub use gateway::{DispatchTicket, ExecutionGateway, RawOutput, SshGateway};
pub use operations::{
    wire_default_listeners, ExecutionResult, OperationOutcome, Orchestrator,
    OrchestratorSettings, QueueCompletionListener, RecordStampListener, ScriptTaskHandler,
};
pub use queue::{Compatibility, TaskQueue};
pub use runner::{HandlerOutcome, QueueRunner, RunnerConfig, RunnerLease, TaskHandler};
pub use store::{FileStore, MemoryStore, RecordStore};
pub use target::{TargetDirectory, TargetSpec};
pub use template::{resolve, ResolvedCommand, ScriptRegistry, StaticScriptRegistry};
