use protocol::task::TaskState;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EscapeError {
    #[error("parameter {key} is not valid UTF-8")]
    InvalidUtf8 { key: String },
    #[error("parameter {key} contains a NUL byte")]
    NulByte { key: String },
    #[error("invalid parameter name: {key:?}")]
    InvalidKey { key: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown script: {script_id}")]
    UnknownScript { script_id: String },
    #[error("script {script_id} requires parameter {key}")]
    MissingParameter { script_id: String, key: String },
    #[error("script {script_id} has no placeholder for parameter {key}")]
    UnknownParameter { script_id: String, key: String },
    #[error("script {script_id} template is malformed: {message}")]
    TemplateSyntax { script_id: String, message: String },
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The target could not be reached at all.
    #[error("transport error on {target}: {message}")]
    Transport { target: String, message: String },
    /// The remote side refused the detached command before accepting it.
    #[error("dispatch rejected by {target}: {message}")]
    Dispatch { target: String, message: String },
    /// The wait expired; the remote command may still be running.
    #[error("operation on {target} timed out after {timeout_secs}s")]
    Timeout { target: String, timeout_secs: u64 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task {id} is {state} and can no longer change")]
    Terminal { id: String, state: TaskState },
    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskState,
        to: TaskState,
    },
    #[error("task {id} is {state}; only finished tasks can be removed")]
    NotTerminal { id: String, state: TaskState },
    #[error("task {id} was modified concurrently")]
    Conflict { id: String },
    #[error("invalid task: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Store(StoreError::Encoding(err))
    }
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),
    #[error(transparent)]
    Escape(#[from] EscapeError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OperationError {
    /// Caller mistakes that never reached the network.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            OperationError::UnknownTarget(_) | OperationError::Escape(_) | OperationError::Resolve(_)
        )
    }
}
