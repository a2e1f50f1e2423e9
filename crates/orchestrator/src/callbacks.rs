//! Completion callbacks for asynchronously dispatched operations.
//!
//! A registration is written before dispatch and claimed exactly once, by a
//! conditional delete, when the remote side posts its output back.

use std::sync::Arc;

use protocol::config::TargetClass;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::classify::OutcomeClassifier;
use crate::dispatcher::{CompletionContext, CompletionEvent};
use crate::error::StoreError;
use crate::gateway::COMPLETION_MARKER;
use crate::store::RecordStore;
use crate::target::TargetDirectory;
use crate::time::now_ms;

pub const CALLBACK_ENTITY: &str = "callbacks";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackRegistration {
    pub target_id: String,
    pub script_id: String,
    pub nonce: String,
    pub token: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub created_at_ms: u64,
}

/// Ad-hoc operations share one slot per pair; a queued task gets its own.
fn registration_key(target_id: &str, script_id: &str, task_id: Option<&str>) -> String {
    match task_id {
        Some(task_id) => format!("{target_id}/{script_id}/{task_id}"),
        None => format!("{target_id}/{script_id}"),
    }
}

#[derive(Clone)]
pub struct CallbackRegistry {
    store: Arc<dyn RecordStore>,
}

impl CallbackRegistry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Stores a fresh registration; a newer dispatch for the same pair and
    /// task replaces any registration still waiting.
    pub fn register(
        &self,
        target_id: &str,
        script_id: &str,
        task_id: Option<&str>,
    ) -> Result<CallbackRegistration, StoreError> {
        let registration = CallbackRegistration {
            target_id: target_id.to_string(),
            script_id: script_id.to_string(),
            nonce: uuid::Uuid::new_v4().to_string(),
            token: uuid::Uuid::new_v4().simple().to_string(),
            task_id: task_id.map(str::to_string),
            created_at_ms: now_ms(),
        };
        let key = registration_key(target_id, script_id, task_id);
        let encoded = serde_json::to_string(&registration)?;
        loop {
            let current = self.store.get(CALLBACK_ENTITY, &key)?;
            if self.store.compare_and_swap(
                CALLBACK_ENTITY,
                &key,
                current.as_deref(),
                Some(&encoded),
            )? {
                if let Some(previous) = current
                    .as_deref()
                    .and_then(|raw| serde_json::from_str::<CallbackRegistration>(raw).ok())
                {
                    tracing::warn!(
                        event = "callback.superseded",
                        target = %target_id,
                        script_id = %script_id,
                        previous_nonce = %previous.nonce,
                        previous_task_id = ?previous.task_id,
                        nonce = %registration.nonce,
                    );
                }
                tracing::info!(
                    event = "callback.registered",
                    target = %target_id,
                    script_id = %script_id,
                    nonce = %registration.nonce,
                    task_id = ?registration.task_id,
                );
                return Ok(registration);
            }
        }
    }

    pub fn lookup(
        &self,
        target_id: &str,
        script_id: &str,
        task_id: Option<&str>,
    ) -> Result<Option<CallbackRegistration>, StoreError> {
        let key = registration_key(target_id, script_id, task_id);
        match self.store.get(CALLBACK_ENTITY, &key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Removes and returns the registration if `token` matches it. Only one
    /// of any number of concurrent claims can succeed.
    pub fn claim(
        &self,
        target_id: &str,
        script_id: &str,
        task_id: Option<&str>,
        token: &str,
    ) -> Result<Option<CallbackRegistration>, StoreError> {
        let key = registration_key(target_id, script_id, task_id);
        let Some(raw) = self.store.get(CALLBACK_ENTITY, &key)? else {
            return Ok(None);
        };
        let registration: CallbackRegistration = serde_json::from_str(&raw)?;
        if registration.token != token {
            return Ok(None);
        }
        if self
            .store
            .compare_and_swap(CALLBACK_ENTITY, &key, Some(&raw), None)?
        {
            Ok(Some(registration))
        } else {
            Ok(None)
        }
    }

    /// Puts a claimed registration back when its completion could not be
    /// handed on. Fails (returns false) if a newer dispatch took the slot.
    pub fn restore(&self, registration: &CallbackRegistration) -> Result<bool, StoreError> {
        let key = registration_key(
            &registration.target_id,
            &registration.script_id,
            registration.task_id.as_deref(),
        );
        let encoded = serde_json::to_string(registration)?;
        self.store
            .compare_and_swap(CALLBACK_ENTITY, &key, None, Some(&encoded))
    }

    /// Drops a registration whose dispatch never went out.
    pub fn discard(&self, registration: &CallbackRegistration) -> Result<bool, StoreError> {
        let key = registration_key(
            &registration.target_id,
            &registration.script_id,
            registration.task_id.as_deref(),
        );
        let encoded = serde_json::to_string(registration)?;
        self.store
            .compare_and_swap(CALLBACK_ENTITY, &key, Some(&encoded), None)
    }
}

pub fn callback_url(base_url: &str, registration: &CallbackRegistration) -> String {
    let mut url = format!(
        "{}/callback/{}/{}?token={}",
        base_url.trim_end_matches('/'),
        registration.target_id,
        registration.script_id,
        registration.token
    );
    if let Some(task_id) = &registration.task_id {
        url.push_str("&task=");
        url.push_str(task_id);
    }
    url
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Accepted { success: bool },
    Discarded,
    /// The completion could not be queued; the registration is back in
    /// place and the sender should retry.
    Deferred,
}

pub struct CallbackReceiver {
    registry: CallbackRegistry,
    classifier: Arc<dyn OutcomeClassifier>,
    targets: Arc<TargetDirectory>,
    events: mpsc::Sender<CompletionEvent>,
}

impl CallbackReceiver {
    pub fn new(
        registry: CallbackRegistry,
        classifier: Arc<dyn OutcomeClassifier>,
        targets: Arc<TargetDirectory>,
        events: mpsc::Sender<CompletionEvent>,
    ) -> Self {
        Self {
            registry,
            classifier,
            targets,
            events,
        }
    }

    /// Claims, classifies and queues a completion. Listeners run later on
    /// the dispatch worker.
    pub async fn receive(
        &self,
        target_id: &str,
        script_id: &str,
        task_id: Option<&str>,
        token: &str,
        payload: &[u8],
    ) -> Result<ReceiveOutcome, StoreError> {
        let Some(registration) = self.registry.claim(target_id, script_id, task_id, token)? else {
            tracing::warn!(
                event = "callback.discarded",
                target = %target_id,
                script_id = %script_id,
                task_id = ?task_id,
                bytes = payload.len(),
                "no matching registration"
            );
            return Ok(ReceiveOutcome::Discarded);
        };

        let text = String::from_utf8_lossy(payload);
        let (output, exit_code) = split_completion(&text);
        let success = self.classifier.classify(script_id, &output);
        let target_class = self
            .targets
            .get(target_id)
            .map(|target| target.class)
            .unwrap_or(TargetClass::Server);
        tracing::info!(
            event = "callback.accepted",
            target = %target_id,
            script_id = %script_id,
            nonce = %registration.nonce,
            task_id = ?registration.task_id,
            exit_code = ?exit_code,
            success,
        );
        let event = CompletionEvent {
            target_id: target_id.to_string(),
            target_class,
            script_id: script_id.to_string(),
            success,
            context: CompletionContext {
                task_id: registration.task_id.clone(),
                exit_code,
                output,
                ticket: Some(registration.nonce.clone()),
                finished_at_ms: now_ms(),
            },
        };
        let reason = match self.events.try_send(event) {
            Ok(()) => return Ok(ReceiveOutcome::Accepted { success }),
            Err(TrySendError::Full(_)) => "completion queue full",
            Err(TrySendError::Closed(_)) => "completion worker stopped",
        };
        if self.registry.restore(&registration)? {
            tracing::warn!(
                event = "callback.deferred",
                target = %target_id,
                script_id = %script_id,
                nonce = %registration.nonce,
                reason,
            );
        } else {
            tracing::error!(
                event = "callback.lost",
                target = %target_id,
                script_id = %script_id,
                nonce = %registration.nonce,
                task_id = ?registration.task_id,
                reason,
                "registration was superseded while the completion was pending"
            );
        }
        Ok(ReceiveOutcome::Deferred)
    }
}

/// Strips the trailing completion marker line and returns its exit status.
fn split_completion(text: &str) -> (String, Option<i32>) {
    let Some(index) = text.rfind(COMPLETION_MARKER) else {
        return (text.to_string(), None);
    };
    let exit_code = text[index + COMPLETION_MARKER.len()..]
        .lines()
        .next()
        .and_then(|line| line.trim().strip_prefix("exit="))
        .and_then(|code| code.trim().parse().ok());
    let output = text[..index].trim_end_matches('\n').to_string();
    (output, exit_code)
}
