//! Typed fan-out of operation completions.
//!
//! Listeners subscribe for a target class and script id (either may be a
//! wildcard) and run in registration order. Each listener runs on its own
//! task, so an error or a panic in one is logged and the next still runs.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use protocol::config::TargetClass;
use protocol::control::CompletionView;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionContext {
    pub task_id: Option<String>,
    pub exit_code: Option<i32>,
    pub output: String,
    pub ticket: Option<String>,
    pub finished_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub target_id: String,
    pub target_class: TargetClass,
    pub script_id: String,
    pub success: bool,
    pub context: CompletionContext,
}

impl CompletionEvent {
    pub fn view(&self) -> CompletionView {
        CompletionView {
            target_id: self.target_id.clone(),
            target_class: self.target_class,
            script_id: self.script_id.clone(),
            success: self.success,
            exit_code: self.context.exit_code,
            task_id: self.context.task_id.clone(),
            finished_at_ms: self.context.finished_at_ms,
        }
    }
}

#[async_trait]
pub trait CompletionListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_complete(&self, event: &CompletionEvent) -> anyhow::Result<()>;
}

struct Subscription {
    class: Option<TargetClass>,
    script_id: Option<String>,
    listener: Arc<dyn CompletionListener>,
}

impl Subscription {
    fn matches(&self, event: &CompletionEvent) -> bool {
        self.class.map_or(true, |class| class == event.target_class)
            && self
                .script_id
                .as_deref()
                .map_or(true, |script_id| script_id == event.script_id)
    }
}

#[derive(Default)]
pub struct CompletionDispatcher {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl CompletionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` for either filter subscribes to every class or script.
    pub fn on_operation_complete(
        &self,
        class: Option<TargetClass>,
        script_id: Option<&str>,
        listener: Arc<dyn CompletionListener>,
    ) {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscriptions.push(Subscription {
            class,
            script_id: script_id.map(str::to_string),
            listener,
        });
    }

    /// Runs every matching listener in order; returns how many succeeded.
    pub async fn notify(&self, event: CompletionEvent) -> usize {
        let listeners: Vec<Arc<dyn CompletionListener>> = {
            let subscriptions = self
                .subscriptions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscriptions
                .iter()
                .filter(|subscription| subscription.matches(&event))
                .map(|subscription| Arc::clone(&subscription.listener))
                .collect()
        };
        tracing::info!(
            event = "completion.notify",
            target = %event.target_id,
            script_id = %event.script_id,
            success = event.success,
            task_id = ?event.context.task_id,
            listeners = listeners.len(),
        );

        let event = Arc::new(event);
        let mut succeeded = 0;
        for listener in listeners {
            let name = listener.name().to_string();
            let event = Arc::clone(&event);
            let run = tokio::spawn(async move { listener.on_complete(&event).await });
            match run.await {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(err)) => tracing::warn!(
                    event = "completion.listener_failed",
                    listener = %name,
                    error = %format!("{err:#}"),
                ),
                Err(err) => tracing::error!(
                    event = "completion.listener_panicked",
                    listener = %name,
                    error = %err,
                ),
            }
        }
        succeeded
    }
}

pub fn completion_channel() -> (mpsc::Sender<CompletionEvent>, mpsc::Receiver<CompletionEvent>) {
    mpsc::channel(CHANNEL_CAPACITY)
}

/// Drains events queued by the callback receiver. On shutdown the channel is
/// closed to new events and whatever is already buffered is still delivered.
pub fn spawn_dispatch_worker(
    dispatcher: Arc<CompletionDispatcher>,
    mut rx: mpsc::Receiver<CompletionEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    dispatcher.notify(event).await;
                }
            }
        }
        rx.close();
        let mut drained = 0usize;
        while let Some(event) = rx.recv().await {
            dispatcher.notify(event).await;
            drained += 1;
        }
        tracing::info!(event = "completion.worker_stopped", drained);
    })
}
