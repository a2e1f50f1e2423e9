use async_trait::async_trait;
use orchestrator::{CompletionEvent, CompletionListener};
use protocol::control::ConsoleEvent;
use protocol::task::PendingTask;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Forwards completions to websocket subscribers.
pub(crate) struct EventStreamListener {
    tx: broadcast::Sender<ConsoleEvent>,
}

impl EventStreamListener {
    pub(crate) fn new(tx: broadcast::Sender<ConsoleEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl CompletionListener for EventStreamListener {
    fn name(&self) -> &str {
        "event-stream"
    }

    async fn on_complete(&self, event: &CompletionEvent) -> anyhow::Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(ConsoleEvent::OperationCompleted {
            completion: event.view(),
        });
        Ok(())
    }
}

pub(crate) fn spawn_task_forwarder(
    mut updates: broadcast::Receiver<PendingTask>,
    tx: broadcast::Sender<ConsoleEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                update = updates.recv() => match update {
                    Ok(task) => {
                        let _ = tx.send(ConsoleEvent::TaskUpdated { task });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(event = "events.task_updates_lagged", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::CompletionContext;
    use protocol::config::TargetClass;
    use protocol::task::TaskState;

    #[tokio::test]
    async fn completion_becomes_console_event() {
        let (tx, mut rx) = broadcast::channel(8);
        let listener = EventStreamListener::new(tx);
        let event = CompletionEvent {
            target_id: "app-1".to_string(),
            target_class: TargetClass::App,
            script_id: "install_x".to_string(),
            success: false,
            context: CompletionContext {
                exit_code: Some(3),
                ..CompletionContext::default()
            },
        };
        listener.on_complete(&event).await.expect("listener");
        match rx.recv().await.expect("event") {
            ConsoleEvent::OperationCompleted { completion } => {
                assert_eq!(completion.target_id, "app-1");
                assert_eq!(completion.exit_code, Some(3));
                assert!(!completion.success);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_updates_are_forwarded() {
        let (update_tx, update_rx) = broadcast::channel(8);
        let (tx, mut rx) = broadcast::channel(8);
        let shutdown = CancellationToken::new();
        let forwarder = spawn_task_forwarder(update_rx, tx, shutdown.clone());
        update_tx
            .send(PendingTask {
                id: "t-1".to_string(),
                target_key: "srv-1".to_string(),
                task_type: "soft_reboot".to_string(),
                state: TaskState::Ready,
                payload: Default::default(),
                action_hook: "reboot".to_string(),
                sequence: 1,
                created_at_ms: 0,
                updated_at_ms: 0,
                stale: false,
                retry_of: None,
            })
            .expect("send");
        match rx.recv().await.expect("event") {
            ConsoleEvent::TaskUpdated { task } => assert_eq!(task.id, "t-1"),
            other => panic!("unexpected event {other:?}"),
        }
        shutdown.cancel();
        forwarder.await.expect("join");
    }
}
