//! Background runner that drains the task queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use protocol::task::PendingTask;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, StoreError};
use crate::queue::TaskQueue;
use crate::store::RecordStore;
use crate::time::now_ms;

const LEASE_ENTITY: &str = "runner";
const LEASE_KEY: &str = "lease";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Completed,
    Failed(String),
    /// The result arrives later as a completion event.
    AwaitingCompletion,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &PendingTask) -> anyhow::Result<HandlerOutcome>;
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub lease_ttl: Duration,
    pub holder: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            stale_after: Duration::from_secs(30 * 60),
            lease_ttl: Duration::from_secs(30),
            holder: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct LeaseRecord {
    holder: String,
    expires_at_ms: u64,
}

/// Store row naming the single runner allowed to claim tasks.
pub struct RunnerLease {
    store: Arc<dyn RecordStore>,
    holder: String,
    ttl: Duration,
}

impl RunnerLease {
    pub fn new(store: Arc<dyn RecordStore>, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            holder: holder.into(),
            ttl,
        }
    }

    /// Takes a free or expired lease, or renews our own.
    pub fn acquire(&self) -> Result<bool, StoreError> {
        let now = now_ms();
        let current = self.store.get(LEASE_ENTITY, LEASE_KEY)?;
        if let Some(raw) = current.as_deref() {
            match serde_json::from_str::<LeaseRecord>(raw) {
                Ok(lease) if lease.holder != self.holder && lease.expires_at_ms > now => {
                    return Ok(false)
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(event = "runner.lease_corrupt", error = %err);
                }
            }
        }
        let next = serde_json::to_string(&LeaseRecord {
            holder: self.holder.clone(),
            expires_at_ms: now + self.ttl.as_millis() as u64,
        })?;
        self.store
            .compare_and_swap(LEASE_ENTITY, LEASE_KEY, current.as_deref(), Some(&next))
    }

    pub fn release(&self) -> Result<bool, StoreError> {
        let Some(raw) = self.store.get(LEASE_ENTITY, LEASE_KEY)? else {
            return Ok(false);
        };
        match serde_json::from_str::<LeaseRecord>(&raw) {
            Ok(lease) if lease.holder == self.holder => {
                self.store
                    .compare_and_swap(LEASE_ENTITY, LEASE_KEY, Some(&raw), None)
            }
            _ => Ok(false),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

pub struct QueueRunner {
    queue: Arc<TaskQueue>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    lease: RunnerLease,
    config: RunnerConfig,
}

impl QueueRunner {
    pub fn new(queue: Arc<TaskQueue>, store: Arc<dyn RecordStore>, config: RunnerConfig) -> Self {
        let lease = RunnerLease::new(store, config.holder.clone(), config.lease_ttl);
        Self {
            queue,
            handlers: HashMap::new(),
            lease,
            config,
        }
    }

    pub fn register(&mut self, hook: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(hook.into(), handler);
    }

    pub fn hooks(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// One pass: renew the lease, flag stale tasks, then start every task
    /// that may run now. Returns the spawned invocations.
    pub fn tick(&self) -> Result<Vec<JoinHandle<()>>, QueueError> {
        if !self.lease.acquire()? {
            tracing::debug!(event = "runner.lease_held_elsewhere", holder = %self.lease.holder());
            return Ok(Vec::new());
        }
        self.queue.flag_stale(self.config.stale_after)?;

        let mut invocations = Vec::new();
        while let Some(task) = self.queue.claim_next()? {
            let handler = self.handlers.get(&task.action_hook).cloned();
            let queue = Arc::clone(&self.queue);
            invocations.push(tokio::spawn(invoke(queue, handler, task)));
        }
        Ok(invocations)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            event = "runner.started",
            holder = %self.lease.holder(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            hooks = self.handlers.len(),
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.tick() {
                        tracing::warn!(event = "runner.tick_failed", error = %err);
                    }
                }
            }
        }
        if let Err(err) = self.lease.release() {
            tracing::warn!(event = "runner.lease_release_failed", error = %err);
        }
        tracing::info!(event = "runner.stopped");
    }
}

async fn invoke(queue: Arc<TaskQueue>, handler: Option<Arc<dyn TaskHandler>>, task: PendingTask) {
    let Some(handler) = handler else {
        settle(
            &queue,
            &task,
            HandlerOutcome::Failed(format!("no handler registered for hook {}", task.action_hook)),
        );
        return;
    };
    let input = task.clone();
    let outcome = match tokio::spawn(async move { handler.handle(&input).await }).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => HandlerOutcome::Failed(format!("{err:#}")),
        Err(err) if err.is_panic() => HandlerOutcome::Failed("handler panicked".to_string()),
        Err(err) => HandlerOutcome::Failed(format!("handler aborted: {err}")),
    };
    settle(&queue, &task, outcome);
}

fn settle(queue: &TaskQueue, task: &PendingTask, outcome: HandlerOutcome) {
    let result = match outcome {
        HandlerOutcome::Completed => queue.mark_complete(&task.id).map(|_| ()),
        HandlerOutcome::Failed(reason) => queue.mark_failed(&task.id, &reason).map(|_| ()),
        HandlerOutcome::AwaitingCompletion => {
            tracing::debug!(event = "runner.awaiting_completion", task_id = %task.id);
            Ok(())
        }
    };
    match result {
        Ok(()) => {}
        // A completion event may have settled the task first.
        Err(QueueError::Terminal { state, .. }) => tracing::info!(
            event = "runner.already_settled",
            task_id = %task.id,
            state = %state,
        ),
        Err(err) => tracing::error!(
            event = "runner.settle_failed",
            task_id = %task.id,
            error = %err,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Compatibility;
    use crate::store::MemoryStore;
    use protocol::control::EnqueueRequest;
    use protocol::task::TaskState;
    use protocol::Params;

    struct Fixed(fn() -> anyhow::Result<HandlerOutcome>);

    #[async_trait]
    impl TaskHandler for Fixed {
        async fn handle(&self, _task: &PendingTask) -> anyhow::Result<HandlerOutcome> {
            (self.0)()
        }
    }

    fn setup() -> (Arc<TaskQueue>, Arc<dyn RecordStore>) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let queue = Arc::new(TaskQueue::new(Arc::clone(&store), Compatibility::default()));
        (queue, store)
    }

    fn enqueue(queue: &TaskQueue, target: &str, hook: &str) -> PendingTask {
        queue
            .enqueue(EnqueueRequest {
                target_key: target.to_string(),
                task_type: "soft_reboot".to_string(),
                payload: Params::new(),
                action_hook: hook.to_string(),
            })
            .unwrap()
    }

    async fn drain(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn exclusive_tasks_run_one_after_another() {
        let (queue, store) = setup();
        let mut runner = QueueRunner::new(Arc::clone(&queue), store, RunnerConfig::default());
        runner.register("reboot", Arc::new(Fixed(|| Ok(HandlerOutcome::Completed))));
        let first = enqueue(&queue, "srv-1", "reboot");
        let second = enqueue(&queue, "srv-1", "reboot");

        let handles = runner.tick().unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(queue.get(&second.id).unwrap().state, TaskState::Ready);
        drain(handles).await;
        assert_eq!(queue.get(&first.id).unwrap().state, TaskState::Complete);

        drain(runner.tick().unwrap()).await;
        assert_eq!(queue.get(&second.id).unwrap().state, TaskState::Complete);
    }

    #[tokio::test]
    async fn handler_failures_become_failed_tasks() {
        let (queue, store) = setup();
        let mut runner = QueueRunner::new(Arc::clone(&queue), store, RunnerConfig::default());
        runner.register("erroring", Arc::new(Fixed(|| anyhow::bail!("ssh unreachable"))));
        runner.register("panicking", Arc::new(Fixed(|| panic!("boom"))));
        runner.register(
            "declined",
            Arc::new(Fixed(|| Ok(HandlerOutcome::Failed("INSTALL FAILED".to_string())))),
        );
        runner.register(
            "waiting",
            Arc::new(Fixed(|| Ok(HandlerOutcome::AwaitingCompletion))),
        );
        let erroring = enqueue(&queue, "srv-1", "erroring");
        let panicking = enqueue(&queue, "srv-2", "panicking");
        let declined = enqueue(&queue, "srv-3", "declined");
        let unknown = enqueue(&queue, "srv-4", "nobody");
        let waiting = enqueue(&queue, "srv-5", "waiting");

        drain(runner.tick().unwrap()).await;
        let error_of = |id: &str| queue.get(id).unwrap().error().map(str::to_string);
        assert_eq!(error_of(&erroring.id).as_deref(), Some("ssh unreachable"));
        assert_eq!(error_of(&panicking.id).as_deref(), Some("handler panicked"));
        assert_eq!(error_of(&declined.id).as_deref(), Some("INSTALL FAILED"));
        assert!(error_of(&unknown.id).unwrap().contains("nobody"));
        assert_eq!(queue.get(&unknown.id).unwrap().state, TaskState::Failed);
        assert_eq!(queue.get(&waiting.id).unwrap().state, TaskState::InProcess);
    }

    #[tokio::test]
    async fn only_the_lease_holder_claims() {
        let (queue, store) = setup();
        let config = |holder: &str| RunnerConfig {
            holder: holder.to_string(),
            lease_ttl: Duration::from_millis(100),
            ..RunnerConfig::default()
        };
        let mut a = QueueRunner::new(Arc::clone(&queue), Arc::clone(&store), config("a"));
        let mut b = QueueRunner::new(Arc::clone(&queue), Arc::clone(&store), config("b"));
        a.register("reboot", Arc::new(Fixed(|| Ok(HandlerOutcome::Completed))));
        b.register("reboot", Arc::new(Fixed(|| Ok(HandlerOutcome::Completed))));

        enqueue(&queue, "srv-1", "reboot");
        drain(a.tick().unwrap()).await;
        enqueue(&queue, "srv-2", "reboot");
        assert!(b.tick().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(b.tick().unwrap().len(), 1);
        assert!(a.tick().unwrap().is_empty());
    }

    #[test]
    fn lease_release_frees_the_row() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let a = RunnerLease::new(Arc::clone(&store), "a", Duration::from_secs(60));
        let b = RunnerLease::new(Arc::clone(&store), "b", Duration::from_secs(60));
        assert!(a.acquire().unwrap());
        assert!(a.acquire().unwrap());
        assert!(!b.acquire().unwrap());
        assert!(!b.release().unwrap());
        assert!(a.release().unwrap());
        assert!(b.acquire().unwrap());
    }
}
