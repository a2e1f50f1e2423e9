//! Durable pending-task queue.
//!
//! Tasks move `ready -> in-process -> complete | failed`; finished tasks
//! never change again. Every transition is a conditional update of the
//! task's row, so two writers can never both move the same task.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::control::{BulkEnqueueRequest, EnqueueRequest, TaskQuery};
use protocol::task::{PendingTask, TaskState, ERROR_KEY};
use tokio::sync::broadcast;

use crate::error::{QueueError, StoreError};
use crate::store::RecordStore;
use crate::time::now_ms;

pub const TASK_ENTITY: &str = "pending_tasks";
const META_ENTITY: &str = "queue_meta";
const SEQUENCE_KEY: &str = "sequence";
const MAX_UPDATE_ATTEMPTS: usize = 8;
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Groups of task types allowed to be in process together on one target.
/// Types that share no group are exclusive, and a type is always exclusive
/// with itself.
#[derive(Debug, Clone, Default)]
pub struct Compatibility {
    groups: Vec<BTreeSet<String>>,
}

impl Compatibility {
    pub fn new<I, G, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups
                .into_iter()
                .map(|group| group.into_iter().map(Into::into).collect())
                .filter(|group: &BTreeSet<String>| group.len() > 1)
                .collect(),
        }
    }

    pub fn compatible(&self, a: &str, b: &str) -> bool {
        a != b
            && self
                .groups
                .iter()
                .any(|group| group.contains(a) && group.contains(b))
    }
}

pub struct TaskQueue {
    store: Arc<dyn RecordStore>,
    compatibility: Compatibility,
    claim_lock: Mutex<()>,
    updates: broadcast::Sender<PendingTask>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn RecordStore>, compatibility: Compatibility) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            store,
            compatibility,
            claim_lock: Mutex::new(()),
            updates,
        }
    }

    /// Every task write, after it is stored.
    pub fn subscribe(&self) -> broadcast::Receiver<PendingTask> {
        self.updates.subscribe()
    }

    pub fn enqueue(&self, request: EnqueueRequest) -> Result<PendingTask, QueueError> {
        validate_field("target_key", &request.target_key)?;
        validate_field("task_type", &request.task_type)?;
        validate_field("action_hook", &request.action_hook)?;
        let task = self.new_task(
            request.target_key,
            request.task_type,
            request.payload,
            request.action_hook,
            None,
        )?;
        tracing::info!(
            event = "queue.enqueued",
            task_id = %task.id,
            target = %task.target_key,
            task_type = %task.task_type,
            hook = %task.action_hook,
        );
        Ok(task)
    }

    /// One independent task per target; a repeated key is scheduled once.
    pub fn enqueue_bulk(&self, request: BulkEnqueueRequest) -> Result<Vec<PendingTask>, QueueError> {
        if request.target_keys.is_empty() {
            return Err(QueueError::Invalid("target_keys is empty".to_string()));
        }
        for key in &request.target_keys {
            validate_field("target_key", key)?;
        }
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(request.target_keys.len());
        for target_key in request.target_keys {
            if !seen.insert(target_key.clone()) {
                continue;
            }
            tasks.push(self.enqueue(EnqueueRequest {
                target_key,
                task_type: request.task_type.clone(),
                payload: request.payload.clone(),
                action_hook: request.action_hook.clone(),
            })?);
        }
        Ok(tasks)
    }

    pub fn get(&self, id: &str) -> Result<PendingTask, QueueError> {
        self.load(id)?
            .map(|(_, task)| task)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Matching tasks, oldest first.
    pub fn list(&self, query: &TaskQuery) -> Result<Vec<PendingTask>, QueueError> {
        let mut tasks: Vec<PendingTask> = self
            .load_all()?
            .into_iter()
            .filter(|task| {
                query
                    .target_key
                    .as_deref()
                    .map_or(true, |key| key == task.target_key)
                    && query.state.map_or(true, |state| state == task.state)
                    && query
                        .task_type
                        .as_deref()
                        .map_or(true, |task_type| task_type == task.task_type)
            })
            .collect();
        sort_fifo(&mut tasks);
        Ok(tasks)
    }

    pub fn list_by_state(
        &self,
        target_key: &str,
        state: TaskState,
        task_type: Option<&str>,
    ) -> Result<Vec<PendingTask>, QueueError> {
        self.list(&TaskQuery {
            target_key: Some(target_key.to_string()),
            state: Some(state),
            task_type: task_type.map(str::to_string),
        })
    }

    /// Moves the oldest runnable `ready` task to `in-process`. A target whose
    /// oldest ready task is blocked by an incompatible in-process task is
    /// skipped entirely, which keeps each target's tasks in order.
    pub fn claim_next(&self) -> Result<Option<PendingTask>, QueueError> {
        let _guard = self
            .claim_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tasks = self.load_all()?;
        let mut running: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in tasks.iter().filter(|task| task.state == TaskState::InProcess) {
            running
                .entry(task.target_key.as_str())
                .or_default()
                .push(task.task_type.as_str());
        }
        let mut ready: Vec<&PendingTask> = tasks
            .iter()
            .filter(|task| task.state == TaskState::Ready)
            .collect();
        ready.sort_by_key(|task| (task.created_at_ms, task.sequence));

        let mut blocked: HashSet<&str> = HashSet::new();
        for task in ready {
            if blocked.contains(task.target_key.as_str()) {
                continue;
            }
            let busy = running
                .get(task.target_key.as_str())
                .map_or(false, |types| {
                    types
                        .iter()
                        .any(|running| !self.compatibility.compatible(running, &task.task_type))
                });
            if busy {
                blocked.insert(task.target_key.as_str());
                continue;
            }
            let mut claimed = task.clone();
            claimed.state = TaskState::InProcess;
            claimed.stale = false;
            claimed.updated_at_ms = now_ms();
            if self.swap(task, &claimed)? {
                tracing::info!(
                    event = "queue.claimed",
                    task_id = %claimed.id,
                    target = %claimed.target_key,
                    task_type = %claimed.task_type,
                );
                self.publish(&claimed);
                return Ok(Some(claimed));
            }
            // Lost a race with an admin write; the target is re-evaluated next tick.
            blocked.insert(task.target_key.as_str());
        }
        Ok(None)
    }

    pub fn mark_complete(&self, id: &str) -> Result<PendingTask, QueueError> {
        let task = self.finish(id, TaskState::Complete, None)?;
        tracing::info!(event = "queue.completed", task_id = %id, target = %task.target_key);
        Ok(task)
    }

    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<PendingTask, QueueError> {
        let task = self.finish(id, TaskState::Failed, Some(reason))?;
        tracing::warn!(
            event = "queue.failed",
            task_id = %id,
            target = %task.target_key,
            reason = %reason,
        );
        Ok(task)
    }

    /// Flags in-process tasks older than `threshold`. Returns the newly
    /// flagged ones; their state is left alone.
    pub fn flag_stale(&self, threshold: Duration) -> Result<Vec<PendingTask>, QueueError> {
        let cutoff = now_ms().saturating_sub(threshold.as_millis() as u64);
        let mut flagged = Vec::new();
        for task in self.load_all()? {
            if task.state != TaskState::InProcess || task.stale || task.updated_at_ms > cutoff {
                continue;
            }
            let mut marked = task.clone();
            marked.stale = true;
            if self.swap(&task, &marked)? {
                tracing::warn!(
                    event = "queue.stale",
                    task_id = %marked.id,
                    target = %marked.target_key,
                    in_process_since_ms = marked.updated_at_ms,
                );
                self.publish(&marked);
                flagged.push(marked);
            }
        }
        Ok(flagged)
    }

    pub fn stale(&self, threshold: Duration) -> Result<Vec<PendingTask>, QueueError> {
        let cutoff = now_ms().saturating_sub(threshold.as_millis() as u64);
        let mut tasks: Vec<PendingTask> = self
            .load_all()?
            .into_iter()
            .filter(|task| {
                task.state == TaskState::InProcess && (task.stale || task.updated_at_ms <= cutoff)
            })
            .collect();
        sort_fifo(&mut tasks);
        Ok(tasks)
    }

    /// Schedules a fresh `ready` copy of a failed task.
    pub fn retry(&self, id: &str) -> Result<PendingTask, QueueError> {
        let failed = self.get(id)?;
        if failed.state != TaskState::Failed {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: failed.state,
                to: TaskState::Ready,
            });
        }
        let mut payload = failed.payload;
        payload.remove(ERROR_KEY);
        let task = self.new_task(
            failed.target_key,
            failed.task_type,
            payload,
            failed.action_hook,
            Some(failed.id),
        )?;
        tracing::info!(event = "queue.retried", task_id = %task.id, retry_of = %id);
        Ok(task)
    }

    pub fn purge(&self, id: &str) -> Result<PendingTask, QueueError> {
        let (raw, task) = self
            .load(id)?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !task.state.is_terminal() {
            return Err(QueueError::NotTerminal {
                id: id.to_string(),
                state: task.state,
            });
        }
        if !self
            .store
            .compare_and_swap(TASK_ENTITY, id, Some(&raw), None)?
        {
            return Err(QueueError::Conflict { id: id.to_string() });
        }
        tracing::info!(event = "queue.purged", task_id = %id, state = %task.state);
        Ok(task)
    }

    fn finish(
        &self,
        id: &str,
        to: TaskState,
        reason: Option<&str>,
    ) -> Result<PendingTask, QueueError> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let (_, current) = self
                .load(id)?
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            match current.state {
                state if state.is_terminal() => {
                    return Err(QueueError::Terminal {
                        id: id.to_string(),
                        state,
                    })
                }
                TaskState::Ready => {
                    return Err(QueueError::InvalidTransition {
                        id: id.to_string(),
                        from: TaskState::Ready,
                        to,
                    })
                }
                _ => {}
            }
            let mut next = current.clone();
            next.state = to;
            next.updated_at_ms = now_ms();
            if let Some(reason) = reason {
                next.payload.insert(ERROR_KEY.to_string(), reason.to_string());
            }
            if self.swap(&current, &next)? {
                self.publish(&next);
                return Ok(next);
            }
        }
        Err(QueueError::Conflict { id: id.to_string() })
    }

    fn new_task(
        &self,
        target_key: String,
        task_type: String,
        payload: protocol::Params,
        action_hook: String,
        retry_of: Option<String>,
    ) -> Result<PendingTask, QueueError> {
        let now = now_ms();
        let task = PendingTask {
            id: uuid::Uuid::new_v4().to_string(),
            target_key,
            task_type,
            state: TaskState::Ready,
            payload,
            action_hook,
            sequence: self.next_sequence()?,
            created_at_ms: now,
            updated_at_ms: now,
            stale: false,
            retry_of,
        };
        let encoded = serde_json::to_string(&task)?;
        if !self
            .store
            .compare_and_swap(TASK_ENTITY, &task.id, None, Some(&encoded))?
        {
            return Err(QueueError::Conflict { id: task.id });
        }
        self.publish(&task);
        Ok(task)
    }

    fn next_sequence(&self) -> Result<u64, QueueError> {
        for _ in 0..MAX_UPDATE_ATTEMPTS * 4 {
            let current = self.store.get(META_ENTITY, SEQUENCE_KEY)?;
            let value = current
                .as_deref()
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0)
                + 1;
            if self.store.compare_and_swap(
                META_ENTITY,
                SEQUENCE_KEY,
                current.as_deref(),
                Some(&value.to_string()),
            )? {
                return Ok(value);
            }
        }
        Err(QueueError::Conflict {
            id: SEQUENCE_KEY.to_string(),
        })
    }

    fn swap(&self, current: &PendingTask, next: &PendingTask) -> Result<bool, QueueError> {
        let expected = serde_json::to_string(current)?;
        let encoded = serde_json::to_string(next)?;
        Ok(self
            .store
            .compare_and_swap(TASK_ENTITY, &current.id, Some(&expected), Some(&encoded))?)
    }

    fn load(&self, id: &str) -> Result<Option<(String, PendingTask)>, QueueError> {
        match self.store.get(TASK_ENTITY, id)? {
            Some(raw) => {
                let task = serde_json::from_str(&raw)?;
                Ok(Some((raw, task)))
            }
            None => Ok(None),
        }
    }

    fn load_all(&self) -> Result<Vec<PendingTask>, QueueError> {
        let mut tasks = Vec::new();
        for id in self.store.keys(TASK_ENTITY)? {
            match self.load(&id) {
                Ok(Some((_, task))) => tasks.push(task),
                Ok(None) => {}
                Err(QueueError::Store(StoreError::Encoding(err))) => {
                    tracing::warn!(event = "queue.corrupt_row", task_id = %id, error = %err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(tasks)
    }

    fn publish(&self, task: &PendingTask) {
        let _ = self.updates.send(task.clone());
    }
}

fn validate_field(name: &str, value: &str) -> Result<(), QueueError> {
    if value.trim().is_empty() {
        return Err(QueueError::Invalid(format!("{name} is empty")));
    }
    Ok(())
}

fn sort_fifo(tasks: &mut [PendingTask]) {
    tasks.sort_by_key(|task| (task.created_at_ms, task.sequence));
}
