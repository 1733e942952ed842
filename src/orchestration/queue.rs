//! Per-task-type priority queues.
//!
//! Ordering key is `(priority desc, created_at asc, insertion order asc)`,
//! so dequeue order is a pure function of what was enqueued and in which
//! order, independent of timing.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::trace;

use crate::core::{PipelineId, Task, TaskId, TaskType};

struct Entry {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap pops the greatest entry first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heaps: HashMap<TaskType, BinaryHeap<Entry>>,
    /// Insertion sequence per task, kept across requeues.
    seqs: HashMap<TaskId, u64>,
    next_seq: u64,
}

/// Pending tasks, one queue per task type.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    wake: HashMap<TaskType, Notify>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            wake: TaskType::ALL.iter().map(|t| (*t, Notify::new())).collect(),
        }
    }

    /// Add a task and wake one waiter on its type.
    pub async fn enqueue(&self, task: Task) {
        let task_type = task.task_type();
        {
            let mut inner = self.inner.lock().await;
            let seq = match inner.seqs.get(&task.id()) {
                Some(seq) => *seq,
                None => {
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    inner.seqs.insert(task.id(), seq);
                    seq
                }
            };
            trace!(task = %task.id(), %task_type, priority = task.priority(), seq, "enqueue");
            inner.heaps.entry(task_type).or_default().push(Entry {
                priority: task.priority(),
                created_at: task.created_at(),
                seq,
                task,
            });
        }
        if let Some(notify) = self.wake.get(&task_type) {
            notify.notify_one();
        }
    }

    /// Put a task back after a failed or timed-out assignment. It keeps its
    /// original place in the ordering.
    pub async fn requeue(&self, task: Task) {
        self.enqueue(task).await;
    }

    /// Next task of `task_type`, or `None` if the queue is empty. Never blocks.
    pub async fn dequeue(&self, task_type: TaskType) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        inner
            .heaps
            .get_mut(&task_type)
            .and_then(BinaryHeap::pop)
            .map(|e| e.task)
    }

    /// Wait until a task of `task_type` is available.
    ///
    /// The lock is not held while waiting.
    pub async fn dequeue_wait(&self, task_type: TaskType) -> Task {
        loop {
            if let Some(task) = self.dequeue(task_type).await {
                return task;
            }
            match self.wake.get(&task_type) {
                Some(notify) => notify.notified().await,
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// Remove a queued task wherever it sits.
    pub async fn remove(&self, task_id: &TaskId) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        for heap in inner.heaps.values_mut() {
            if heap.iter().any(|e| &e.task.id() == task_id) {
                let mut removed = None;
                heap.retain(|e| {
                    if &e.task.id() == task_id {
                        removed = Some(e.task.clone());
                        false
                    } else {
                        true
                    }
                });
                return removed;
            }
        }
        None
    }

    /// Drop ordering bookkeeping for a task that reached a terminal state.
    pub async fn forget(&self, task_id: &TaskId) {
        self.inner.lock().await.seqs.remove(task_id);
    }

    /// Queued tasks referencing `pipeline_id`, in no particular order.
    pub async fn pending_for_pipeline(&self, pipeline_id: &PipelineId) -> Vec<Task> {
        self.inner
            .lock()
            .await
            .heaps
            .values()
            .flat_map(|heap| heap.iter())
            .filter(|e| e.task.pipeline_id() == Some(pipeline_id))
            .map(|e| e.task.clone())
            .collect()
    }

    pub async fn len(&self, task_type: TaskType) -> usize {
        self.inner
            .lock()
            .await
            .heaps
            .get(&task_type)
            .map_or(0, BinaryHeap::len)
    }

    pub async fn total(&self) -> usize {
        self.inner.lock().await.heaps.values().map(BinaryHeap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(task_type: TaskType, priority: i32, at: DateTime<Utc>, label: &str) -> Task {
        Task::new(task_type, priority, json!({ "label": label })).with_created_at(at)
    }

    async fn drain(queue: &TaskQueue, task_type: TaskType) -> Vec<String> {
        let mut labels = Vec::new();
        while let Some(t) = queue.dequeue(task_type).await {
            labels.push(t.payload()["label"].as_str().unwrap_or_default().to_string());
        }
        labels
    }

    #[tokio::test]
    async fn test_priority_then_created_at() {
        let queue = TaskQueue::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        queue.enqueue(task(TaskType::Mapping, 5, t0, "low-early")).await;
        queue.enqueue(task(TaskType::Mapping, 10, t1, "high-late")).await;
        queue.enqueue(task(TaskType::Mapping, 10, t0, "high-early")).await;

        assert_eq!(
            drain(&queue, TaskType::Mapping).await,
            vec!["high-early", "high-late", "low-early"]
        );
    }

    #[tokio::test]
    async fn test_identical_timestamps_keep_insertion_order() {
        let queue = TaskQueue::new();
        let at = Utc::now();
        for label in ["a", "b", "c", "d"] {
            queue.enqueue(task(TaskType::Discovery, 1, at, label)).await;
        }
        assert_eq!(drain(&queue, TaskType::Discovery).await, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_requeue_keeps_original_position() {
        let queue = TaskQueue::new();
        let at = Utc::now();
        queue.enqueue(task(TaskType::Discovery, 1, at, "first")).await;
        queue.enqueue(task(TaskType::Discovery, 1, at, "second")).await;

        let first = queue.dequeue(TaskType::Discovery).await.unwrap();
        queue.requeue(first).await;
        assert_eq!(drain(&queue, TaskType::Discovery).await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_queues_are_per_type() {
        let queue = TaskQueue::new();
        queue.enqueue(task(TaskType::Discovery, 1, Utc::now(), "d")).await;
        assert!(queue.dequeue(TaskType::Mapping).await.is_none());
        assert_eq!(queue.len(TaskType::Discovery).await, 1);
        assert_eq!(queue.total().await, 1);
    }

    #[tokio::test]
    async fn test_dequeue_wait_wakes_on_enqueue() {
        let queue = Arc::new(TaskQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_wait(TaskType::ErrorResolution).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue
            .enqueue(task(TaskType::ErrorResolution, 1, Utc::now(), "fix"))
            .await;

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.payload()["label"], "fix");
    }

    #[tokio::test]
    async fn test_remove_and_pending_for_pipeline() {
        let queue = TaskQueue::new();
        let pipeline = PipelineId::from("orders");
        let mine = task(TaskType::Mapping, 1, Utc::now(), "mine").for_pipeline(pipeline.clone());
        let id = mine.id();
        queue.enqueue(mine).await;
        queue.enqueue(task(TaskType::Mapping, 1, Utc::now(), "other")).await;

        assert_eq!(queue.pending_for_pipeline(&pipeline).await.len(), 1);
        assert!(queue.remove(&id).await.is_some());
        assert!(queue.pending_for_pipeline(&pipeline).await.is_empty());
        assert!(queue.remove(&id).await.is_none());
    }
}
