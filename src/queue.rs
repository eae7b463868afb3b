use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::model::Commit;

/// A unit of work for the worker pool.
#[derive(Debug)]
pub enum Task {
    Commit(Box<Commit>),
    /// Tells the worker receiving it to stop.
    Shutdown,
}

#[derive(Default)]
struct State {
    items: VecDeque<Task>,
    /// Tasks pushed but not yet acknowledged with `task_done`.
    unfinished: usize,
}

/// FIFO shared by the poller and the workers, tracking which tasks have
/// been acknowledged so the poller can wait for a batch to drain.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<State>,
    available: Notify,
    drained: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: Task) {
        {
            let mut state = self.state.lock();
            state.items.push_back(task);
            state.unfinished += 1;
        }
        self.available.notify_one();
    }

    /// Waits for the next task. Every popped task must later be acknowledged
    /// with [`task_done`](Self::task_done).
    pub async fn pop(&self) -> Task {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(task) = state.items.pop_front() {
                    if !state.items.is_empty() {
                        self.available.notify_one();
                    }
                    return task;
                }
            }
            self.available.notified().await;
        }
    }

    pub fn task_done(&self) {
        let mut state = self.state.lock();
        if state.unfinished == 0 {
            log::warn!("task_done called more times than tasks were pushed");
            return;
        }
        state.unfinished -= 1;
        if state.unfinished == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Waits until every pushed task has been acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent `task_done` is not missed
            notified.as_mut().enable();
            if self.state.lock().unfinished == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Tasks waiting to be popped.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unfinished(&self) -> usize {
        self.state.lock().unfinished
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn fifo_order() {
        let queue = TaskQueue::new();
        queue.push(Task::Shutdown);
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.pop().await, Task::Shutdown));
        assert!(queue.is_empty());
        assert_eq!(queue.unfinished(), 1);
        queue.task_done();
        assert_eq!(queue.unfinished(), 0);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.push(Task::Shutdown);
        let task = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(task, Task::Shutdown));
    }

    #[tokio::test]
    async fn join_waits_for_acknowledgements() {
        let queue = Arc::new(TaskQueue::new());
        queue.push(Task::Shutdown);
        queue.push(Task::Shutdown);

        // Nothing pushed yet is acknowledged, so join must block
        assert!(
            tokio::time::timeout(Duration::from_millis(20), queue.join())
                .await
                .is_err()
        );

        let joiner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.join().await })
        };
        queue.pop().await;
        queue.task_done();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!joiner.is_finished());

        queue.pop().await;
        queue.task_done();
        tokio::time::timeout(Duration::from_secs(1), joiner)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn join_on_idle_queue_returns() {
        let queue = TaskQueue::new();
        tokio::time::timeout(Duration::from_secs(1), queue.join())
            .await
            .unwrap();
        // Extra acknowledgements are ignored
        queue.task_done();
        assert_eq!(queue.unfinished(), 0);
    }

    #[tokio::test]
    async fn several_consumers_each_get_one() {
        let queue = Arc::new(TaskQueue::new());
        let mut consumers = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move { queue.pop().await }));
        }
        for _ in 0..3 {
            queue.push(Task::Shutdown);
        }
        for consumer in consumers {
            tokio::time::timeout(Duration::from_secs(1), consumer)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(queue.is_empty());
        assert_eq!(queue.unfinished(), 3);
    }
}
