//! Sequential task queue: serializes asynchronous operations submitted from
//! any number of producers and runs them one at a time in submission order.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Task = Box<dyn FnOnce() -> TaskFuture + Send>;

/// `head` counts completed tasks, `tail` counts enqueued ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueProgress {
    pub head: u64,
    pub tail: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing was ever enqueued.
    Empty,
    Running,
    Idle,
}

impl QueueProgress {
    pub fn state(self) -> QueueState {
        if self.tail == 0 {
            QueueState::Empty
        } else if self.head < self.tail {
            QueueState::Running
        } else {
            QueueState::Idle
        }
    }

    pub fn is_idle(self) -> bool {
        self.state() == QueueState::Idle
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Task>,
    progress: Arc<watch::Sender<QueueProgress>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("progress", &self.progress())
            .finish()
    }
}

impl TaskQueue {
    /// Creates the queue and spawns its consumer. Must be called from within a
    /// tokio runtime.
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (progress, _) = watch::channel(QueueProgress::default());
        let progress = Arc::new(progress);
        let name: Arc<str> = Arc::from(name);

        tokio::spawn(drain(Arc::clone(&name), receiver, Arc::clone(&progress)));

        Self {
            name,
            sender,
            progress,
        }
    }

    /// Appends `work` to the tail. It is invoked only once every earlier task
    /// has completed. Failures inside `work` are its own business.
    pub fn enqueue<F, Fut>(&self, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.progress.send_modify(|progress| progress.tail += 1);
        let task: Task = Box::new(move || Box::pin(work()));
        if self.sender.send(task).is_err() {
            self.progress.send_modify(|progress| progress.tail -= 1);
            warn!(queue = %self.name, "task queue consumer is gone; dropping task");
        }
    }

    /// Enqueues `work` and returns a receiver for its result.
    pub fn submit<F, Fut, T>(&self, work: F) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(move || async move {
            let value = work().await;
            let _ = tx.send(value);
        });
        rx
    }

    pub fn progress(&self) -> QueueProgress {
        *self.progress.borrow()
    }

    pub fn state(&self) -> QueueState {
        self.progress().state()
    }

    /// True once at least one task has run and nothing is pending.
    pub fn is_idle(&self) -> bool {
        self.progress().is_idle()
    }

    /// Waits until the queue is idle. An empty queue keeps waiting for its
    /// first task.
    pub async fn wait_idle(&self) {
        let mut receiver = self.progress.subscribe();
        let _ = receiver.wait_for(|progress| progress.is_idle()).await;
    }
}

async fn drain(
    name: Arc<str>,
    mut receiver: mpsc::UnboundedReceiver<Task>,
    progress: Arc<watch::Sender<QueueProgress>>,
) {
    while let Some(task) = receiver.recv().await {
        task().await;
        progress.send_modify(|progress| progress.head += 1);
        debug!(queue = %name, progress = ?*progress.borrow(), "task completed");
    }
    debug!(queue = %name, "task queue closed");
}

/// Latest value produced by a reload submitted through a [`TaskQueue`].
#[derive(Debug)]
pub struct ReloadSlot<T> {
    value: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for ReloadSlot<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> Default for ReloadSlot<T> {
    fn default() -> Self {
        Self {
            value: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T: Clone + Send + 'static> ReloadSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<T> {
        match self.value.lock() {
            Ok(value) => value.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, next: T) {
        match self.value.lock() {
            Ok(mut value) => *value = Some(next),
            Err(poisoned) => *poisoned.into_inner() = Some(next),
        }
    }

    /// Queues `fetch`; on success its value replaces the slot contents. A
    /// failure is logged and the previous value stays visible.
    pub fn reload<Fut, E>(&self, queue: &TaskQueue, fetch: Fut)
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let slot = self.clone();
        queue.enqueue(move || async move {
            match fetch.await {
                Ok(value) => slot.set(value),
                Err(err) => warn!(error = %err, "reload failed; keeping previous data"),
            }
        });
    }
}
