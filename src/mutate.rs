//! Guarded mutate-and-refresh: one mutation at a time against a bound list,
//! with a `loading` flag for the round trip and an optional refresh after it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::oneshot;
use tracing::debug;

use crate::fifo::TaskQueue;
use crate::window::{PageSource, WindowLoader};

/// What a finished mutation asks of its wrapper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationOutcome {
    pub completed: bool,
    pub should_refresh: bool,
}

impl MutationOutcome {
    /// The server accepted the change; reload what is displayed.
    pub fn refresh() -> Self {
        Self {
            completed: true,
            should_refresh: true,
        }
    }

    /// The server accepted the change and the local state already matches.
    pub fn keep() -> Self {
        Self {
            completed: true,
            should_refresh: false,
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }
}

pub trait RefreshTrigger: Send + Sync {
    fn request_refresh(&self);
}

impl<S: PageSource> RefreshTrigger for WindowLoader<S> {
    fn request_refresh(&self) {
        self.refresh();
    }
}

impl<F: Fn() + Send + Sync> RefreshTrigger for F {
    fn request_refresh(&self) {
        self()
    }
}

/// Counts mutations that are queued or in flight.
#[derive(Clone)]
pub struct GuardedMutation {
    loading: Arc<AtomicUsize>,
    trigger: Arc<dyn RefreshTrigger>,
}

impl std::fmt::Debug for GuardedMutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedMutation")
            .field("loading", &self.is_loading())
            .finish_non_exhaustive()
    }
}

struct LoadingGuard(Arc<AtomicUsize>);

impl LoadingGuard {
    fn raise(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GuardedMutation {
    pub fn new(trigger: Arc<dyn RefreshTrigger>) -> Self {
        Self {
            loading: Arc::new(AtomicUsize::new(0)),
            trigger,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst) > 0
    }

    /// Runs `prepare` with the loading flag raised and returns its value. The
    /// flag is lowered before any refresh is requested.
    pub async fn run<F, Fut, T>(&self, prepare: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (T, MutationOutcome)>,
    {
        let guard = LoadingGuard::raise(&self.loading);
        self.finish(guard, prepare).await
    }

    /// Queues the mutation behind everything already on `queue`. The loading
    /// flag is raised immediately, so it also covers the wait for earlier
    /// tasks.
    pub fn submit<F, Fut, T>(&self, queue: &TaskQueue, prepare: F) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = (T, MutationOutcome)> + Send + 'static,
        T: Send + 'static,
    {
        let guard = LoadingGuard::raise(&self.loading);
        let this = self.clone();
        queue.submit(move || async move { this.finish(guard, prepare).await })
    }

    async fn finish<F, Fut, T>(&self, guard: LoadingGuard, prepare: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (T, MutationOutcome)>,
    {
        let (value, outcome) = prepare().await;
        drop(guard);

        debug!(?outcome, "mutation finished");
        if outcome.completed && outcome.should_refresh {
            self.trigger.request_refresh();
        }
        value
    }
}
