//! Week window over the schedule: one displayed page, a pending relative
//! offset, and a walk that resolves the offset by following server cursors.

mod cache;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, warn};

pub use cache::{Cursors, PageCache};

use crate::api::{ApiClient, ApiError, WeekPage};
use crate::types::{ShiftRow, WeekIndex};

/// Where week pages come from.
pub trait PageSource: Send + Sync + 'static {
    fn fetch_page(
        &self,
        index: WeekIndex,
    ) -> impl Future<Output = Result<WeekPage, ApiError>> + Send;
}

impl PageSource for ApiClient {
    fn fetch_page(
        &self,
        index: WeekIndex,
    ) -> impl Future<Output = Result<WeekPage, ApiError>> + Send {
        self.fetch_week(index)
    }
}

impl<S: PageSource> PageSource for Arc<S> {
    fn fetch_page(
        &self,
        index: WeekIndex,
    ) -> impl Future<Output = Result<WeekPage, ApiError>> + Send {
        S::fetch_page(self, index)
    }
}

/// Target of the window: `offset` pages away from `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPosition {
    pub index: WeekIndex,
    pub offset: i64,
}

/// Which week and which refresh generation the displayed rows reflect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedMarker {
    pub index: WeekIndex,
    pub refresh: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowPhase {
    Idle,
    Resolving,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSnapshot {
    pub position: WindowPosition,
    pub loaded: Option<LoadedMarker>,
    pub refresh_generation: u64,
    pub phase: WindowPhase,
    pub rows: Vec<ShiftRow>,
    /// Bumped on every change to `rows`.
    pub revision: u64,
}

impl WindowSnapshot {
    pub fn displayed(&self) -> Option<WeekIndex> {
        self.loaded.map(|marker| marker.index)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.phase {
            WindowPhase::Error(message) => Some(message),
            _ => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        if self.phase != WindowPhase::Idle {
            return true;
        }
        match self.loaded {
            None => true,
            Some(marker) => {
                marker.index != self.position.index
                    || self.position.offset != 0
                    || marker.refresh != self.refresh_generation
            }
        }
    }
}

struct WindowInner {
    position: WindowPosition,
    loaded: Option<LoadedMarker>,
    refresh_generation: u64,
    attempt: u64,
    phase: WindowPhase,
    rows: Vec<ShiftRow>,
    revision: u64,
    cache: PageCache,
}

struct Shared<S> {
    source: S,
    inner: Mutex<WindowInner>,
    walk_gate: tokio::sync::Mutex<()>,
    changes: watch::Sender<u64>,
}

pub struct WindowLoader<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for WindowLoader<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: PageSource> WindowLoader<S> {
    pub fn new(source: S, start: WeekIndex) -> Self {
        let (changes, _) = watch::channel(0);
        let inner = WindowInner {
            position: WindowPosition {
                index: start,
                offset: 0,
            },
            loaded: None,
            refresh_generation: 0,
            attempt: 0,
            phase: WindowPhase::Idle,
            rows: Vec::new(),
            revision: 0,
            cache: PageCache::default(),
        };

        Self {
            shared: Arc::new(Shared {
                source,
                inner: Mutex::new(inner),
                walk_gate: tokio::sync::Mutex::new(()),
                changes,
            }),
        }
    }

    /// Resolves the current position without moving it.
    pub fn load(&self) {
        self.restart(|_| {});
    }

    /// Moves the target `delta` pages; returns immediately.
    pub fn navigate(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        self.restart(|inner| {
            inner.position.offset = inner.position.offset.saturating_add(delta);
        });
    }

    /// Marks the displayed page stale and refetches it.
    pub fn refresh(&self) {
        self.restart(|inner| {
            inner.refresh_generation += 1;
            if let Some(marker) = inner.loaded {
                inner.cache.mark_stale(marker.index);
            }
        });
    }

    fn restart(&self, adjust: impl FnOnce(&mut WindowInner)) {
        let attempt = {
            let mut inner = self.shared.lock();
            adjust(&mut inner);
            inner.attempt += 1;
            inner.phase = WindowPhase::Resolving;
            inner.attempt
        };
        self.shared.notify();
        tokio::spawn(resolve(Arc::clone(&self.shared), attempt));
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        let inner = self.shared.lock();
        WindowSnapshot {
            position: inner.position,
            loaded: inner.loaded,
            refresh_generation: inner.refresh_generation,
            phase: inner.phase.clone(),
            rows: inner.rows.clone(),
            revision: inner.revision,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.snapshot().is_stale()
    }

    pub fn phase(&self) -> WindowPhase {
        self.shared.lock().phase.clone()
    }

    /// Path reflecting the current week, e.g. `/admin/s/2022w5/`.
    pub fn admin_path(&self) -> String {
        format!("/admin/s/{}/", self.shared.lock().position.index)
    }

    /// Applies an optimistic edit to the displayed rows and to the cached copy
    /// of the displayed page.
    pub fn update_rows(&self, edit: impl FnOnce(&mut Vec<ShiftRow>)) {
        {
            let mut guard = self.shared.lock();
            let inner = &mut *guard;
            edit(&mut inner.rows);
            if let Some(marker) = inner.loaded
                && let Some(cached) = inner.cache.rows_mut(marker.index)
            {
                cached.clone_from(&inner.rows);
            }
            inner.revision += 1;
        }
        self.shared.notify();
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// Waits until no walk is in progress and returns the resulting state.
    pub async fn settled(&self) -> WindowSnapshot {
        let mut changes = self.subscribe();
        loop {
            let snapshot = self.snapshot();
            if snapshot.phase != WindowPhase::Resolving {
                return snapshot;
            }
            if changes.changed().await.is_err() {
                return self.snapshot();
            }
        }
    }
}

impl<S> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, WindowInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Position and refresh generation to resolve, unless `attempt` was
    /// superseded while waiting for the gate.
    fn begin(&self, attempt: u64) -> Option<(WeekIndex, i64, u64)> {
        let inner = self.lock();
        (inner.attempt == attempt).then_some((
            inner.position.index,
            inner.position.offset,
            inner.refresh_generation,
        ))
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.lock().attempt == attempt
    }

    fn commit(&self, attempt: u64, index: WeekIndex, refresh: u64, rows: Vec<ShiftRow>) {
        {
            let mut inner = self.lock();
            if inner.attempt != attempt {
                debug!(attempt, %index, "discarding superseded week window result");
                return;
            }
            inner.rows = rows;
            inner.loaded = Some(LoadedMarker { index, refresh });
            inner.position = WindowPosition { index, offset: 0 };
            inner.phase = WindowPhase::Idle;
            inner.revision += 1;
        }
        debug!(attempt, %index, refresh, "week window committed");
        self.notify();
    }

    fn fail(&self, attempt: u64, index: WeekIndex, err: &ApiError) {
        {
            let mut inner = self.lock();
            if inner.attempt != attempt {
                return;
            }
            inner.phase = WindowPhase::Error(err.to_string());
        }
        warn!(attempt, %index, error = %err, "failed to load week");
        self.notify();
    }
}

impl<S: PageSource> Shared<S> {
    /// Fetches `index` and records it in the cache, even when the walk that
    /// asked for it has been superseded.
    async fn fetch(&self, index: WeekIndex) -> Result<WeekPage, ApiError> {
        let page = self.source.fetch_page(index).await?;
        self.lock().cache.record(index, &page);
        Ok(page)
    }
}

async fn resolve<S: PageSource>(shared: Arc<Shared<S>>, attempt: u64) {
    let _gate = shared.walk_gate.lock().await;
    let Some((mut index, mut remaining, refresh)) = shared.begin(attempt) else {
        return;
    };
    debug!(attempt, from = %index, offset = remaining, "resolving week window");

    while remaining != 0 {
        let cached = {
            let inner = shared.lock();
            if inner.attempt != attempt {
                return;
            }
            inner.cache.cursors(index)
        };
        let cursors = match cached {
            Some(cursors) => cursors,
            None => {
                if let Err(err) = shared.fetch(index).await {
                    shared.fail(attempt, index, &err);
                    return;
                }
                shared.lock().cache.cursors(index).unwrap_or_default()
            }
        };

        let forward = remaining > 0;
        let Some(step) = cursors.toward(forward) else {
            debug!(%index, forward, "no adjacent week; stopping at boundary");
            break;
        };
        index = step;
        remaining -= remaining.signum();
    }

    let cached_rows = {
        let inner = shared.lock();
        if inner.attempt != attempt {
            return;
        }
        inner.cache.fresh_rows(index).map(<[ShiftRow]>::to_vec)
    };
    let rows = match cached_rows {
        Some(rows) => rows,
        None => match shared.fetch(index).await {
            Ok(page) => page.rows,
            Err(err) => {
                shared.fail(attempt, index, &err);
                return;
            }
        },
    };

    if shared.is_current(attempt) {
        shared.commit(attempt, index, refresh, rows);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn week(raw: &str) -> WeekIndex {
        raw.parse().expect("valid week")
    }

    fn row_for(index: WeekIndex) -> ShiftRow {
        ShiftRow {
            id: None,
            date: index.monday().format("%Y-%m-%d").to_string(),
            slug: "dv".to_string(),
            name: format!("DV {index}"),
            order: 1,
            workers: Vec::new(),
            settings: Default::default(),
        }
    }

    struct FakeSource {
        pages: Mutex<HashMap<WeekIndex, Result<WeekPage, u16>>>,
        calls: Mutex<Vec<WeekIndex>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl FakeSource {
        /// Weeks 1..=10 of 2022 linked in order, except that week 8 is
        /// skipped by the server's cursors.
        fn chain(delay: Duration) -> Arc<Self> {
            let weeks = [1, 2, 3, 4, 5, 6, 7, 9, 10]
                .into_iter()
                .map(|w| WeekIndex::new(2022, w).expect("valid week"))
                .collect::<Vec<_>>();
            let mut pages = HashMap::new();
            for (i, index) in weeks.iter().enumerate() {
                let page = WeekPage {
                    rows: vec![row_for(*index)],
                    next: weeks.get(i + 1).copied(),
                    prev: i.checked_sub(1).map(|prev| weeks[prev]),
                };
                pages.insert(*index, Ok(page));
            }

            Arc::new(Self {
                pages: Mutex::new(pages),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            })
        }

        fn fail_with(&self, index: WeekIndex, status: u16) {
            self.pages
                .lock()
                .expect("pages lock")
                .insert(index, Err(status));
        }

        fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .expect("calls lock")
                .iter()
                .map(ToString::to_string)
                .collect()
        }
    }

    impl PageSource for FakeSource {
        fn fetch_page(
            &self,
            index: WeekIndex,
        ) -> impl Future<Output = Result<WeekPage, ApiError>> + Send {
            async move {
                self.calls.lock().expect("calls lock").push(index);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                let page = self.pages.lock().expect("pages lock").get(&index).cloned();
                match page {
                    Some(Ok(page)) => Ok(page),
                    Some(Err(status)) => Err(ApiError::Http { status }),
                    None => Err(ApiError::Http { status: 404 }),
                }
            }
        }
    }

    async fn loaded_at(source: &Arc<FakeSource>, start: &str) -> WindowLoader<Arc<FakeSource>> {
        let loader = WindowLoader::new(Arc::clone(source), week(start));
        loader.load();
        let snapshot = loader.settled().await;
        assert_eq!(snapshot.displayed(), Some(week(start)));
        loader
    }

    #[tokio::test]
    async fn initial_load_fetches_the_start_week_once() {
        let source = FakeSource::chain(Duration::ZERO);
        let loader = WindowLoader::new(Arc::clone(&source), week("2022w5"));
        assert!(loader.is_stale());

        loader.load();
        let snapshot = loader.settled().await;

        assert_eq!(snapshot.phase, WindowPhase::Idle);
        assert!(!snapshot.is_stale());
        assert_eq!(snapshot.rows, vec![row_for(week("2022w5"))]);
        assert_eq!(source.calls(), vec!["2022w5"]);
        assert_eq!(loader.admin_path(), "/admin/s/2022w5/");
    }

    #[tokio::test]
    async fn next_week_uses_cached_cursor_without_refetching_current() {
        let source = FakeSource::chain(Duration::ZERO);
        let loader = loaded_at(&source, "2022w5").await;

        loader.navigate(1);
        let snapshot = loader.settled().await;

        assert_eq!(snapshot.displayed(), Some(week("2022w6")));
        assert_eq!(snapshot.position.offset, 0);
        assert_eq!(source.calls(), vec!["2022w5", "2022w6"]);
    }

    #[tokio::test]
    async fn forward_then_back_is_served_from_cache() {
        let source = FakeSource::chain(Duration::ZERO);
        let loader = loaded_at(&source, "2022w5").await;
        loader.navigate(1);
        loader.settled().await;

        loader.navigate(-1);
        let snapshot = loader.settled().await;

        assert_eq!(snapshot.displayed(), Some(week("2022w5")));
        assert_eq!(snapshot.rows, vec![row_for(week("2022w5"))]);
        assert_eq!(source.calls(), vec!["2022w5", "2022w6"]);
    }

    #[tokio::test]
    async fn superseded_walk_never_commits_intermediate_week() {
        let source = FakeSource::chain(Duration::from_millis(30));
        let loader = loaded_at(&source, "2022w5").await;
        let revision_before = loader.snapshot().revision;

        loader.navigate(1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        loader.navigate(1);
        let snapshot = loader.settled().await;

        assert_eq!(snapshot.displayed(), Some(week("2022w7")));
        assert_eq!(snapshot.revision, revision_before + 1);
        assert_eq!(source.calls(), vec!["2022w5", "2022w6", "2022w7"]);
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn superseded_walk_failure_leaves_phase_alone() {
        let source = FakeSource::chain(Duration::from_millis(30));
        let loader = loaded_at(&source, "2022w5").await;
        source.fail_with(week("2022w6"), 500);

        loader.navigate(1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        loader.navigate(-1);
        let snapshot = loader.settled().await;

        assert_eq!(snapshot.phase, WindowPhase::Idle);
        assert_eq!(snapshot.error(), None);
        assert_eq!(snapshot.displayed(), Some(week("2022w5")));
        assert_eq!(source.calls(), vec!["2022w5", "2022w6"]);
    }

    #[tokio::test]
    async fn huge_jumps_saturate_and_stop_at_boundary() {
        let source = FakeSource::chain(Duration::ZERO);
        let loader = loaded_at(&source, "2022w5").await;

        loader.navigate(i64::MAX);
        loader.navigate(1);
        let snapshot = loader.settled().await;

        assert_eq!(snapshot.phase, WindowPhase::Idle);
        assert_eq!(snapshot.displayed(), Some(week("2022w10")));
        assert_eq!(snapshot.position.offset, 0);
    }

    #[tokio::test]
    async fn cursors_are_followed_rather_than_computed() {
        let source = FakeSource::chain(Duration::ZERO);
        let loader = loaded_at(&source, "2022w7").await;

        loader.navigate(1);
        let snapshot = loader.settled().await;

        assert_eq!(snapshot.displayed(), Some(week("2022w9")));
    }

    #[tokio::test]
    async fn multi_page_jump_walks_every_cursor() {
        let source = FakeSource::chain(Duration::ZERO);
        let loader = loaded_at(&source, "2022w2").await;

        loader.navigate(3);
        let snapshot = loader.settled().await;

        assert_eq!(snapshot.displayed(), Some(week("2022w5")));
        assert_eq!(
            source.calls(),
            vec!["2022w2", "2022w3", "2022w4", "2022w5"]
        );
    }

    #[tokio::test]
    async fn failed_fetch_keeps_last_good_page_visible() {
        let source = FakeSource::chain(Duration::ZERO);
        let loader = loaded_at(&source, "2022w5").await;
        source.fail_with(week("2022w6"), 500);

        loader.navigate(1);
        let snapshot = loader.settled().await;

        assert_eq!(snapshot.error(), Some("HTTP 500"));
        assert_eq!(snapshot.displayed(), Some(week("2022w5")));
        assert_eq!(snapshot.rows, vec![row_for(week("2022w5"))]);
        assert!(snapshot.is_stale());
    }

    #[tokio::test]
    async fn refresh_refetches_only_the_current_week() {
        let source = FakeSource::chain(Duration::ZERO);
        let loader = loaded_at(&source, "2022w5").await;
        loader.navigate(1);
        loader.settled().await;
        loader.navigate(-1);
        loader.settled().await;

        loader.refresh();
        let snapshot = loader.settled().await;

        assert_eq!(
            snapshot.loaded,
            Some(LoadedMarker {
                index: week("2022w5"),
                refresh: 1
            })
        );
        assert!(!snapshot.is_stale());
        assert_eq!(source.calls(), vec!["2022w5", "2022w6", "2022w5"]);

        loader.navigate(1);
        loader.settled().await;
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test]
    async fn missing_cursor_stops_at_boundary() {
        let source = FakeSource::chain(Duration::ZERO);
        let loader = loaded_at(&source, "2022w1").await;

        loader.navigate(-1);
        let snapshot = loader.settled().await;

        assert_eq!(snapshot.phase, WindowPhase::Idle);
        assert_eq!(snapshot.displayed(), Some(week("2022w1")));
        assert_eq!(source.calls(), vec!["2022w1"]);
    }

    #[tokio::test]
    async fn optimistic_edit_updates_display_and_cache() {
        let source = FakeSource::chain(Duration::ZERO);
        let loader = loaded_at(&source, "2022w5").await;

        loader.update_rows(|rows| rows[0].name = "edited".to_string());
        loader.navigate(1);
        loader.settled().await;
        loader.navigate(-1);
        let snapshot = loader.settled().await;

        assert_eq!(snapshot.rows[0].name, "edited");
    }
}
