//! Editing who works which shift in the displayed week.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::api::{ApiClient, ApiError};
use crate::fifo::TaskQueue;
use crate::mutate::{GuardedMutation, MutationOutcome};
use crate::reorder::reorder_list;
use crate::types::{ShiftKey, ShiftRow, ShiftSettings, Worker, WorkerRef};
use crate::window::{PageSource, WindowLoader};
use crate::workers::WorkerDirectory;

/// Where assignment changes are written.
pub trait RosterStore: Send + Sync + 'static {
    fn set_workers(
        &self,
        shift: &ShiftKey,
        workers: &[WorkerRef],
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

impl RosterStore for ApiClient {
    fn set_workers(
        &self,
        shift: &ShiftKey,
        workers: &[WorkerRef],
    ) -> impl Future<Output = Result<(), ApiError>> + Send {
        self.set_shift_workers(shift, workers)
    }
}

impl<R: RosterStore> RosterStore for Arc<R> {
    fn set_workers(
        &self,
        shift: &ShiftKey,
        workers: &[WorkerRef],
    ) -> impl Future<Output = Result<(), ApiError>> + Send {
        R::set_workers(self, shift, workers)
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("another change is still being saved")]
    Busy,
    #[error("shift {0} is not in the displayed week")]
    UnknownShift(ShiftKey),
}

#[derive(Debug)]
pub enum EditOutcome {
    /// The worker list would not change; nothing was sent.
    Skipped,
    /// The edit was applied locally and its request queued.
    Queued(oneshot::Receiver<Result<(), ApiError>>),
}

pub struct ScheduleEditor<S, R> {
    window: WindowLoader<S>,
    store: Arc<R>,
    queue: TaskQueue,
    mutation: GuardedMutation,
    rollback_on_failure: bool,
}

impl<S: PageSource, R: RosterStore> ScheduleEditor<S, R> {
    pub fn new(window: WindowLoader<S>, store: R, queue: TaskQueue) -> Self {
        let mutation = GuardedMutation::new(Arc::new(window.clone()));
        Self {
            window,
            store: Arc::new(store),
            queue,
            mutation,
            rollback_on_failure: false,
        }
    }

    /// Restore the previous worker list when the server rejects an edit.
    pub fn with_rollback(mut self, rollback_on_failure: bool) -> Self {
        self.rollback_on_failure = rollback_on_failure;
        self
    }

    pub fn window(&self) -> &WindowLoader<S> {
        &self.window
    }

    pub fn is_loading(&self) -> bool {
        self.mutation.is_loading()
    }

    pub fn add_worker(
        &self,
        shift: &ShiftKey,
        worker: WorkerRef,
    ) -> Result<EditOutcome, ScheduleError> {
        self.edit(shift, |workers| {
            if workers.iter().any(|assigned| assigned.id == worker.id) {
                return None;
            }
            let mut next = workers.to_vec();
            next.push(worker);
            Some(next)
        })
    }

    pub fn remove_worker(
        &self,
        shift: &ShiftKey,
        position: usize,
    ) -> Result<EditOutcome, ScheduleError> {
        self.edit(shift, |workers| {
            if position >= workers.len() {
                return None;
            }
            let mut next = workers.to_vec();
            next.remove(position);
            Some(next)
        })
    }

    /// Moves the worker at `from` to just before position `to`.
    pub fn move_worker(
        &self,
        shift: &ShiftKey,
        from: usize,
        to: usize,
    ) -> Result<EditOutcome, ScheduleError> {
        self.edit(shift, |workers| reorder_list(workers, from, to))
    }

    fn edit(
        &self,
        shift: &ShiftKey,
        change: impl FnOnce(&[WorkerRef]) -> Option<Vec<WorkerRef>>,
    ) -> Result<EditOutcome, ScheduleError> {
        if self.mutation.is_loading() {
            return Err(ScheduleError::Busy);
        }

        let snapshot = self.window.snapshot();
        let row = snapshot
            .rows
            .iter()
            .find(|row| row.date == shift.date && row.slug == shift.slug)
            .ok_or_else(|| ScheduleError::UnknownShift(shift.clone()))?;
        let previous = row.workers.clone();
        let Some(next) = change(&previous).filter(|next| *next != previous) else {
            return Ok(EditOutcome::Skipped);
        };

        set_row_workers(&self.window, shift, next.clone());

        let store = Arc::clone(&self.store);
        let window = self.window.clone();
        let rollback = self.rollback_on_failure;
        let key = shift.clone();
        let receiver = self.mutation.submit(&self.queue, move || async move {
            match store.set_workers(&key, &next).await {
                Ok(()) => {
                    info!(shift = %key, workers = next.len(), "shift workers saved");
                    (Ok(()), MutationOutcome::refresh())
                }
                Err(err) => {
                    warn!(shift = %key, error = %err, "failed to save shift workers");
                    if rollback {
                        restore_row_workers(&window, &key, &next, previous);
                    }
                    (Err(err), MutationOutcome::failed())
                }
            }
        });
        Ok(EditOutcome::Queued(receiver))
    }
}

fn set_row_workers<S: PageSource>(window: &WindowLoader<S>, shift: &ShiftKey, workers: Vec<WorkerRef>) {
    window.update_rows(|rows| {
        if let Some(row) = rows
            .iter_mut()
            .find(|row| row.date == shift.date && row.slug == shift.slug)
        {
            row.workers = workers;
        }
    });
}

/// Puts `previous` back, unless the row has changed again since `attempted`
/// was applied.
fn restore_row_workers<S: PageSource>(
    window: &WindowLoader<S>,
    shift: &ShiftKey,
    attempted: &[WorkerRef],
    previous: Vec<WorkerRef>,
) {
    window.update_rows(|rows| {
        if let Some(row) = rows
            .iter_mut()
            .find(|row| row.date == shift.date && row.slug == shift.slug)
            && row.workers == attempted
        {
            row.workers = previous;
        }
    });
}

/// Registration times shared by every shift, if they all agree.
pub fn registration_window(rows: &[ShiftRow]) -> Option<&ShiftSettings> {
    let first = &rows.first()?.settings;
    rows.iter()
        .all(|row| row.settings == *first)
        .then_some(first)
}

/// Rows grouped by date, in the order dates first appear.
pub fn group_by_date(rows: &[ShiftRow]) -> Vec<(&str, Vec<&ShiftRow>)> {
    let mut days: Vec<(&str, Vec<&ShiftRow>)> = Vec::new();
    for row in rows {
        match days.iter_mut().find(|(date, _)| *date == row.date) {
            Some((_, day)) => day.push(row),
            None => days.push((row.date.as_str(), vec![row])),
        }
    }
    days
}

/// Active workers not yet assigned to `row`.
pub fn add_candidates<'a>(directory: &'a WorkerDirectory, row: &ShiftRow) -> Vec<&'a Worker> {
    directory
        .active()
        .filter(|worker| !row.workers.iter().any(|assigned| assigned.id == worker.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::api::WeekPage;
    use crate::types::WeekIndex;

    fn week() -> WeekIndex {
        WeekIndex::new(2022, 5).expect("valid week")
    }

    fn worker_ref(id: u64, name: &str) -> WorkerRef {
        WorkerRef {
            id,
            name: name.to_string(),
        }
    }

    fn shift_row(workers: Vec<WorkerRef>) -> ShiftRow {
        ShiftRow {
            id: Some(1),
            date: "2022-02-01".to_string(),
            slug: "dv".to_string(),
            name: "DV".to_string(),
            order: 1,
            workers,
            settings: ShiftSettings::default(),
        }
    }

    fn key() -> ShiftKey {
        ShiftKey {
            date: "2022-02-01".to_string(),
            slug: "dv".to_string(),
        }
    }

    /// Serves the current server-side rows for one week.
    struct FakeWeek {
        rows: Mutex<Vec<ShiftRow>>,
        fetches: AtomicUsize,
    }

    impl PageSource for FakeWeek {
        fn fetch_page(
            &self,
            _index: WeekIndex,
        ) -> impl Future<Output = Result<WeekPage, ApiError>> + Send {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let rows = self.rows.lock().expect("rows lock").clone();
            async move {
                Ok(WeekPage {
                    rows,
                    next: None,
                    prev: None,
                })
            }
        }
    }

    /// Records posted worker lists; fails with `status` when set.
    struct FakeStore {
        week: Arc<FakeWeek>,
        posts: Mutex<Vec<Vec<WorkerRef>>>,
        status: Option<u16>,
    }

    impl RosterStore for FakeStore {
        fn set_workers(
            &self,
            _shift: &ShiftKey,
            workers: &[WorkerRef],
        ) -> impl Future<Output = Result<(), ApiError>> + Send {
            self.posts.lock().expect("posts lock").push(workers.to_vec());
            let result = match self.status {
                Some(status) => Err(ApiError::Http { status }),
                None => {
                    self.week.rows.lock().expect("rows lock")[0].workers = workers.to_vec();
                    Ok(())
                }
            };
            async move { result }
        }
    }

    async fn editor(
        workers: Vec<WorkerRef>,
        status: Option<u16>,
    ) -> (
        ScheduleEditor<Arc<FakeWeek>, Arc<FakeStore>>,
        Arc<FakeWeek>,
        Arc<FakeStore>,
    ) {
        let week_source = Arc::new(FakeWeek {
            rows: Mutex::new(vec![shift_row(workers)]),
            fetches: AtomicUsize::new(0),
        });
        let store = Arc::new(FakeStore {
            week: Arc::clone(&week_source),
            posts: Mutex::new(Vec::new()),
            status,
        });
        let window = WindowLoader::new(Arc::clone(&week_source), week());
        window.load();
        window.settled().await;
        let editor = ScheduleEditor::new(window, Arc::clone(&store), TaskQueue::new("schedule"));
        (editor, week_source, store)
    }

    async fn finish(outcome: EditOutcome) -> Result<(), ApiError> {
        match outcome {
            EditOutcome::Queued(receiver) => receiver.await.expect("edit result"),
            EditOutcome::Skipped => panic!("edit was skipped"),
        }
    }

    #[tokio::test]
    async fn add_worker_posts_and_refreshes() {
        let (editor, week_source, store) = editor(vec![worker_ref(1, "A")], None).await;

        let outcome = editor
            .add_worker(&key(), worker_ref(2, "B"))
            .expect("edit accepted");
        assert_eq!(editor.window().snapshot().rows[0].workers.len(), 2);
        finish(outcome).await.expect("save succeeds");
        let snapshot = editor.window().settled().await;

        assert_eq!(
            *store.posts.lock().expect("posts lock"),
            vec![vec![worker_ref(1, "A"), worker_ref(2, "B")]]
        );
        assert_eq!(week_source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(snapshot.rows[0].workers.len(), 2);
        assert!(!snapshot.is_stale());
    }

    #[tokio::test]
    async fn unchanged_lists_issue_no_request() {
        let (editor, _week_source, store) =
            editor(vec![worker_ref(1, "A"), worker_ref(2, "B")], None).await;

        assert!(matches!(
            editor.move_worker(&key(), 0, 1),
            Ok(EditOutcome::Skipped)
        ));
        assert!(matches!(
            editor.remove_worker(&key(), 5),
            Ok(EditOutcome::Skipped)
        ));
        assert!(matches!(
            editor.add_worker(&key(), worker_ref(1, "A")),
            Ok(EditOutcome::Skipped)
        ));
        assert!(store.posts.lock().expect("posts lock").is_empty());
    }

    #[tokio::test]
    async fn overlapping_edit_is_rejected_while_loading() {
        let (editor, _week_source, _store) = editor(vec![worker_ref(1, "A")], None).await;

        let first = editor
            .remove_worker(&key(), 0)
            .expect("first edit accepted");
        assert!(matches!(
            editor.add_worker(&key(), worker_ref(2, "B")),
            Err(ScheduleError::Busy)
        ));
        finish(first).await.expect("save succeeds");
        assert!(!editor.is_loading());
    }

    #[tokio::test]
    async fn failure_keeps_optimistic_rows_and_skips_refresh() {
        let (editor, week_source, _store) = editor(vec![worker_ref(1, "A")], Some(500)).await;

        let outcome = editor.remove_worker(&key(), 0).expect("edit accepted");
        let err = finish(outcome).await.expect_err("save fails");

        assert_eq!(err.to_string(), "HTTP 500");
        assert_eq!(week_source.fetches.load(Ordering::SeqCst), 1);
        assert!(editor.window().snapshot().rows[0].workers.is_empty());
    }

    #[tokio::test]
    async fn failure_rolls_back_when_configured() {
        let (editor, _week_source, _store) = editor(vec![worker_ref(1, "A")], Some(400)).await;
        let editor = editor.with_rollback(true);

        let outcome = editor.remove_worker(&key(), 0).expect("edit accepted");
        finish(outcome).await.expect_err("save fails");

        assert_eq!(
            editor.window().snapshot().rows[0].workers,
            vec![worker_ref(1, "A")]
        );
    }

    #[tokio::test]
    async fn unknown_shift_is_an_error() {
        let (editor, _week_source, _store) = editor(Vec::new(), None).await;
        let missing = ShiftKey {
            date: "2022-02-02".to_string(),
            slug: "av".to_string(),
        };

        assert!(matches!(
            editor.add_worker(&missing, worker_ref(1, "A")),
            Err(ScheduleError::UnknownShift(_))
        ));
    }

    #[test]
    fn registration_window_requires_agreement() {
        let mut a = shift_row(Vec::new());
        a.settings.registration_deadline = Some("2022-01-28 18:00".to_string());
        let mut b = a.clone();
        b.slug = "av".to_string();

        assert!(registration_window(&[a.clone(), b.clone()]).is_some());
        b.settings.registration_deadline = None;
        assert!(registration_window(&[a, b]).is_none());
        assert!(registration_window(&[]).is_none());
    }

    #[test]
    fn group_by_date_keeps_first_seen_order() {
        let mut later = shift_row(Vec::new());
        later.date = "2022-02-02".to_string();
        let first = shift_row(Vec::new());
        let mut second = shift_row(Vec::new());
        second.slug = "av".to_string();

        let rows = [later, first, second];
        let days = group_by_date(&rows);

        assert_eq!(days.len(), 2);
        assert_eq!(days[0].0, "2022-02-02");
        assert_eq!(days[1].1.len(), 2);
    }

    #[test]
    fn candidates_exclude_assigned_and_inactive_workers() {
        let make = |id: u64, active: bool| Worker {
            id,
            name: format!("W{id}"),
            phone: None,
            email: None,
            login_secret: None,
            active,
            note: String::new(),
        };
        let directory = WorkerDirectory::from_rows(vec![make(1, true), make(2, true), make(3, false)]);
        let row = shift_row(vec![worker_ref(1, "W1")]);

        let ids = add_candidates(&directory, &row)
            .into_iter()
            .map(|worker| worker.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2]);
    }
}
