//! Shift planning: which shifts exist on each upcoming day, and the weekday
//! defaults new weeks are created from.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError};
use crate::fifo::{ReloadSlot, TaskQueue};
use crate::reorder::reorder_list;
use crate::types::{DayShift, ShiftRow, Weekday, Workplace, WorkplaceSettings};

/// Backend calls the planner needs.
pub trait PlanStore: Send + Sync + 'static {
    fn shifts_from(
        &self,
        from: NaiveDate,
    ) -> impl Future<Output = Result<Vec<ShiftRow>, ApiError>> + Send;

    fn save_days(
        &self,
        modified_days: &BTreeMap<String, Vec<DayShift>>,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn workplace(&self) -> impl Future<Output = Result<Workplace, ApiError>> + Send;

    fn save_workplace(
        &self,
        workplace: &Workplace,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

impl PlanStore for ApiClient {
    fn shifts_from(
        &self,
        from: NaiveDate,
    ) -> impl Future<Output = Result<Vec<ShiftRow>, ApiError>> + Send {
        self.list_shifts_from(from)
    }

    fn save_days(
        &self,
        modified_days: &BTreeMap<String, Vec<DayShift>>,
    ) -> impl Future<Output = Result<(), ApiError>> + Send {
        self.save_shift_days(modified_days)
    }

    fn workplace(&self) -> impl Future<Output = Result<Workplace, ApiError>> + Send {
        self.get_workplace()
    }

    fn save_workplace(
        &self,
        workplace: &Workplace,
    ) -> impl Future<Output = Result<(), ApiError>> + Send {
        ApiClient::save_workplace(self, workplace)
    }
}

pub fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanDay {
    pub date: String,
    pub shifts: Vec<DayShift>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanWeek {
    pub monday: NaiveDate,
    pub days: Vec<PlanDay>,
}

/// Groups date-ordered shifts into weeks starting on Monday and then into
/// days. Rows with an unparseable date are skipped.
pub fn group_into_weeks(shifts: &[ShiftRow]) -> Vec<PlanWeek> {
    let mut weeks: Vec<PlanWeek> = Vec::new();
    for row in shifts {
        let Ok(date) = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d") else {
            warn!(date = %row.date, slug = %row.slug, "skipping shift with malformed date");
            continue;
        };
        let monday = monday_of(date);
        if weeks.last().is_none_or(|week| week.monday != monday) {
            weeks.push(PlanWeek {
                monday,
                days: Vec::new(),
            });
        }
        let Some(week) = weeks.last_mut() else {
            continue;
        };
        if week.days.last().is_none_or(|day| day.date != row.date) {
            week.days.push(PlanDay {
                date: row.date.clone(),
                shifts: Vec::new(),
            });
        }
        if let Some(day) = week.days.last_mut() {
            day.shifts.push(DayShift {
                id: row.id,
                name: row.name.clone(),
                worker_count: Some(row.workers.len() as u32),
            });
        }
    }
    weeks
}

/// Edits to one day's shift list. Each method returns the new list, or `None`
/// when the edit is not allowed or would change nothing.
#[derive(Debug, Clone, Copy)]
pub struct DayEdit<'a> {
    shifts: &'a [DayShift],
    default_empty: bool,
}

impl<'a> DayEdit<'a> {
    /// `default_empty` is whether the weekday default for this day has no
    /// shifts.
    pub fn new(shifts: &'a [DayShift], default_empty: bool) -> Self {
        Self {
            shifts,
            default_empty,
        }
    }

    pub fn rename(&self, index: usize, name: &str) -> Option<Vec<DayShift>> {
        let name = name.trim();
        let current = self.shifts.get(index)?;
        if name.is_empty() || current.name == name {
            return None;
        }
        let mut next = self.shifts.to_vec();
        next[index].name = name.to_string();
        Some(next)
    }

    pub fn append(&self, name: &str) -> Option<Vec<DayShift>> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let mut next = self.shifts.to_vec();
        next.push(DayShift {
            id: None,
            name: name.to_string(),
            worker_count: None,
        });
        Some(next)
    }

    /// A shift with workers is never removable. Otherwise the day must keep
    /// another shift, unless its weekday default is empty.
    pub fn can_remove(&self, index: usize) -> bool {
        let Some(shift) = self.shifts.get(index) else {
            return false;
        };
        shift.worker_count.unwrap_or(0) == 0 && (self.shifts.len() > 1 || self.default_empty)
    }

    pub fn remove(&self, index: usize) -> Option<Vec<DayShift>> {
        if !self.can_remove(index) {
            return None;
        }
        let mut next = self.shifts.to_vec();
        next.remove(index);
        Some(next)
    }

    pub fn reorder(&self, from: usize, to: usize) -> Option<Vec<DayShift>> {
        reorder_list(self.shifts, from, to)
    }
}

/// Whether the weekday default for `date` has no shifts.
pub fn default_is_empty(settings: &WorkplaceSettings, date: NaiveDate) -> bool {
    settings
        .weekday_defaults
        .get(&Weekday::of(date))
        .is_none_or(|day| day.shifts.is_empty())
}

#[derive(Debug, Default)]
struct DraftState<T> {
    pending: T,
    modified: bool,
    saving: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Day edits staged locally until saved together.
pub struct PlanDraft<P> {
    store: Arc<P>,
    queue: TaskQueue,
    from: NaiveDate,
    shifts: ReloadSlot<Vec<ShiftRow>>,
    state: Arc<Mutex<DraftState<BTreeMap<String, Vec<DayShift>>>>>,
}

impl<P: PlanStore> PlanDraft<P> {
    /// Plans the weeks from the Monday of `from` onwards.
    pub fn new(store: Arc<P>, queue: TaskQueue, from: NaiveDate) -> Self {
        Self {
            store,
            queue,
            from: monday_of(from),
            shifts: ReloadSlot::new(),
            state: Arc::new(Mutex::new(DraftState::default())),
        }
    }

    pub fn from_date(&self) -> NaiveDate {
        self.from
    }

    pub fn load(&self) {
        let store = Arc::clone(&self.store);
        let from = self.from;
        self.shifts
            .reload(&self.queue, async move { store.shifts_from(from).await });
    }

    pub fn is_loaded(&self) -> bool {
        self.shifts.get().is_some()
    }

    /// Server rows grouped into weeks with staged days laid over them.
    pub fn weeks(&self) -> Vec<PlanWeek> {
        let mut weeks = group_into_weeks(&self.shifts.get().unwrap_or_default());
        let state = lock(&self.state);
        for day in weeks.iter_mut().flat_map(|week| week.days.iter_mut()) {
            if let Some(staged) = state.pending.get(&day.date) {
                day.shifts.clone_from(staged);
            }
        }
        weeks
    }

    pub fn day(&self, date: &str) -> Option<PlanDay> {
        self.weeks()
            .into_iter()
            .flat_map(|week| week.days)
            .find(|day| day.date == date)
    }

    /// Stages `shifts` for `date`. Ignored while a save is in flight.
    pub fn stage(&self, date: &str, shifts: Vec<DayShift>) -> bool {
        let mut state = lock(&self.state);
        if state.saving {
            debug!(date, "ignoring day edit while saving");
            return false;
        }
        state.pending.insert(date.to_string(), shifts);
        state.modified = true;
        true
    }

    pub fn modified_days(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn is_saving(&self) -> bool {
        lock(&self.state).saving
    }

    /// Queues a save of every staged day followed by a reload. Returns `None`
    /// if nothing is staged or a save is already running. Staged days are kept
    /// when the save fails.
    pub fn save(&self) -> Option<oneshot::Receiver<Result<(), ApiError>>> {
        let modified_days = {
            let mut state = lock(&self.state);
            if state.saving || state.pending.is_empty() {
                return None;
            }
            state.saving = true;
            state.pending.clone()
        };

        let store = Arc::clone(&self.store);
        let slot = self.shifts.clone();
        let state = Arc::clone(&self.state);
        let from = self.from;
        Some(self.queue.submit(move || async move {
            let result = store.save_days(&modified_days).await;
            match &result {
                Ok(()) => {
                    info!(days = modified_days.len(), "shift plan saved");
                    match store.shifts_from(from).await {
                        Ok(rows) => slot.set(rows),
                        Err(err) => warn!(error = %err, "failed to reload shift plan"),
                    }
                    let mut state = lock(&state);
                    state.pending.clear();
                    state.modified = false;
                    state.saving = false;
                }
                Err(err) => {
                    warn!(error = %err, "failed to save shift plan");
                    lock(&state).saving = false;
                }
            }
            result
        }))
    }
}

/// Weekday defaults edited as one unit and saved with the workplace.
pub struct DefaultsEditor<P> {
    store: Arc<P>,
    queue: TaskQueue,
    workplace: ReloadSlot<Workplace>,
    state: Arc<Mutex<DraftState<Option<WorkplaceSettings>>>>,
}

impl<P: PlanStore> DefaultsEditor<P> {
    pub fn new(store: Arc<P>, queue: TaskQueue) -> Self {
        Self {
            store,
            queue,
            workplace: ReloadSlot::new(),
            state: Arc::new(Mutex::new(DraftState::default())),
        }
    }

    pub fn load(&self) {
        let store = Arc::clone(&self.store);
        self.workplace
            .reload(&self.queue, async move { store.workplace().await });
    }

    pub fn workplace(&self) -> Option<Workplace> {
        self.workplace.get()
    }

    /// Staged settings if modified, otherwise the loaded ones.
    pub fn settings(&self) -> WorkplaceSettings {
        let state = lock(&self.state);
        if state.modified
            && let Some(pending) = &state.pending
        {
            return pending.clone();
        }
        self.workplace
            .get()
            .map(|workplace| workplace.settings)
            .unwrap_or_default()
    }

    /// Replaces the shift names for `day`. Ignored while saving.
    pub fn set_day(&self, day: Weekday, shifts: Vec<String>) -> bool {
        let mut settings = self.settings();
        settings.weekday_defaults.entry(day).or_default().shifts = shifts;

        let mut state = lock(&self.state);
        if state.saving {
            debug!(day = day.as_str(), "ignoring default edit while saving");
            return false;
        }
        state.pending = Some(settings);
        state.modified = true;
        true
    }

    pub fn is_modified(&self) -> bool {
        lock(&self.state).modified
    }

    /// Queues a workplace save with the staged settings, reloading the
    /// workplace on success.
    pub fn save(&self) -> Option<oneshot::Receiver<Result<(), ApiError>>> {
        let workplace = self.workplace.get()?;
        let settings = {
            let mut state = lock(&self.state);
            if state.saving || !state.modified {
                return None;
            }
            let settings = state.pending.clone()?;
            state.saving = true;
            settings
        };

        let store = Arc::clone(&self.store);
        let slot = self.workplace.clone();
        let state = Arc::clone(&self.state);
        Some(self.queue.submit(move || async move {
            let updated = Workplace {
                settings,
                ..workplace
            };
            let result = store.save_workplace(&updated).await;
            match &result {
                Ok(()) => {
                    info!(workplace = updated.id, "weekday defaults saved");
                    match store.workplace().await {
                        Ok(fresh) => slot.set(fresh),
                        Err(err) => warn!(error = %err, "failed to reload workplace"),
                    }
                    let mut state = lock(&state);
                    state.pending = None;
                    state.modified = false;
                    state.saving = false;
                }
                Err(err) => {
                    warn!(error = %err, "failed to save weekday defaults");
                    lock(&state).saving = false;
                }
            }
            result
        }))
    }
}
