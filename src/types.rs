use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// ISO `(year, week)` pair identifying one page of the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WeekIndex {
    year: i32,
    week: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid week index `{0}` (expected YYYYwW)")]
pub struct ParseWeekError(pub String);

impl WeekIndex {
    pub fn new(year: i32, week: u32) -> Option<Self> {
        NaiveDate::from_isoywd_opt(year, week, chrono::Weekday::Mon)?;
        Some(Self { year, week })
    }

    pub fn containing(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn current() -> Self {
        Self::containing(Local::now().date_naive())
    }

    pub fn year(self) -> i32 {
        self.year
    }

    pub fn week(self) -> u32 {
        self.week
    }

    pub fn monday(self) -> NaiveDate {
        NaiveDate::from_isoywd_opt(self.year, self.week, chrono::Weekday::Mon)
            .expect("week index validated on construction")
    }
}

impl fmt::Display for WeekIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}w{}", self.year, self.week)
    }
}

impl FromStr for WeekIndex {
    type Err = ParseWeekError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let invalid = || ParseWeekError(trimmed.to_string());
        let (year, week) = trimmed
            .split_once(['w', 'W'])
            .ok_or_else(invalid)?;
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let week = week.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, week).ok_or_else(invalid)
    }
}

impl TryFrom<String> for WeekIndex {
    type Error = ParseWeekError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WeekIndex> for String {
    fn from(value: WeekIndex) -> Self {
        value.to_string()
    }
}

/// The `{rows: [...]}` envelope used by list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rows<T> {
    #[serde(default = "Vec::new")]
    pub rows: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Worker {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub login_secret: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub note: String,
}

fn default_true() -> bool {
    true
}

/// Worker as embedded in a shift's assignment list.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkerRef {
    pub id: u64,
    pub name: String,
}

impl From<&Worker> for WorkerRef {
    fn from(worker: &Worker) -> Self {
        Self {
            id: worker.id,
            name: worker.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewWorker {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ShiftSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_starts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_deadline: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ShiftRow {
    #[serde(default)]
    pub id: Option<u64>,
    pub date: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub workers: Vec<WorkerRef>,
    #[serde(default)]
    pub settings: ShiftSettings,
}

impl ShiftRow {
    pub fn key(&self) -> ShiftKey {
        ShiftKey {
            date: self.date.clone(),
            slug: self.slug.clone(),
        }
    }
}

/// A shift as edited in the day planner. New shifts have no `id` yet.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DayShift {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    #[serde(
        default,
        rename = "workerCount",
        skip_serializing_if = "Option::is_none"
    )]
    pub worker_count: Option<u32>,
}

/// Identifies one shift by `(date, slug)`, as in `/api/v0/shift/{date}/{slug}/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShiftKey {
    pub date: String,
    pub slug: String,
}

impl fmt::Display for ShiftKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.date, self.slug)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Weekday::Monday => "monday",
            Weekday::Tuesday => "tuesday",
            Weekday::Wednesday => "wednesday",
            Weekday::Thursday => "thursday",
            Weekday::Friday => "friday",
            Weekday::Saturday => "saturday",
            Weekday::Sunday => "sunday",
        }
    }

    pub fn of(date: NaiveDate) -> Self {
        Self::ALL[date.weekday().num_days_from_monday() as usize]
    }
}

impl FromStr for Weekday {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|day| day.as_str() == normalized || day.as_str()[..3] == normalized)
            .ok_or(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DaySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_starts: Option<String>,
    #[serde(default)]
    pub registration_deadline: String,
    #[serde(default)]
    pub shifts: Vec<String>,
}

/// Workplace settings blob. Keys this client does not know are preserved in
/// `extra` so a save never drops them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkplaceSettings {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub weekday_defaults: BTreeMap<Weekday, DaySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_view_day: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_of_the_day: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_header_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_print_per_shift: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workplace {
    pub id: u64,
    #[serde(default)]
    pub settings: WorkplaceSettings,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkerStatsEntry {
    pub isoyear: i32,
    pub isoweek: u32,
    pub year: i32,
    pub month: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkerStats {
    pub id: u64,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub stats: Vec<WorkerStatsEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangelogEntry {
    /// Unix seconds.
    pub time: f64,
    #[serde(default)]
    pub worker_id: Option<u64>,
    #[serde(default)]
    pub user_id: Option<u64>,
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Counters reported by `/api/v0/shift_delete/`.
pub type RetentionStatus = Map<String, Value>;
