//! Worker roster: lookup by id, per-row edits, login links and bulk import.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::api::{ApiClient, ApiError};
use crate::types::{NewWorker, Worker};

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9]{8,15}$").expect("valid phone regex"));

/// Workers keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerDirectory {
    workers: BTreeMap<u64, Worker>,
}

impl WorkerDirectory {
    pub fn from_rows(rows: Vec<Worker>) -> Self {
        Self {
            workers: rows.into_iter().map(|worker| (worker.id, worker)).collect(),
        }
    }

    pub fn get(&self, id: u64) -> Option<&Worker> {
        self.workers.get(&id)
    }

    pub fn name_of(&self, id: u64) -> Option<&str> {
        self.get(id).map(|worker| worker.name.as_str())
    }

    pub fn all(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn active(&self) -> impl Iterator<Item = &Worker> {
        self.all().filter(|worker| worker.active)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Saves `patch` for worker `id` if it differs from the stored row.
    /// Returns whether a request was made.
    pub async fn save(
        &mut self,
        client: &ApiClient,
        id: u64,
        patch: WorkerPatch,
    ) -> Result<bool, WorkerError> {
        let current = self.get(id).ok_or(WorkerError::UnknownWorker(id))?;
        if !patch.is_edited(current) {
            debug!(id, "worker unchanged; skipping save");
            return Ok(false);
        }

        client.update_worker(id, &patch).await?;
        if let Some(worker) = self.workers.get_mut(&id) {
            patch.apply(worker);
        }
        info!(id, "worker saved");
        Ok(true)
    }

    /// Validates `text` as a bulk import and creates the workers. Nothing is
    /// sent when any row is rejected.
    pub async fn import(&self, client: &ApiClient, text: &str) -> Result<usize, WorkerError> {
        let rows = parse_import(text);
        let problems = validate_import(self, &rows);
        if !problems.is_empty() {
            return Err(WorkerError::InvalidImport(problems));
        }

        let workers = rows.into_iter().map(|row| row.worker).collect::<Vec<_>>();
        client.create_workers(&workers).await?;
        info!(count = workers.len(), "workers imported");
        Ok(workers.len())
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("unknown worker {0}")]
    UnknownWorker(u64),
    #[error("import rejected: {}", .0.join("; "))]
    InvalidImport(Vec<String>),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Editable fields of a worker row, as POSTed to `/api/v0/worker/{id}/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerPatch {
    pub name: String,
    pub phone: Option<String>,
    pub note: String,
    pub active: bool,
}

impl WorkerPatch {
    pub fn from_worker(worker: &Worker) -> Self {
        Self {
            name: worker.name.clone(),
            phone: worker.phone.clone(),
            note: worker.note.clone(),
            active: worker.active,
        }
    }

    pub fn is_edited(&self, original: &Worker) -> bool {
        *self != Self::from_worker(original)
    }

    fn apply(&self, worker: &mut Worker) {
        worker.name.clone_from(&self.name);
        worker.phone.clone_from(&self.phone);
        worker.note.clone_from(&self.note);
        worker.active = self.active;
    }
}

/// `{base}/login/#phone=…&password=…`, or `None` for workers without a login
/// secret.
pub fn login_link(base_url: &str, worker: &Worker) -> Option<String> {
    let secret = worker.login_secret.as_deref()?;
    let phone = worker.phone.as_deref().unwrap_or_default();
    Some(format!(
        "{}/login/#phone={}&password={}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(phone),
        urlencoding::encode(secret)
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    /// 1-based line in the pasted text.
    pub line: usize,
    pub worker: NewWorker,
}

/// Parses one worker per line as `name[,phone[,email]]`. Fields may be
/// separated by tab, `;` or `,`. A first line starting with `name` or `navn`
/// is treated as a header.
pub fn parse_import(text: &str) -> Vec<ImportRow> {
    let mut rows = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let separator = ['\t', ';', ',']
            .into_iter()
            .find(|sep| line.contains(*sep));
        let fields: Vec<&str> = match separator {
            Some(sep) => line.split(sep).map(str::trim).collect(),
            None => vec![line.trim()],
        };

        if i == 0 && matches!(fields[0].to_lowercase().as_str(), "name" | "navn") {
            continue;
        }

        let optional = |index: usize| {
            fields
                .get(index)
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string())
        };
        rows.push(ImportRow {
            line: i + 1,
            worker: NewWorker {
                name: fields[0].to_string(),
                phone: optional(1),
                email: optional(2),
            },
        });
    }
    rows
}

fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| !c.is_whitespace()).collect()
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Problems that block the import, one message per offending field.
pub fn validate_import(directory: &WorkerDirectory, rows: &[ImportRow]) -> Vec<String> {
    let existing_names = directory
        .all()
        .map(|worker| normalize_name(&worker.name))
        .collect::<Vec<_>>();
    let existing_phones = directory
        .all()
        .filter_map(|worker| worker.phone.as_deref())
        .map(normalize_phone)
        .filter(|phone| !phone.is_empty())
        .collect::<Vec<_>>();

    let mut seen_names: HashMap<String, usize> = HashMap::new();
    let mut seen_phones: HashMap<String, usize> = HashMap::new();
    let mut problems = Vec::new();

    for row in rows {
        let worker = &row.worker;
        let name = normalize_name(&worker.name);
        if name.is_empty() {
            problems.push(format!("line {}: name is empty", row.line));
        } else if existing_names.contains(&name) {
            problems.push(format!(
                "line {}: a worker named `{}` already exists",
                row.line, worker.name
            ));
        } else if let Some(first) = seen_names.insert(name, row.line) {
            problems.push(format!(
                "line {}: name `{}` repeats line {first}",
                row.line, worker.name
            ));
        }

        if let Some(phone) = worker.phone.as_deref() {
            let normalized = normalize_phone(phone);
            if !PHONE_RE.is_match(&normalized) {
                problems.push(format!("line {}: malformed phone `{phone}`", row.line));
            } else if existing_phones.contains(&normalized) {
                problems.push(format!(
                    "line {}: phone `{phone}` already belongs to a worker",
                    row.line
                ));
            } else if let Some(first) = seen_phones.insert(normalized, row.line) {
                problems.push(format!(
                    "line {}: phone `{phone}` repeats line {first}",
                    row.line
                ));
            }
        }

        if let Some(email) = worker.email.as_deref()
            && !email.contains('@')
        {
            problems.push(format!("line {}: malformed email `{email}`", row.line));
        }
    }

    problems
}
