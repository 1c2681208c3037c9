//! Audit log rendering.

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;

use crate::api::ApiClient;
use crate::fifo::{ReloadSlot, TaskQueue};
use crate::types::ChangelogEntry;
use crate::workers::WorkerDirectory;

pub const MAX_ROWS: usize = 1000;
pub const DATA_PREVIEW_CHARS: usize = 50;

pub fn kind_label(kind: &str) -> &str {
    match kind {
        "register" => "Register",
        "unregister" => "Unregister",
        "worker_login" => "Log in",
        "comment" => "Comment",
        "edit_worker" => "(Admin) Edit worker",
        "edit" => "(Admin) Edit schedule",
        "import_workers" => "(Admin) Import workers",
        "edit_workplace_settings" => "(Admin) Edit settings",
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangelogLine {
    pub time: String,
    pub worker: String,
    pub user: String,
    pub kind: String,
    /// `data` as JSON with worker ids replaced by names, cut to
    /// [`DATA_PREVIEW_CHARS`].
    pub summary: String,
    pub data: String,
}

fn id_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.parse().ok(),
        _ => None,
    }
}

/// Whole seconds rounded toward negative infinity and the non-negative
/// nanosecond remainder.
fn split_timestamp(seconds: f64) -> (i64, u32) {
    let whole = seconds.div_euclid(1.0) as i64;
    let nanos = (seconds.rem_euclid(1.0) * 1e9) as u32;
    (whole, nanos.min(999_999_999))
}

fn format_time(seconds: f64) -> String {
    let (whole, nanos) = split_timestamp(seconds);
    match DateTime::from_timestamp(whole, nanos) {
        Some(utc) => utc
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => seconds.to_string(),
    }
}

pub fn render_line(entry: &ChangelogEntry, directory: &WorkerDirectory) -> ChangelogLine {
    let mut data = entry.data.clone();
    let mut substitute = |field: &str| {
        if let Some(name) = data
            .get(field)
            .and_then(id_of)
            .and_then(|id| directory.name_of(id))
        {
            data.insert(field.to_string(), Value::String(name.to_string()));
        }
    };
    substitute("worker");
    if entry.kind == "edit_worker" {
        substitute("id");
    }
    let data = Value::Object(data).to_string();

    let worker = match entry.worker_id {
        None => "-".to_string(),
        Some(id) => directory
            .name_of(id)
            .map_or_else(|| id.to_string(), str::to_string),
    };

    ChangelogLine {
        time: format_time(entry.time),
        worker,
        user: entry
            .user_id
            .map_or_else(|| "-".to_string(), |id| id.to_string()),
        kind: kind_label(&entry.kind).to_string(),
        summary: data.chars().take(DATA_PREVIEW_CHARS).collect(),
        data,
    }
}

/// Renders at most [`MAX_ROWS`] entries, in server order.
pub fn render(entries: &[ChangelogEntry], directory: &WorkerDirectory) -> Vec<ChangelogLine> {
    entries
        .iter()
        .take(MAX_ROWS)
        .map(|entry| render_line(entry, directory))
        .collect()
}

/// Changelog rows reloaded through a task queue, optionally for one worker.
#[derive(Debug, Clone)]
pub struct ChangelogFeed {
    client: ApiClient,
    queue: TaskQueue,
    entries: ReloadSlot<Vec<ChangelogEntry>>,
}

impl ChangelogFeed {
    pub fn new(client: ApiClient, queue: TaskQueue) -> Self {
        Self {
            client,
            queue,
            entries: ReloadSlot::new(),
        }
    }

    pub fn reload(&self, worker: Option<u64>) {
        let client = self.client.clone();
        self.entries
            .reload(&self.queue, async move { client.changelog(worker).await });
    }

    /// Entries from the latest successful reload, once the queue is idle.
    pub async fn settled(&self) -> Option<Vec<ChangelogEntry>> {
        self.queue.wait_idle().await;
        self.entries.get()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::*;
    use crate::types::Worker;

    fn directory() -> WorkerDirectory {
        WorkerDirectory::from_rows(vec![Worker {
            id: 7,
            name: "Bob".to_string(),
            phone: None,
            email: None,
            login_secret: None,
            active: true,
            note: String::new(),
        }])
    }

    fn entry(kind: &str, worker_id: Option<u64>, data: Value) -> ChangelogEntry {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ChangelogEntry {
            time: 1_643_700_000.0,
            worker_id,
            user_id: None,
            kind: kind.to_string(),
            data,
        }
    }

    #[test]
    fn substitutes_worker_names() {
        let line = render_line(
            &entry("edit_worker", Some(7), json!({"id": 7, "worker": "7"})),
            &directory(),
        );

        assert_eq!(line.worker, "Bob");
        assert_eq!(line.user, "-");
        assert_eq!(line.kind, "(Admin) Edit worker");
        assert_eq!(line.data, r#"{"id":"Bob","worker":"Bob"}"#);
    }

    #[test]
    fn unknown_ids_and_kinds_pass_through() {
        let line = render_line(&entry("mystery", Some(99), json!({"id": 7})), &directory());

        assert_eq!(line.worker, "99");
        assert_eq!(line.kind, "mystery");
        assert_eq!(line.data, r#"{"id":7}"#);
    }

    #[test]
    fn timestamps_split_toward_negative_infinity() {
        assert_eq!(split_timestamp(1.25), (1, 250_000_000));
        assert_eq!(split_timestamp(-1.5), (-2, 500_000_000));
        assert_eq!(split_timestamp(-2.0), (-2, 0));
    }

    #[test]
    fn summary_is_truncated_and_rows_are_capped() {
        let long = "x".repeat(200);
        let entries = vec![entry("comment", None, json!({ "text": long })); MAX_ROWS + 5];

        let lines = render(&entries, &directory());

        assert_eq!(lines.len(), MAX_ROWS);
        assert_eq!(lines[0].summary.chars().count(), DATA_PREVIEW_CHARS);
        assert!(lines[0].data.len() > DATA_PREVIEW_CHARS);
    }
}
