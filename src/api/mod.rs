//! Client for the shift-planner REST API (`/api/v0/...`).

mod error;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate, Weekday};
use reqwest::header::COOKIE;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

pub use error::{ApiError, CutoffError};

use crate::types::{
    ChangelogEntry, DayShift, NewWorker, RetentionStatus, Rows, ShiftKey, ShiftRow, WeekIndex,
    Worker, WorkerRef, WorkerStats, Workplace,
};
use crate::workers::WorkerPatch;

const CSRF_HEADER: &str = "X-CSRFToken";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub csrf_token: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            csrf_token: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// One page of the week schedule plus the server's adjacent-week cursors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekPage {
    pub rows: Vec<ShiftRow>,
    pub next: Option<WeekIndex>,
    pub prev: Option<WeekIndex>,
}

#[derive(Debug, Deserialize)]
struct WeekPageBody {
    #[serde(default)]
    rows: Vec<ShiftRow>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    prev: Option<String>,
}

impl TryFrom<WeekPageBody> for WeekPage {
    type Error = ApiError;

    fn try_from(body: WeekPageBody) -> Result<Self, Self::Error> {
        let parse_cursor = |raw: Option<String>| -> Result<Option<WeekIndex>, ApiError> {
            match raw.as_deref().map(str::trim) {
                None | Some("") => Ok(None),
                Some(token) => Ok(Some(token.parse()?)),
            }
        };

        Ok(WeekPage {
            rows: body.rows,
            next: parse_cursor(body.next)?,
            prev: parse_cursor(body.prev)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WorkerStatsBody {
    #[serde(default)]
    workers: Vec<WorkerStats>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        debug!(path, "GET");
        let response = self.http.get(self.url(path)).send().await?;
        decode_response(path, response).await
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<String, ApiError> {
        debug!(path, "POST");
        let mut request = self.http.post(self.url(path)).json(body);
        if let Some(token) = self.config.csrf_token.as_deref() {
            request = request
                .header(CSRF_HEADER, token)
                .header(COOKIE, format!("csrftoken={token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            warn!(path, status = status.as_u16(), "mutation rejected");
            return Err(ApiError::from_status(status.as_u16(), &text));
        }
        Ok(text)
    }

    pub async fn fetch_week(&self, index: WeekIndex) -> Result<WeekPage, ApiError> {
        let body: WeekPageBody = self
            .get_json(&format!("/api/v0/shift/?week={index}"))
            .await?;
        WeekPage::try_from(body)
    }

    pub async fn set_shift_workers(
        &self,
        shift: &ShiftKey,
        workers: &[WorkerRef],
    ) -> Result<(), ApiError> {
        let path = format!(
            "/api/v0/shift/{}/{}/",
            urlencoding::encode(&shift.date),
            urlencoding::encode(&shift.slug)
        );
        self.post_json(&path, &json!({ "workers": workers })).await?;
        Ok(())
    }

    pub async fn list_shifts_from(&self, from: NaiveDate) -> Result<Vec<ShiftRow>, ApiError> {
        let rows: Rows<ShiftRow> = self
            .get_json(&format!("/api/v0/shift/?fromdate={}", from.format("%Y-%m-%d")))
            .await?;
        Ok(rows.rows)
    }

    pub async fn save_shift_days(
        &self,
        modified_days: &BTreeMap<String, Vec<DayShift>>,
    ) -> Result<(), ApiError> {
        self.post_json("/api/v0/shift/", &json!({ "modifiedDays": modified_days }))
            .await?;
        Ok(())
    }

    pub async fn list_workers(&self) -> Result<Vec<Worker>, ApiError> {
        let rows: Rows<Worker> = self.get_json("/api/v0/worker/").await?;
        Ok(rows.rows)
    }

    pub async fn create_workers(&self, workers: &[NewWorker]) -> Result<(), ApiError> {
        self.post_json("/api/v0/worker/", &json!({ "workers": workers }))
            .await?;
        Ok(())
    }

    /// Returns the server's echo of the updated worker, when it sends one.
    pub async fn update_worker(&self, id: u64, patch: &WorkerPatch) -> Result<Value, ApiError> {
        let text = self
            .post_json(&format!("/api/v0/worker/{id}/"), patch)
            .await?;
        Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
    }

    pub async fn delete_workers(&self, ids: &[u64]) -> Result<(), ApiError> {
        self.post_json("/api/v0/worker_delete/", &json!({ "ids": ids }))
            .await?;
        Ok(())
    }

    pub async fn get_workplace(&self) -> Result<Workplace, ApiError> {
        let path = "/api/v0/workplace/";
        let rows: Rows<Workplace> = self.get_json(path).await?;
        rows.rows
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::decode(path, "response contained no workplace rows"))
    }

    pub async fn save_workplace(&self, workplace: &Workplace) -> Result<(), ApiError> {
        self.post_json("/api/v0/workplace/", workplace).await?;
        Ok(())
    }

    pub async fn worker_stats(&self) -> Result<Vec<WorkerStats>, ApiError> {
        let body: WorkerStatsBody = self.get_json("/api/v0/worker_stats/").await?;
        Ok(body.workers)
    }

    pub async fn changelog(&self, worker: Option<u64>) -> Result<Vec<ChangelogEntry>, ApiError> {
        let path = match worker {
            Some(id) => format!("/api/v0/changelog/?worker={id}"),
            None => "/api/v0/changelog/".to_string(),
        };
        let rows: Rows<ChangelogEntry> = self.get_json(&path).await?;
        Ok(rows.rows)
    }

    pub async fn retention_status(&self) -> Result<RetentionStatus, ApiError> {
        self.get_json("/api/v0/shift_delete/").await
    }

    /// Deletes shifts dated before `before`, which must be a Monday at least a
    /// week in the past.
    pub async fn run_retention(&self, before: NaiveDate) -> Result<RetentionStatus, ApiError> {
        check_retention_cutoff(before, Local::now().date_naive())?;
        let path = "/api/v0/shift_delete/";
        let text = self
            .post_json(path, &json!({ "before": before.format("%Y-%m-%d").to_string() }))
            .await?;
        if text.trim().is_empty() {
            return Ok(RetentionStatus::new());
        }
        serde_json::from_str(&text).map_err(|err| ApiError::decode(path, err.to_string()))
    }
}

pub fn check_retention_cutoff(before: NaiveDate, today: NaiveDate) -> Result<(), CutoffError> {
    if before.weekday() != Weekday::Mon {
        return Err(CutoffError::NotMonday(before));
    }
    if (today - before).num_days() < 7 {
        return Err(CutoffError::TooRecent(before));
    }
    Ok(())
}

async fn decode_response<T: DeserializeOwned>(
    path: &str,
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        warn!(path, status = status.as_u16(), "request failed");
        return Err(ApiError::from_status(status.as_u16(), &text));
    }
    serde_json::from_str(&text).map_err(|err| ApiError::decode(path, err.to_string()))
}
