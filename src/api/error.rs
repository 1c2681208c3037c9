use chrono::NaiveDate;
use serde_json::Value;
use thiserror::Error;

use crate::types::ParseWeekError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP {status}")]
    Http { status: u16 },

    /// HTTP 400 carrying a structured error body; the message is shown as-is.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("http request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to parse {endpoint} response: {message}")]
    Decode { endpoint: String, message: String },

    #[error("server returned an invalid week cursor: {0}")]
    InvalidCursor(#[from] ParseWeekError),

    #[error(transparent)]
    InvalidCutoff(#[from] CutoffError),
}

/// Why a retention cutoff was refused before any request was made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CutoffError {
    #[error("retention cutoff {0} is not a Monday")]
    NotMonday(NaiveDate),
    #[error("retention cutoff {0} is less than a week ago")]
    TooRecent(NaiveDate),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status } | ApiError::Rejected { status, .. } => Some(*status),
            ApiError::Transport(err) => err.status().map(|status| status.as_u16()),
            ApiError::Decode { .. } | ApiError::InvalidCursor(_) | ApiError::InvalidCutoff(_) => {
                None
            }
        }
    }

    pub(crate) fn from_status(status: u16, body: &str) -> Self {
        if status == 400
            && let Some(message) = structured_error_message(body)
        {
            return ApiError::Rejected { status, message };
        }
        ApiError::Http { status }
    }

    pub(crate) fn decode(endpoint: &str, message: impl Into<String>) -> Self {
        ApiError::Decode {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }
}

fn structured_error_message(body: &str) -> Option<String> {
    let payload: Value = serde_json::from_str(body).ok()?;
    let object = payload.as_object()?;
    ["error", "message", "detail"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(ToString::to_string)
}
