use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_LEVEL_ENV: &str = "SHIFTDESK_LOG_LEVEL";
const LOG_FILE_PREFIX: &str = "shiftdesk-";

/// Logs to a fresh file under [`get_log_directory`]. With `echo_stderr`, the
/// same events are also written to stderr for interactive runs.
pub fn init_logging(echo_stderr: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let log_dir = get_log_directory()?;
    fs::create_dir_all(&log_dir)?;

    let log_file_path = get_log_file_path(&log_dir);

    let file = fs::File::create(&log_file_path)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    std::mem::forget(guard);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    let stderr_layer = echo_stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(build_log_filter(echo_stderr))
        .with(file_layer)
        .with(stderr_layer)
        .init();

    tracing::info!(path = %log_file_path.display(), "logging initialized");

    Ok(log_file_path)
}

fn build_log_filter(verbose: bool) -> EnvFilter {
    EnvFilter::new(filter_directive(
        std::env::var(LOG_LEVEL_ENV).ok().as_deref(),
        verbose,
    ))
}

/// `SHIFTDESK_LOG_LEVEL` wins; otherwise `debug` when verbose, `warn` if not.
/// Dependencies stay at `warn` unless the level is set explicitly.
fn filter_directive(raw_level: Option<&str>, verbose: bool) -> String {
    match raw_level.and_then(normalize_log_level) {
        Some(level) => format!("{level},shiftdesk={level}"),
        None if verbose => "warn,shiftdesk=debug".to_string(),
        None => "warn".to_string(),
    }
}

fn normalize_log_level(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

pub fn get_log_directory() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let data_dir = dirs::data_local_dir().ok_or("Failed to determine local data directory")?;
    Ok(data_dir.join("shiftdesk").join("logs"))
}

pub fn get_log_file_path(log_dir: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    log_dir.join(format!("{LOG_FILE_PREFIX}{timestamp}.log"))
}

/// Most recently modified log file, for `--log-path` style diagnostics.
pub fn get_recent_log_path() -> Option<PathBuf> {
    let log_dir = get_log_directory().ok()?;

    if !log_dir.exists() {
        return None;
    }

    let mut entries = fs::read_dir(&log_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX) && n.ends_with(".log"))
        })
        .collect::<Vec<_>>();

    entries.sort_by_key(|e| std::cmp::Reverse(e.metadata().ok().and_then(|m| m.modified().ok())));

    entries.into_iter().next().map(|e| e.path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_log_directory() {
        let path = get_log_directory().expect("data dir should resolve");
        assert!(path.to_string_lossy().contains("shiftdesk"));
        assert!(path.ends_with("logs"));
    }

    #[test]
    fn test_get_log_file_path() {
        let dir = PathBuf::from("/tmp/test-logs");
        let path = get_log_file_path(&dir);
        let path_str = path.to_string_lossy();
        assert!(path_str.contains("shiftdesk-"));
        assert!(path_str.ends_with(".log"));
    }

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive(None, false), "warn");
        assert_eq!(filter_directive(None, true), "warn,shiftdesk=debug");
        assert_eq!(
            filter_directive(Some("TRACE"), false),
            "trace,shiftdesk=trace"
        );
        assert_eq!(filter_directive(Some("loud"), true), "warn,shiftdesk=debug");
    }

    #[test]
    fn test_normalize_log_level() {
        assert_eq!(normalize_log_level("DEBUG"), Some("debug"));
        assert_eq!(normalize_log_level(" warning "), Some("warn"));
        assert_eq!(normalize_log_level("loud"), None);
    }
}
