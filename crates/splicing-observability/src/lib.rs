use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const OBS_TARGET: &str = "splicing.obs";

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }

    fn file_prefix(self) -> String {
        format!("splicing.{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Structured lifecycle record. Unset fields are logged as empty strings so
/// every JSONL line carries the same keys.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub project_id: Option<&'a str>,
    pub section_id: Option<&'a str>,
    pub block_id: Option<&'a str>,
    pub message_id: Option<&'a str>,
    pub provider_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} sha256={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

/// First 16 hex digits of the SHA-256 of `input`. Stable across builds and
/// platforms, so it is safe to persist.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

macro_rules! obs_record {
    ($macro:ident, $process:expr, $event:expr) => {
        tracing::$macro!(
            target: OBS_TARGET,
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            project_id = $event.project_id.unwrap_or(""),
            section_id = $event.section_id.unwrap_or(""),
            block_id = $event.block_id.unwrap_or(""),
            message_id = $event.message_id.unwrap_or(""),
            provider_id = $event.provider_id.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => obs_record!(error, process, event),
        Level::WARN => obs_record!(warn, process, event),
        Level::DEBUG | Level::TRACE => obs_record!(debug, process, event),
        _ => obs_record!(info, process, event),
    }
}

/// Installs the console layer and the daily rolling JSONL layer. The returned
/// guard must be held for the lifetime of the process or buffered lines are lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process, retention_days, Utc::now())?;

    let prefix = process.file_prefix();
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(prefix.clone())
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix,
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

/// Removes `splicing.<process>.YYYY-MM-DD.jsonl` files dated before the
/// retention window. Returns how many files were deleted.
pub fn cleanup_old_jsonl(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let cutoff = now - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{}.", process.file_prefix());
    let mut removed = 0;

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(date_part) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".jsonl"))
        else {
            continue;
        };
        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };
        if DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc) < cutoff
            && fs::remove_file(&path).is_ok()
        {
            removed += 1;
        }
    }

    Ok(removed)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn redact_text_masks_content() {
        let raw = "sk-live-api-key-123";
        let redacted = redact_text(raw);
        assert!(redacted.contains("[redacted len=19"));
        assert!(!redacted.contains(raw));
        assert_eq!(redact_text("   "), "");
    }

    #[test]
    fn short_hash_is_stable() {
        assert_eq!(short_hash("abc"), "ba7816bf8f01cfea");
        assert_eq!(short_hash("abc").len(), 16);
    }

    #[test]
    fn cleanup_removes_only_expired_files_for_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap();
        for name in [
            "splicing.engine.2024-06-01.jsonl",
            "splicing.engine.2024-06-29.jsonl",
            "splicing.cli.2024-06-01.jsonl",
            "splicing.engine.notes.jsonl",
        ] {
            fs::write(dir.path().join(name), "{}\n").expect("write log");
        }

        let removed =
            cleanup_old_jsonl(dir.path(), ProcessKind::Engine, 14, now).expect("cleanup");

        assert_eq!(removed, 1);
        assert!(!dir.path().join("splicing.engine.2024-06-01.jsonl").exists());
        assert!(dir.path().join("splicing.engine.2024-06-29.jsonl").exists());
        assert!(dir.path().join("splicing.cli.2024-06-01.jsonl").exists());
        assert!(dir.path().join("splicing.engine.notes.jsonl").exists());
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/tmp/splicing");
        assert_eq!(
            canonical_logs_dir_from_root(&root),
            PathBuf::from("/tmp/splicing").join("logs")
        );
    }
}
