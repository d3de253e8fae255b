//! ---
//! tach_section: "01-core-functionality"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Shared primitives and utilities for the harness runtime."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use anyhow::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "TACH_LOG";

/// Live backends pull in hyper and reqwest, whose connection chatter drowns run events.
const DEFAULT_FILTER: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn,h2=warn";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available log formats for harness binaries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// One harness process as seen by its log files.
///
/// Several harness processes may share a log directory (parallel CI shards,
/// a soak next to a smoke run); each writes its own file series keyed by
/// the session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSession {
    pub id: String,
    /// Base name handed to the daily appender, which adds the date suffix.
    pub file_stem: String,
}

impl LogSession {
    pub fn new(service_name: &str, config: &LoggingConfig, started: DateTime<Utc>, pid: u32) -> Self {
        let id = format!("{}-{pid}", started.format("%Y%m%dT%H%M%SZ"));
        let prefix = config.file_prefix.as_deref().unwrap_or("tachyon");
        Self {
            file_stem: format!("{prefix}-{service_name}-{id}.log"),
            id,
        }
    }
}

fn filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to {DEFAULT_FILTER}");
            EnvFilter::new(DEFAULT_FILTER)
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    }
}

/// Initialize the tracing subscriber for one harness process.
///
/// `TACH_LOG` overrides the filter, then `RUST_LOG`. Stdout receives JSON or
/// pretty output per [`LoggingConfig::format`]; the session's daily JSON file
/// keeps the full history of long soaks.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<LogSession> {
    std::fs::create_dir_all(&config.directory)?;
    let session = LogSession::new(service_name, config, Utc::now(), std::process::id());

    let file_appender = daily(&config.directory, &session.file_stem);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        session = %session.id,
        log_file = %config.directory.join(&session.file_stem).display(),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_are_per_process() {
        let started = DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap();
        let config = LoggingConfig::default();
        let first = LogSession::new("tachctl", &config, started, 41);
        let second = LogSession::new("tachctl", &config, started, 42);
        assert_eq!(first.id, "20240101T000000Z-41");
        assert_eq!(first.file_stem, "tachyon-tachctl-20240101T000000Z-41.log");
        assert_ne!(first.file_stem, second.file_stem);

        let config = LoggingConfig {
            file_prefix: Some("soak".into()),
            ..LoggingConfig::default()
        };
        assert!(LogSession::new("tach-simgen", &config, started, 7)
            .file_stem
            .starts_with("soak-tach-simgen-"));
    }

    #[test]
    fn init_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: dir.path().join("logs"),
            format: LogFormat::Pretty,
            file_prefix: Some("unit".into()),
        };
        let session = init_tracing("tach-test", &config).unwrap();
        assert!(config.directory.is_dir());
        assert!(session.file_stem.contains(&session.id));
    }
}
