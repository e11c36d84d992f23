//! Tracing setup for mexec binaries.
//!
//! Console output honours `RUST_LOG` (default `info`). Admission decisions are
//! emitted on [`AUDIT_TARGET`] and can additionally be written to a rolling
//! file with `MEXEC_AUDIT_LOG_ROLL=1`.

use std::path::PathBuf;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

pub const AUDIT_TARGET: &str = "mexec.audit";

static AUDIT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

pub fn init() {
    let console = fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    let audit = AuditSettings::from_env().and_then(open_audit_writer).map(|writer| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(writer)
            .with_filter(Targets::new().with_target(AUDIT_TARGET, tracing::Level::INFO))
    });
    let _ = tracing_subscriber::registry()
        .with(console)
        .with(audit)
        .try_init();
}

#[derive(Debug, PartialEq)]
struct AuditSettings {
    dir: PathBuf,
    prefix: String,
    rotation: Rotation,
}

impl AuditSettings {
    fn from_env() -> Option<Self> {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        if var("MEXEC_AUDIT_LOG_ROLL").as_deref() != Some("1") {
            return None;
        }
        Some(Self {
            dir: audit_dir(var("MEXEC_AUDIT_LOG_DIR"), var("MEXEC_LOGS_DIR")),
            prefix: var("MEXEC_AUDIT_LOG_PREFIX").unwrap_or_else(|| "admission".into()),
            rotation: parse_rotation(var("MEXEC_AUDIT_LOG_ROTATION").as_deref()),
        })
    }
}

/// Explicit audit dir wins; otherwise `audit/` under the shared logs dir.
fn audit_dir(explicit: Option<String>, logs: Option<String>) -> PathBuf {
    match (explicit, logs) {
        (Some(dir), _) => PathBuf::from(dir),
        (None, Some(logs)) => PathBuf::from(logs).join("audit"),
        (None, None) => PathBuf::from("logs"),
    }
}

fn parse_rotation(raw: Option<&str>) -> Rotation {
    match raw.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
        Some("minutely") => Rotation::MINUTELY,
        Some("hourly") => Rotation::HOURLY,
        Some("never") => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

fn open_audit_writer(settings: AuditSettings) -> Option<NonBlocking> {
    if let Err(err) = std::fs::create_dir_all(&settings.dir) {
        eprintln!(
            "mexec: audit log disabled, cannot create {}: {err}",
            settings.dir.display()
        );
        return None;
    }
    let appender = match RollingFileAppender::builder()
        .rotation(settings.rotation)
        .filename_prefix(&settings.prefix)
        .build(&settings.dir)
    {
        Ok(appender) => appender,
        Err(err) => {
            eprintln!("mexec: audit log disabled: {err}");
            return None;
        }
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = AUDIT_GUARD.set(guard);
    Some(writer)
}
