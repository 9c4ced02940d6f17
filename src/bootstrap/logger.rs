//! Logging initialisation via tracing-subscriber.
//!
//! Call [`init`] once at startup, after settings and CLI flags are resolved.

use std::path::Path;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::error::AppError;

/// Overlay dependencies that are noisy below `warn`.  Only applied when the
/// level is a bare level, so explicit per-target directives still win.
const QUIET_TARGETS: &[&str] = &["libp2p_noise=warn", "yamux=warn", "multistream_select=warn"];

/// Initialise the global tracing subscriber.
///
/// `level` is any `EnvFilter` directive (`"info"`, `"p2pnode=debug"`, …).
/// With `prefer_level` the given level wins over `RUST_LOG`; otherwise
/// `RUST_LOG` wins and `level` is the fallback.
pub fn init(level: &str, prefer_level: bool, log_file: Option<&Path>) -> Result<(), AppError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(level, prefer_level, rust_log.as_deref())?;

    let writer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    AppError::Logger(format!("failed to open log file '{}': {e}", path.display()))
                })?;
            BoxMakeWriter::new(file)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))?;

    Ok(())
}

/// Pick the filter from `level` and the `RUST_LOG` value, whichever takes
/// precedence and parses.
pub fn build_filter(level: &str, prefer_level: bool, rust_log: Option<&str>) -> Result<EnvFilter, AppError> {
    let from_level = || with_quiet_targets(level);
    let from_env = || {
        let value = rust_log.ok_or_else(|| AppError::Logger("RUST_LOG is not set".into()))?;
        EnvFilter::try_new(value).map_err(|e| AppError::Logger(format!("invalid RUST_LOG '{value}': {e}")))
    };
    if prefer_level {
        from_level().or_else(|level_err| {
            from_env().map_err(|env_err| AppError::Logger(format!("{level_err}; {env_err}")))
        })
    } else {
        from_env().or_else(|_| from_level())
    }
}

fn with_quiet_targets(level: &str) -> Result<EnvFilter, AppError> {
    let invalid = |e: &dyn std::fmt::Display| AppError::Logger(format!("invalid log level '{level}': {e}"));
    if level.trim().is_empty() {
        return Err(invalid(&"empty"));
    }
    let mut filter = EnvFilter::try_new(level).map_err(|e| invalid(&e))?;
    if !level.contains('=') {
        for target in QUIET_TARGETS {
            let directive: Directive = target.parse().map_err(|e| invalid(&e))?;
            filter = filter.add_directive(directive);
        }
    }
    Ok(filter)
}

/// Map the number of `-v` flags to a level, `None` meaning "use settings".
///
///   -v → warn, -vv → info, -vvv → debug, -vvvv+ → trace
pub fn level_for_verbosity(verbosity: u8) -> Option<&'static str> {
    match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    }
}
