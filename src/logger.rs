//! Logging setup for programs embedding the solver
//!
//! The solver itself only emits `tracing` events: per-iteration tables and the final summary
//! go to `debug` (or `info` with `DogLegConfig::with_debug`), regularization retries to `warn`,
//! errors to `error`. This module installs a subscriber that prints them.

use tracing::Level;

/// Initialize the tracing subscriber with the standard configuration
///
/// Default log level: INFO (overrideable via RUST_LOG environment variable)
///
/// Format: `[LEVEL HH:MM:SS.mmm module]` for INFO/WARN/ERROR
///         `[LEVEL HH:MM:SS.mmm file:line]` for DEBUG/TRACE
///
/// Calling it again once a subscriber is installed does nothing.
///
/// # Example
/// ```no_run
/// use dogleg::init_logger;
///
/// init_logger();
/// tracing::info!("Application started");
/// ```
///
/// # Environment Variables
/// Override the default log level using `RUST_LOG`:
/// ```bash
/// RUST_LOG=debug cargo bench --bench backend_comparison
/// RUST_LOG=dogleg=debug cargo test
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// # Arguments
/// * `default_level` - The default log level (overrideable via RUST_LOG)
///
/// # Example
/// ```no_run
/// use dogleg::init_logger_with_level;
/// use tracing::Level;
///
/// // show the per-iteration table of every solve
/// init_logger_with_level(Level::DEBUG);
/// ```
pub fn init_logger_with_level(default_level: Level) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(SolverFormatter)
        .try_init();

    if installed.is_err() {
        tracing::debug!("A tracing subscriber is already installed; keeping it");
    }
}

/// Event formatter: bracketed colored level, wall-clock time, then where the event came from
struct SolverFormatter;

/// `file:line` without the directory part, or the target if the file is unknown
fn event_location(metadata: &tracing::Metadata<'_>) -> String {
    match metadata.file() {
        Some(file) => {
            let filename = file.rsplit(['/', '\\']).next().unwrap_or(file);
            match metadata.line() {
                Some(line) => format!("{filename}:{line}"),
                None => filename.to_string(),
            }
        }
        None => metadata.target().to_string(),
    }
}

fn level_label(level: Level) -> &'static str {
    match level {
        Level::ERROR => "\x1b[31mERROR\x1b[0m",
        Level::WARN => "\x1b[33mWARN\x1b[0m",
        Level::INFO => "\x1b[32mINFO\x1b[0m",
        Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
        Level::TRACE => "\x1b[35mTRACE\x1b[0m",
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for SolverFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = *metadata.level();

        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let origin = if level == Level::DEBUG || level == Level::TRACE {
            event_location(metadata)
        } else {
            metadata.target().to_string()
        };

        write!(writer, "[{} {} {}] ", level_label(level), timestamp, origin)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
