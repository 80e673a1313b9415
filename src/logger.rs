//! Log output for the `fuse_trajectory` binary and library consumers.
//!
//! Lines look like `[INFO 2026-03-02 14:05:11 fusion] Solve finished ...`. DEBUG and TRACE
//! events show `file:line` in place of the module, which is what the per-iteration tables
//! of the solvers are read with.
//!
//! `RUST_LOG` overrides the default level:
//! ```bash
//! RUST_LOG=debug fuse_trajectory --baseline vo.json --output fused.json
//! RUST_LOG=pose_fusion::optimizer=trace fuse_trajectory ...
//! ```

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{FmtContext, FormatEvent, FormatFields, format::Writer},
    registry::LookupSpan,
};

/// Install the subscriber at INFO.
///
/// ```no_run
/// pose_fusion::init_logger();
/// tracing::info!("Loading baseline");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install the subscriber with `default_level` unless `RUST_LOG` says otherwise.
///
/// A second call is a no-op, so tests and the binary may both call it.
pub fn init_logger_with_level(default_level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(FusionFormatter { ansi: true })
        .try_init();

    if installed.is_err() {
        tracing::debug!("Global subscriber already set, keeping it");
    }
}

struct FusionFormatter {
    ansi: bool,
}

impl FusionFormatter {
    fn level_label(&self, level: Level) -> &'static str {
        match (level, self.ansi) {
            (Level::ERROR, true) => "\x1b[31mERROR\x1b[0m",
            (Level::WARN, true) => "\x1b[33mWARN\x1b[0m",
            (Level::INFO, true) => "\x1b[32mINFO\x1b[0m",
            (Level::DEBUG, true) => "\x1b[34mDEBUG\x1b[0m",
            (Level::TRACE, true) => "\x1b[35mTRACE\x1b[0m",
            (Level::ERROR, false) => "ERROR",
            (Level::WARN, false) => "WARN",
            (Level::INFO, false) => "INFO",
            (Level::DEBUG, false) => "DEBUG",
            (Level::TRACE, false) => "TRACE",
        }
    }
}

/// `pose_fusion::optimizer::levenberg_marquardt` -> `levenberg_marquardt`
fn short_target(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

impl<S, N> FormatEvent<S, N> for FusionFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = *metadata.level();

        write!(
            writer,
            "[{} {} ",
            self.level_label(level),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        match (level, metadata.file()) {
            (Level::DEBUG | Level::TRACE, Some(file)) => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{}:{}", filename, metadata.line().unwrap_or(0))?;
            }
            _ => write!(writer, "{}", short_target(metadata.target()))?,
        }

        write!(writer, "] ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
