use std::fmt;

use tracing::Subscriber;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Guard returned by [`init`]; must be held for the process lifetime so the
/// non-blocking file appender's background writer thread stays alive.
pub(crate) struct LoggingGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

/// Render each record as `[relay:<severity>] <tokens...>`, matching the
/// wire-level log format the spec describes.
struct RelayLineFormat;

impl<S, N> FormatEvent<S, N> for RelayLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let severity = match *event.metadata().level() {
            tracing::Level::ERROR => "error",
            tracing::Level::WARN => "warning",
            _ => "info",
        };
        write!(writer, "[relay:{severity}] ")?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initialize the global tracing subscriber. `RUST_LOG` always wins; absent
/// that, falls back to the level configured in `relay.toml`. Every record
/// goes to stderr; if `log_file` names a path, the same records are also
/// appended there through a non-blocking writer.
pub(crate) fn init(default_level: &str, log_file: Option<&str>) -> LoggingGuard {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .event_format(RelayLineFormat)
        .with_writer(std::io::stderr)
        .with_filter(filter());

    match log_file {
        Some(path) => {
            let path = std::path::Path::new(path);
            let (dir, file_name) = (
                path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new(".")),
                path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("relay.log")),
            );
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = tracing_subscriber::fmt::layer()
                .event_format(RelayLineFormat)
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(filter());

            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();

            LoggingGuard(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
            LoggingGuard(None)
        }
    }
}
