use std::fmt;

use ansi_term::Colour;
use serde::{Deserialize, Serialize};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{Directive, EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Environment variable overriding the configured log level, using the
/// `EnvFilter` directive syntax.
pub const LOG_ENV: &str = "GNIX_LOG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    pub log_level: String,
    #[serde(default)]
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            log_level: String::from("info"),
            ansi: true,
        }
    }
}

/// Padded label and colour of each level.
fn level_style(level: &Level) -> (&'static str, Colour) {
    match *level {
        Level::TRACE => ("TRACE", Colour::Purple),
        Level::DEBUG => ("DEBUG", Colour::Blue),
        Level::INFO => (" INFO", Colour::Green),
        Level::WARN => (" WARN", Colour::Yellow),
        Level::ERROR => ("ERROR", Colour::Red),
    }
}

/// One line per event: timestamp, level, module target and source line,
/// then the fields.
struct GnixFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for GnixFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let (label, colour) = level_style(metadata.level());
        write!(writer, "[{} ", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"))?;
        if self.ansi && writer.has_ansi_escapes() {
            write!(writer, "{}", colour.paint(label))?;
        } else {
            write!(writer, "{}", label)?;
        }
        write!(
            writer,
            " {}:{}] ",
            metadata.target(),
            metadata.line().unwrap_or(0)
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber. Returns false if one was already set,
/// which happens when several fabrics are opened in one process.
pub fn init_log(config: &LogConfig) -> bool {
    use tracing_subscriber::prelude::*;

    let default_directive: Directive = config
        .log_level
        .parse()
        .unwrap_or_else(|_| LevelFilter::INFO.into());

    let log_env_filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let log_fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(config.ansi)
        .event_format(GnixFormatter { ansi: config.ansi })
        .with_filter(log_env_filter);

    let ok = tracing_subscriber::registry()
        .with(log_fmt_layer)
        .try_init()
        .is_ok();
    if ok {
        tracing::info!("tracing-log initialized");
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_labels_line_up() {
        for level in [Level::TRACE, Level::DEBUG, Level::INFO, Level::WARN, Level::ERROR] {
            assert_eq!(level_style(&level).0.len(), 5);
        }
        assert_eq!(level_style(&Level::WARN).0.trim(), "WARN");
    }
}
