//! Colored logging with per-component prefixes
//!
//! Every line carries a colored tag naming the part of the pipeline that
//! emitted it. The tag is derived from the event's module target, so library
//! crates log with plain `tracing` macros.

use owo_colors::{OwoColorize, Style};
use std::fmt;
use std::io;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{
    format::{FormatEvent, FormatFields, Writer},
    FmtContext,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Component identifier for prefixing logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Main,
    Capture,
    Detect,
    Record,
    Media,
}

impl Component {
    /// Map a tracing target (module path) to its component
    pub fn from_target(target: &str) -> Self {
        let (krate, module) = target.split_once("::").unwrap_or((target, ""));
        match krate {
            "vigil_capture" => Component::Capture,
            "vigil_detect" => Component::Detect,
            "vigil_processing" => {
                if module.starts_with("recorder") || module.starts_with("segment") {
                    Component::Record
                } else {
                    Component::Media
                }
            }
            "vigil_core" if module.starts_with("camera") => Component::Detect,
            _ => Component::Main,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Main => "MAIN",
            Component::Capture => "CAPTURE",
            Component::Detect => "DETECT",
            Component::Record => "RECORD",
            Component::Media => "MEDIA",
        }
    }

    pub fn color_style(&self) -> Style {
        match self {
            Component::Main => Style::new().cyan().bold(),
            Component::Capture => Style::new().blue().bold(),
            Component::Detect => Style::new().yellow().bold(),
            Component::Record => Style::new().green().bold(),
            Component::Media => Style::new().magenta().bold(),
        }
    }
}

/// Formatter writing `HH:MM:SS [COMPONENT] LEVEL message fields`
pub struct ColoredFormatter;

impl<S, N> FormatEvent<S, N> for ColoredFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let component = Component::from_target(metadata.target());

        let now = chrono::Local::now();
        write!(writer, "{} ", now.format("%H:%M:%S").dimmed())?;

        let prefix = format!("[{:7}]", component.as_str());
        write!(writer, "{} ", prefix.style(component.color_style()))?;

        match *metadata.level() {
            Level::ERROR => write!(writer, "{} ", "ERROR".red().bold())?,
            Level::WARN => write!(writer, "{} ", "WARN ".yellow().bold())?,
            Level::INFO => write!(writer, "{} ", "INFO ".green().bold())?,
            Level::DEBUG => write!(writer, "{} ", "DEBUG".blue().bold())?,
            Level::TRACE => write!(writer, "{} ", "TRACE".dimmed().bold())?,
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Install the colored subscriber. `RUST_LOG` wins over the default level;
/// `verbose` lowers the default from info to debug.
pub fn init_logger(verbose: bool) -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let default_level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(ColoredFormatter)
        .with_writer(io::stdout);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_from_target() {
        assert_eq!(Component::from_target("vigil_capture::source"), Component::Capture);
        assert_eq!(Component::from_target("vigil_detect::motion"), Component::Detect);
        assert_eq!(Component::from_target("vigil_processing::recorder"), Component::Record);
        assert_eq!(Component::from_target("vigil_processing::segment"), Component::Record);
        assert_eq!(Component::from_target("vigil_processing::media"), Component::Media);
        assert_eq!(Component::from_target("vigil_processing::encoder"), Component::Media);
        assert_eq!(Component::from_target("vigil_core::camera"), Component::Detect);
        assert_eq!(Component::from_target("vigil_core::orchestrator"), Component::Main);
        assert_eq!(Component::from_target("vigil"), Component::Main);
    }
}
