// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::{Args, ValueEnum};
use owo_colors::{OwoColorize, Style, style};
use std::fmt;
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    level_filters::LevelFilter,
    warn,
};
use tracing_subscriber::{
    Layer,
    filter::Targets,
    fmt::{FmtContext, FormatEvent, FormatFields, format},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// The environment variable holding the log filter, in `tracing_subscriber::filter::Targets`
/// syntax (for example `info,ptsbot_runner::dispatch=debug`).
pub(crate) const LOG_ENV: &str = "PTSBOT_LOG";

/// Events with this target are printed without a level heading.
pub(crate) const NO_HEADING_TARGET: &str = "ptsbot::no_heading";

pub(crate) mod clap_styles {
    use clap::builder::{
        Styles,
        styling::{AnsiColor, Effects},
    };

    /// Help styles: green section headings, cyan flags and values.
    pub(crate) const fn style() -> Styles {
        let heading = AnsiColor::Green.on_default().effects(Effects::BOLD);
        let flag = AnsiColor::Cyan.on_default().effects(Effects::BOLD);
        Styles::styled()
            .header(heading)
            .usage(heading)
            .literal(flag)
            .placeholder(AnsiColor::Cyan.on_default())
            .error(AnsiColor::Red.on_default().effects(Effects::BOLD))
            .valid(flag)
            .invalid(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
    }
}

#[derive(Copy, Clone, Debug, Args)]
#[must_use]
pub(crate) struct OutputOpts {
    /// Verbose output
    #[arg(long, short, global = true, env = "PTSBOT_VERBOSE")]
    pub(crate) verbose: bool,

    /// Produce color output: auto, always, never
    #[arg(
        long,
        value_enum,
        default_value_t,
        hide_possible_values = true,
        global = true,
        value_name = "WHEN",
        env = "PTSBOT_COLOR"
    )]
    pub(crate) color: Color,
}

impl OutputOpts {
    pub(crate) fn init(self) -> OutputContext {
        let OutputOpts { verbose, color } = self;

        color.init();

        OutputContext { verbose, color }
    }
}

/// Output settings resolved from the command line.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub struct OutputContext {
    pub(crate) verbose: bool,
    pub(crate) color: Color,
}

impl OutputContext {
    /// Returns general stderr styles for the current output context.
    pub fn stderr_styles(&self) -> StderrStyles {
        let mut styles = StderrStyles::default();

        if self.color.should_colorize(supports_color::Stream::Stderr) {
            styles.colorize();
        }

        styles
    }

    pub(crate) fn stdout_styles(&self) -> StdoutStyles {
        let mut styles = StdoutStyles::default();

        if self.color.should_colorize(supports_color::Stream::Stdout) {
            styles.colorize();
        }

        styles
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Default)]
#[must_use]
pub(crate) enum Color {
    #[default]
    Auto,
    Always,
    Never,
}

static INIT_LOGGER: std::sync::Once = std::sync::Once::new();

impl Color {
    pub(crate) fn init(self) {
        let colorize = self.should_colorize(supports_color::Stream::Stderr);

        INIT_LOGGER.call_once(|| {
            let level_str = std::env::var(LOG_ENV).unwrap_or_default();

            // An empty filter means the default level.
            let (targets, parse_error) = if level_str.is_empty() {
                (Targets::new().with_default(LevelFilter::INFO), None)
            } else {
                match level_str.parse::<Targets>() {
                    Ok(targets) => (targets, None),
                    Err(error) => (Targets::new().with_default(LevelFilter::INFO), Some(error)),
                }
            };

            let layer = tracing_subscriber::fmt::layer()
                .event_format(SimpleFormatter { colorize })
                .with_writer(std::io::stderr)
                .with_filter(targets);

            tracing_subscriber::registry().with(layer).init();

            if let Some(error) = parse_error {
                warn!("ignoring invalid {LOG_ENV} value `{level_str}`: {error}");
            }
        });
    }

    pub(crate) fn should_colorize(self, stream: supports_color::Stream) -> bool {
        match self {
            Color::Auto => supports_color::on_cached(stream).is_some(),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

/// Prints `level: message key=value ...` lines.
struct SimpleFormatter {
    colorize: bool,
}

fn level_heading(level: Level, colorize: bool) -> (&'static str, Style) {
    let (heading, color) = match level {
        Level::ERROR => ("error", style().red().bold()),
        Level::WARN => ("warning", style().yellow().bold()),
        Level::INFO => ("info", style().bold()),
        Level::DEBUG => ("debug", style().bold()),
        Level::TRACE => ("trace", style().dimmed()),
    };
    (heading, if colorize { color } else { Style::new() })
}

impl<S, N> FormatEvent<S, N> for SimpleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        if metadata.target() != NO_HEADING_TARGET {
            let (heading, heading_style) = level_heading(*metadata.level(), self.colorize);
            write!(writer, "{}: ", heading.style(heading_style))?;
        }

        let mut visitor = MessageVisitor {
            writer: &mut writer,
            error: None,
        };

        event.record(&mut visitor);

        if let Some(error) = visitor.error {
            return Err(error);
        }

        writeln!(writer)
    }
}

static MESSAGE_FIELD: &str = "message";

/// Writes the message, followed by any structured fields as `key=value`.
struct MessageVisitor<'writer, 'a> {
    writer: &'a mut format::Writer<'writer>,
    error: Option<fmt::Error>,
}

impl Visit for MessageVisitor<'_, '_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let res = if field.name() == MESSAGE_FIELD {
            write!(self.writer, "{value:?}")
        } else {
            write!(self.writer, " {}={value:?}", field.name())
        };
        if let Err(error) = res {
            self.error = Some(error);
        }
    }
}

/// Styles for messages written directly to stderr.
#[derive(Debug, Default)]
pub struct StderrStyles {
    pub(crate) bold: Style,
    pub(crate) warning_text: Style,
}

impl StderrStyles {
    fn colorize(&mut self) {
        self.bold = style().bold();
        self.warning_text = style().yellow();
    }
}

#[derive(Debug, Default)]
pub(crate) struct StdoutStyles {
    pub(crate) heading: Style,
    pub(crate) count: Style,
    pub(crate) test_case: Style,
    pub(crate) status_good: Style,
    pub(crate) status_bad: Style,
}

impl StdoutStyles {
    fn colorize(&mut self) {
        self.heading = style().bold();
        self.count = style().bold();
        self.test_case = style().cyan();
        self.status_good = style().green().bold();
        self.status_bad = style().red().bold();
    }
}
