//! Subscriber setup for binaries and tests.
//!
//! Every ChatKit crate logs through `tracing`. The host installs one global subscriber
//! with [`init_logging`]; integration tests use [`LogConfig::for_tests`] so output is
//! captured per test instead of going to stdout.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter, TestWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::{ChatKitError, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// Single line per event.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when neither `filter` nor `RUST_LOG` is set.
    pub level: Level,
    pub format: LogFormat,
    /// Source file and line on every event (pretty format only).
    pub include_location: bool,
    /// Emit span enter/close events.
    pub include_span_events: bool,
    /// Directive string such as `"chatkit_sync=debug,chatkit_sw=info"`.
    pub filter: Option<String>,
    /// Write through the test harness capture instead of stdout.
    pub test_writer: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
            test_writer: false,
        }
    }
}

impl LogConfig {
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// JSON lines at info.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Compact output captured by the test harness, limited to `filter`.
    pub fn for_tests(filter: impl Into<String>) -> Self {
        Self {
            level: Level::DEBUG,
            format: LogFormat::Compact,
            filter: Some(filter.into()),
            test_writer: true,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string());
        match self.filter {
            Some(ref custom) => EnvFilter::try_new(custom).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }

    fn writer(&self) -> BoxMakeWriter {
        if self.test_writer {
            BoxMakeWriter::new(TestWriter::new())
        } else {
            BoxMakeWriter::new(std::io::stdout)
        }
    }

    fn fmt_layer(&self) -> BoxedLayer {
        let span_events = if self.include_span_events {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_writer(self.writer())
            .with_target(true)
            .with_span_events(span_events);

        match self.format {
            LogFormat::Pretty => layer
                .with_file(self.include_location)
                .with_line_number(self.include_location)
                .boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// Fails with a config error when a global subscriber is already set; tests that share a
/// process can ignore that error.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let layer = config.fmt_layer().with_filter(config.env_filter());

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| ChatKitError::Config {
            message: "logging already initialized".to_string(),
            source: Some(Box::new(e)),
        })
}
