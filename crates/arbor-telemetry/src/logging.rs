//! Subscriber construction for plugin runtime hosts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::error::{TelemetryError, TelemetryResult};

/// Target prefix of the runtime crate, used by [`LogConfig::runtime_level`].
const RUNTIME_TARGET: &str = "arbor_runtime";

/// How often a log file is rolled over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRotation {
    /// One file per day.
    #[default]
    Daily,
    /// One file per hour.
    Hourly,
    /// A single file.
    Never,
}

impl FileRotation {
    fn rotation(self) -> Rotation {
        match self {
            Self::Daily => Rotation::DAILY,
            Self::Hourly => Rotation::HOURLY,
            Self::Never => Rotation::NEVER,
        }
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented.
    #[default]
    Pretty,
    /// One short line per event.
    Compact,
    /// One JSON object per event, fields flattened.
    Json,
    /// One line per event with every span field.
    Full,
}

impl LogFormat {
    /// Parse the name used in the `[logging]` config section.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "pretty" => Self::Pretty,
            "compact" => Self::Compact,
            "json" => Self::Json,
            "full" => Self::Full,
            _ => return None,
        })
    }
}

/// Where log lines go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// Standard error.
    #[default]
    Stderr,
    /// Rolling files `{dir}/{prefix}.{date}`, written off-thread.
    File {
        /// Directory holding the files; created if missing.
        dir: PathBuf,
        /// File name prefix.
        prefix: String,
        /// Rollover period.
        #[serde(default)]
        rotation: FileRotation,
    },
}

/// Logging configuration for a host process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base filter, for example `info` or `warn`.
    pub level: String,
    /// Separate level for the runtime's own events (node lifecycle, reloads).
    #[serde(default)]
    pub runtime_level: Option<String>,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Output target.
    #[serde(default)]
    pub target: LogTarget,
    /// Colorize output. Forced off for file targets.
    #[serde(default = "default_ansi")]
    pub ansi: bool,
    /// Include the source file and line of each event.
    #[serde(default)]
    pub source_location: bool,
    /// Extra `EnvFilter` directives, applied last.
    #[serde(default)]
    pub directives: Vec<String>,
}

fn default_ansi() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info")
    }
}

impl From<&arbor_config::LoggingSection> for LogConfig {
    fn from(section: &arbor_config::LoggingSection) -> Self {
        let mut config = Self::new(section.level.clone());
        config.format = LogFormat::from_name(&section.format).unwrap_or_default();
        config.directives.clone_from(&section.directives);
        config
    }
}

impl LogConfig {
    /// Stderr, pretty format, at `level`.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            runtime_level: None,
            format: LogFormat::default(),
            target: LogTarget::default(),
            ansi: true,
            source_location: false,
            directives: Vec::new(),
        }
    }

    /// Use `format`.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Log to standard output instead of standard error.
    #[must_use]
    pub fn with_stdout(mut self) -> Self {
        self.target = LogTarget::Stdout;
        self
    }

    /// Log to rolling files under `dir`.
    #[must_use]
    pub fn with_rolling_files(
        mut self,
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        rotation: FileRotation,
    ) -> Self {
        self.target = LogTarget::File {
            dir: dir.into(),
            prefix: prefix.into(),
            rotation,
        };
        self.ansi = false;
        self
    }

    /// Log the runtime's own events at `level`, independent of the base level.
    #[must_use]
    pub fn with_runtime_level(mut self, level: impl Into<String>) -> Self {
        self.runtime_level = Some(level.into());
        self
    }

    /// Append a raw `EnvFilter` directive.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Include source locations.
    #[must_use]
    pub fn with_source_location(mut self) -> Self {
        self.source_location = true;
        self
    }

    fn filter(&self) -> TelemetryResult<EnvFilter> {
        let runtime = self
            .runtime_level
            .as_ref()
            .map(|level| format!("{RUNTIME_TARGET}={level}"));

        let mut filter =
            EnvFilter::try_new(&self.level).map_err(|e| TelemetryError::Filter(e.to_string()))?;
        for directive in runtime.iter().chain(&self.directives) {
            let parsed = directive
                .parse()
                .map_err(|e: tracing_subscriber::filter::ParseError| {
                    TelemetryError::Filter(format!("{directive}: {e}"))
                })?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }

    /// Open the configured target. File targets come with a flush guard.
    fn writer(&self) -> TelemetryResult<(BoxMakeWriter, Option<WorkerGuard>)> {
        match &self.target {
            LogTarget::Stdout => Ok((BoxMakeWriter::new(std::io::stdout), None)),
            LogTarget::Stderr => Ok((BoxMakeWriter::new(std::io::stderr), None)),
            LogTarget::File {
                dir,
                prefix,
                rotation,
            } => {
                std::fs::create_dir_all(dir).map_err(|source| TelemetryError::LogDir {
                    path: dir.clone(),
                    source,
                })?;
                let appender = RollingFileAppender::new(rotation.rotation(), dir, prefix);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                Ok((BoxMakeWriter::new(writer), Some(guard)))
            },
        }
    }

    fn layer(&self, writer: BoxMakeWriter) -> Box<dyn Layer<Registry> + Send + Sync> {
        let ansi = self.ansi && !matches!(self.target, LogTarget::File { .. });
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_file(self.source_location)
            .with_line_number(self.source_location);
        match self.format {
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().flatten_event(true).boxed(),
            LogFormat::Full => layer.boxed(),
        }
    }
}

/// Keeps the background log writer alive. Drop it last, on shutdown.
#[derive(Debug)]
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for a bad level or directive,
/// [`TelemetryError::LogDir`] if the log directory cannot be created, and
/// [`TelemetryError::Install`] if a subscriber is already installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<LogGuard> {
    let filter = config.filter()?;
    let (writer, worker) = config.writer()?;

    tracing_subscriber::registry()
        .with(config.layer(writer))
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::Install(e.to_string()))?;
    Ok(LogGuard { _worker: worker })
}

/// Install the default subscriber: `info`, stderr, pretty.
///
/// # Errors
///
/// Returns [`TelemetryError::Install`] if a subscriber is already installed.
pub fn setup_default_logging() -> TelemetryResult<LogGuard> {
    setup_logging(&LogConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.target, LogTarget::Stderr);
        assert!(config.ansi);
        assert!(config.runtime_level.is_none());
    }

    #[test]
    fn test_file_target_turns_off_colors() {
        let config = LogConfig::new("info").with_rolling_files("/var/log/arbor", "host", FileRotation::Hourly);
        assert_eq!(
            config.target,
            LogTarget::File {
                dir: PathBuf::from("/var/log/arbor"),
                prefix: "host".into(),
                rotation: FileRotation::Hourly,
            }
        );
        assert!(!config.ansi);
    }

    #[test]
    fn test_runtime_level_becomes_a_directive() {
        let config = LogConfig::new("warn").with_runtime_level("debug");
        let rendered = config.filter().unwrap().to_string();
        assert!(rendered.contains("arbor_runtime=debug"), "{rendered}");
    }

    #[test]
    fn test_bad_directive_is_reported() {
        let err = LogConfig::new("info")
            .with_directive("arbor_runtime=[oops")
            .filter()
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Filter(ref msg) if msg.contains("oops")));
    }

    #[test]
    fn test_from_logging_section() {
        let section = arbor_config::LoggingSection {
            level: "debug".into(),
            format: "json".into(),
            directives: vec!["arbor_runtime::reload=trace".into()],
        };
        let config = LogConfig::from(&section);
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.directives, section.directives);

        let unknown = arbor_config::LoggingSection {
            format: "xml".into(),
            ..arbor_config::LoggingSection::default()
        };
        assert_eq!(LogConfig::from(&unknown).format, LogFormat::Pretty);
    }

    #[test]
    fn test_target_serializes_with_kind_tag() {
        let config = LogConfig::new("info").with_rolling_files("/tmp/logs", "arbor", FileRotation::Never);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["target"]["kind"], "file");
        assert_eq!(json["target"]["rotation"], "never");

        let back: LogConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_second_install_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let config = LogConfig::new("info").with_rolling_files(&logs, "test", FileRotation::Never);

        // Whether or not the first install wins, the second cannot.
        let _guard = setup_logging(&config);
        assert!(matches!(
            setup_logging(&config),
            Err(TelemetryError::Install(_))
        ));
        assert!(logs.is_dir());
    }
}
