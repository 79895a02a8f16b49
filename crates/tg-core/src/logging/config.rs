//! Logging configuration.
//!
//! Level resolution order, highest first:
//! - CLI flag (`--log-level`)
//! - `TG_LOG`
//! - `RUST_LOG`
//! - `[Logging]` section of the config file
//! - `info`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tg_config::FileLogLevel;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console format (default).
    #[default]
    Human,
    /// Machine-parseable JSON lines.
    Jsonl,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" | "console" | "pretty" => Ok(LogFormat::Human),
            "jsonl" | "json" => Ok(LogFormat::Jsonl),
            _ => Err(format!("unknown log format: {}", s)),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Jsonl => write!(f, "jsonl"),
        }
    }
}

/// Log level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Completely silent.
    Off,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" | "alert" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "off" | "none" | "quiet" => Ok(LogLevel::Off),
            _ => Err(format!("unknown log level: {}", s)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Off => write!(f, "off"),
        }
    }
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        use tracing_subscriber::filter::LevelFilter;
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

impl LogLevel {
    /// Map the config file's level vocabulary. `enabled == false` means off.
    pub fn from_file(level: FileLogLevel, enabled: bool) -> Self {
        if !enabled {
            return LogLevel::Off;
        }
        match level {
            FileLogLevel::Error => LogLevel::Error,
            FileLogLevel::Alert => LogLevel::Warn,
            FileLogLevel::Info => LogLevel::Info,
            FileLogLevel::Debug => LogLevel::Debug,
        }
    }
}

/// Where the configured level came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelSource {
    Cli,
    Env,
    ConfigFile,
    Default,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    pub level_source: LevelSource,
    /// Raw `RUST_LOG`/`TG_LOG` directive, passed to `EnvFilter` as-is.
    pub directive: Option<String>,
    /// Rotating log file; stderr when `None`.
    pub file: Option<PathBuf>,
    pub max_file_bytes: u64,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Human,
            level: LogLevel::Info,
            level_source: LevelSource::Default,
            directive: None,
            file: None,
            max_file_bytes: super::rotate::DEFAULT_MAX_BYTES,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Resolve from the process environment.
    pub fn from_env(cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self {
        Self::resolve(|key| std::env::var(key).ok(), cli_level, cli_format)
    }

    /// Resolve against an arbitrary environment lookup.
    pub fn resolve(
        env: impl Fn(&str) -> Option<String>,
        cli_level: Option<LogLevel>,
        cli_format: Option<LogFormat>,
    ) -> Self {
        let mut config = LogConfig::default();

        if let Some(val) = env("TG_LOG") {
            match val.parse::<LogLevel>() {
                Ok(level) => config.level = level,
                Err(_) => config.directive = Some(val),
            }
            config.level_source = LevelSource::Env;
        } else if let Some(val) = env("RUST_LOG") {
            config.directive = Some(val);
            config.level_source = LevelSource::Env;
        }

        if let Some(format) = env("TG_LOG_FORMAT").and_then(|v| v.parse().ok()) {
            config.format = format;
        }

        if let Some(level) = cli_level {
            config.level = level;
            config.level_source = LevelSource::Cli;
            config.directive = None;
        }
        if let Some(format) = cli_format {
            config.format = format;
        }
        config
    }

    /// Whether the config file is allowed to set the level.
    pub fn file_level_applies(&self) -> bool {
        matches!(
            self.level_source,
            LevelSource::Default | LevelSource::ConfigFile
        )
    }

    /// Apply the config file's `[Logging]` section if nothing stronger set
    /// the level.
    pub fn with_file_level(mut self, level: FileLogLevel, enabled: bool) -> Self {
        if self.file_level_applies() {
            self.level = LogLevel::from_file(level, enabled);
            self.level_source = LevelSource::ConfigFile;
        }
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_file(mut self, path: Option<PathBuf>) -> Self {
        self.file = path;
        self
    }

    /// The `EnvFilter` directive string for this config.
    pub fn filter_directive(&self) -> String {
        match &self.directive {
            Some(d) => d.clone(),
            None => format!("tg_core={0},tg_config={0},tgd={0}", self.level),
        }
    }
}
