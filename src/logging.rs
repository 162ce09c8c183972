use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use crate::error::TransportError;
use chrono::{DateTime, Utc};
use log::{LevelFilter, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// Fans log records out to stdout and files, each with its own level.
pub struct TransportLogger {
    level: LevelFilter,
    targets: Vec<LogTarget>,
    format: LogFormat,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl TransportLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, TransportError> {
        let level = level_filter(&config.level.unwrap_or_default());
        let format = config.format.unwrap_or_default();
        let targets = config.targets.unwrap_or_default();

        let mut writers = Vec::new();
        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target
                        .path
                        .as_ref()
                        .ok_or_else(|| TransportError::Config("File output type requires path".to_string()))?;
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    Box::new(file)
                }
            };
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self {
            level,
            targets,
            format,
            writers,
        })
    }

    pub fn init(config: LoggingConfig) -> Result<(), TransportError> {
        let logger = Self::new(config)?;
        let level = logger.level;
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| TransportError::Config(format!("Logger already initialized: {}", e)))?;
        log::set_max_level(level);
        Ok(())
    }

    fn should_log(&self, level: log::Level, target: &LogTarget) -> bool {
        if level > self.level {
            return false;
        }
        match &target.level {
            Some(target_level) => level <= level_filter(target_level),
            None => true,
        }
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level().to_string().to_uppercase(),
            record.target(),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        json_line(record)
    }
}

impl log::Log for TransportLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.targets
            .iter()
            .any(|target| self.should_log(metadata.level(), target))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };

        for (target, writer) in self.targets.iter().zip(&self.writers) {
            if self.should_log(record.level(), target) {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

fn json_line(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let log_entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "message": record.args().to_string(),
    });
    log_entry.to_string()
}

pub fn level_filter(level: &LogLevel) -> LevelFilter {
    match level {
        LogLevel::Trace => LevelFilter::Trace,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Error => LevelFilter::Error,
    }
}

// env_logger when no logging section is configured
pub fn init_fallback(level: &LogLevel, format: &LogFormat) -> Result<(), TransportError> {
    let filter = level_filter(level).to_string();
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter));

    if matches!(format, LogFormat::Json) {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(record)));
    }
    builder
        .try_init()
        .map_err(|e| TransportError::Config(format!("Logger already initialized: {}", e)))
}

/// Level and format for [`init_fallback`] from command line values, with
/// `info` and `text` when a value is absent.
pub fn fallback_options(
    log_level: Option<&str>,
    log_format: Option<&str>,
) -> Result<(LogLevel, LogFormat), TransportError> {
    let level = log_level.map(parse_log_level).transpose()?.unwrap_or_default();
    let format = log_format.map(parse_log_format).transpose()?.unwrap_or_default();
    Ok((level, format))
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, TransportError> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(TransportError::Config(format!(
            "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
            s
        ))),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, TransportError> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(TransportError::Config(format!(
            "Invalid log format: {}. Must be one of: text, json",
            s
        ))),
    }
}
