use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use log::Record;
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// Logger that fans records out to the targets listed in the `logging` config section.
pub struct CustomLogger {
    targets: Vec<LogTarget>,
    format: LogFormat,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let format = config.format.unwrap_or_default();
        let default_level = config.level.unwrap_or_default();
        let mut targets = config.targets.unwrap_or_default();
        if targets.is_empty() {
            targets.push(LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            });
        }

        let mut writers = Vec::new();
        for target in &mut targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or("File output type requires path")?;
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    Box::new(file)
                }
            };
            // targets without their own level inherit the global one
            target.level.get_or_insert_with(|| default_level.clone());
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self { targets, format, writers })
    }

    pub fn init(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
        let logger = Self::new(config)?;
        let max_level = logger.max_level();
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn max_level(&self) -> log::LevelFilter {
        self.targets
            .iter()
            .map(|t| t.level.as_ref().map_or(log::LevelFilter::Trace, LogLevel::as_filter))
            .max()
            .unwrap_or(log::LevelFilter::Info)
    }

    fn target_accepts(target: &LogTarget, level: log::Level) -> bool {
        target
            .level
            .as_ref()
            .is_none_or(|target_level| level <= target_level.as_filter())
    }

    fn format_record(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        match self.format {
            LogFormat::Text => format!(
                "{} [{}] [{}] {}",
                timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level().to_string().to_uppercase(),
                record.target(),
                record.args()
            ),
            LogFormat::Json => json_line(record, timestamp),
        }
    }
}

fn json_line(record: &Record, timestamp: DateTime<Utc>) -> String {
    json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "line": record.line().unwrap_or(0),
        "message": record.args().to_string(),
    })
    .to_string()
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.targets
            .iter()
            .any(|target| Self::target_accepts(target, metadata.level()))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = self.format_record(record);
        for (target, writer) in self.targets.iter().zip(&self.writers) {
            if Self::target_accepts(target, record.level()) {
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

// env_logger is used when the config file has no logging section
pub fn init_fallback(log_level: Option<&str>, log_format: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let level = log_level.unwrap_or("info");
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if log_format == Some("json") {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(record, Utc::now())));
    }

    builder.try_init()?;
    Ok(())
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s).into()),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s).into()),
    }
}
