use anyhow::Result;
use std::io::Write;
use log::{LevelFilter, Record};
use std::fs::OpenOptions;
use std::path::Path;
use chrono::{DateTime, Local};

// Logging and small helpers for the console driver.

pub struct SimpleLogger {
    log_file: Option<std::fs::File>,
}

impl SimpleLogger {
    pub fn new(log_file_path: Option<&Path>) -> Result<Self> {
        let log_file = if let Some(path) = log_file_path {
            Some(OpenOptions::new().create(true).append(true).open(path)?)
        } else {
            None
        };

        Ok(SimpleLogger { log_file })
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now: DateTime<Local> = Local::now();
            let log_message = format!(
                "[{}] {} [{}:{}] {}\n",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            );

            if let Some(file) = &self.log_file {
                if let Ok(mut file) = file.try_clone() {
                    let _ = file.write_all(log_message.as_bytes());
                }
            } else {
                print!("{}", log_message);
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.log_file {
            if let Ok(mut file) = file.try_clone() {
                let _ = file.flush();
            }
        } else {
            let _: Result<(), std::io::Error> = std::io::stdout().flush();
        }
    }
}

pub fn setup_logging(log_file: Option<&Path>, level: LevelFilter) -> Result<()> {
    let logger = SimpleLogger::new(log_file)?;
    log::set_boxed_logger(Box::new(logger))
        .map(|()| log::set_max_level(level))?;

    log::info!("Logging initialized at level: {}", level);
    log::info!("App version: {} ({})", env!("CARGO_PKG_VERSION"), env!("CARGO_PKG_NAME"));

    Ok(())
}

/// Best-effort content type from a file extension.
pub fn guess_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
